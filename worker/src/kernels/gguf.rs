use sdk::dtype::GgufKind;
use sdk::pool::PoolScope;

use super::float::f16_to_f32;
use super::Band;

/// Dot of one block-packed row against an f32 activation row.
///
/// Q8_0 blocks: f16 scale then 32 i8 values, `v = d·q`.
/// Q4_0 blocks: f16 scale then 16 nibble bytes; element `j` sits in the low
/// nibble of byte `j` and element `j+16` in the high nibble, `v = d·(q−8)`.
pub fn dot_packed_row(kind: GgufKind, row: &[u8], activation: &[f32]) -> f32 {
    let block_len = kind.block_len();
    let block_bytes = kind.block_bytes();
    debug_assert_eq!(activation.len() % block_len, 0);
    debug_assert_eq!(row.len(), (activation.len() / block_len) * block_bytes);

    let mut acc = 0.0f32;
    for (bi, block) in row.chunks_exact(block_bytes).enumerate() {
        let d = f16_to_f32(u16::from_le_bytes([block[0], block[1]]));
        let a = &activation[bi * block_len..(bi + 1) * block_len];
        match kind {
            GgufKind::Q8_0 => {
                let mut dot = 0.0f32;
                for (j, &q) in block[2..].iter().enumerate() {
                    dot += a[j] * (q as i8) as f32;
                }
                acc += d * dot;
            }
            GgufKind::Q4_0 => {
                let mut dot = 0.0f32;
                for (j, &byte) in block[2..].iter().enumerate() {
                    dot += a[j] * ((byte & 0x0F) as f32 - 8.0);
                    dot += a[j + 16] * ((byte >> 4) as f32 - 8.0);
                }
                acc += d * dot;
            }
        }
    }
    acc
}

/// F32 activation × block-packed weight rows.
#[allow(clippy::too_many_arguments)]
pub(crate) fn launch_f32_gguf<'e>(
    s: &PoolScope<'_, 'e>,
    tid_base: usize,
    kind: GgufKind,
    input: &'e [f32],
    weight: &'e [u8],
    bias: Option<&'e [f32]>,
    bands: Vec<Band<'e>>,
    n: usize,
    m: usize,
) {
    let row_bytes = kind.row_bytes(m);
    for (i, band) in bands.into_iter().enumerate() {
        s.push(tid_base + i, move || {
            for j in band.st..band.end {
                let wrow = &weight[j * row_bytes..(j + 1) * row_bytes];
                let b = bias.map_or(0.0, |b| b[j]);
                for r in 0..n {
                    let arow = &input[r * m..(r + 1) * m];
                    band.chunk[(j - band.st) * n + r] = dot_packed_row(kind, wrow, arow) + b;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_q8_0(values: &[f32], d: f32) -> Vec<u8> {
        let mut out = Vec::new();
        for block in values.chunks(32) {
            out.extend_from_slice(&half::f16::from_f32(d).to_bits().to_le_bytes());
            for &v in block {
                out.push(((v / d).round() as i8) as u8);
            }
        }
        out
    }

    fn pack_q4_0(values: &[f32], d: f32) -> Vec<u8> {
        let mut out = Vec::new();
        for block in values.chunks(32) {
            out.extend_from_slice(&half::f16::from_f32(d).to_bits().to_le_bytes());
            for j in 0..16 {
                let lo = ((block[j] / d).round() + 8.0) as u8 & 0x0F;
                let hi = ((block[j + 16] / d).round() + 8.0) as u8 & 0x0F;
                out.push(lo | (hi << 4));
            }
        }
        out
    }

    #[test]
    fn test_q8_0_dot() {
        let values: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0) * 0.25).collect();
        let row = pack_q8_0(&values, 0.25);
        let activation = vec![1.0f32; 32];
        let got = dot_packed_row(GgufKind::Q8_0, &row, &activation);
        let expect: f32 = values.iter().sum();
        assert!((got - expect).abs() < 1e-2);
    }

    #[test]
    fn test_q4_0_dot() {
        let values: Vec<f32> = (0..32).map(|i| ((i % 15) as f32 - 7.0) * 0.5).collect();
        let row = pack_q4_0(&values, 0.5);
        let activation: Vec<f32> = (0..32).map(|i| (i as f32 * 0.1).sin()).collect();
        let got = dot_packed_row(GgufKind::Q4_0, &row, &activation);
        let expect: f32 = values.iter().zip(&activation).map(|(v, a)| v * a).sum();
        assert!((got - expect).abs() < 0.05);
    }
}
