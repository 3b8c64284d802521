use once_cell::sync::Lazy;

use sdk::pool::PoolScope;

use super::Band;

/// E4M3 decode table, one entry per byte, built once. Exponent bias 7;
/// e == 0 is denormal, e == 15 with full mantissa is NaN.
static FP8_E4M3_TABLE: Lazy<[f32; 256]> = Lazy::new(|| {
    let mut table = [0f32; 256];
    for (bits, slot) in table.iter_mut().enumerate() {
        let sign = if bits & 0x80 != 0 { -1.0f32 } else { 1.0 };
        let e = (bits >> 3) & 0x0F;
        let m = (bits & 0x07) as f32;
        *slot = if e == 0 {
            sign * (m / 8.0) * 2f32.powi(-6)
        } else if e == 15 && bits & 0x07 == 0x07 {
            f32::NAN
        } else {
            sign * (1.0 + m / 8.0) * 2f32.powi(e as i32 - 7)
        };
    }
    table
});

#[inline]
pub fn fp8_to_f32(bits: u8) -> f32 {
    FP8_E4M3_TABLE[bits as usize]
}

/// F32 activation × FP8-E4M3 weight, decoded on the fly.
pub(crate) fn launch_f32_fp8<'e>(
    s: &PoolScope<'_, 'e>,
    tid_base: usize,
    input: &'e [f32],
    weight: &'e [u8],
    bias: Option<&'e [f32]>,
    bands: Vec<Band<'e>>,
    n: usize,
    m: usize,
) {
    for (i, band) in bands.into_iter().enumerate() {
        s.push(tid_base + i, move || {
            for j in band.st..band.end {
                let wrow = &weight[j * m..(j + 1) * m];
                let b = bias.map_or(0.0, |b| b[j]);
                for r in 0..n {
                    let arow = &input[r * m..(r + 1) * m];
                    let mut dot = 0.0f32;
                    for jj in 0..m {
                        dot += arow[jj] * fp8_to_f32(wrow[jj]);
                    }
                    band.chunk[(j - band.st) * n + r] = dot + b;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::split_bands;
    use sdk::AliveThreadPool;

    #[test]
    fn test_fp8_table_spot_values() {
        // 0x38 = e 7, m 0 -> 1.0
        assert_eq!(fp8_to_f32(0x38), 1.0);
        // 0xB8 -> -1.0
        assert_eq!(fp8_to_f32(0xB8), -1.0);
        // 0x40 = e 8, m 0 -> 2.0
        assert_eq!(fp8_to_f32(0x40), 2.0);
        // 0x3C = e 7, m 4 -> 1.5
        assert_eq!(fp8_to_f32(0x3C), 1.5);
        // Zero and NaN ends of the grid.
        assert_eq!(fp8_to_f32(0x00), 0.0);
        assert!(fp8_to_f32(0x7F).is_nan());
        // Denormal: 0x01 -> 2^-9
        assert_eq!(fp8_to_f32(0x01), 2f32.powi(-9));
    }

    #[test]
    fn test_fp8_linear() {
        let n = 1;
        let m = 2;
        let k = 2;
        let input = vec![2.0f32, 3.0];
        // Rows: [1.0, 2.0], [-1.0, 1.5]
        let weight = vec![0x38u8, 0x40, 0xB8, 0x3C];

        let pool = AliveThreadPool::new(2).unwrap();
        let mut out_t = vec![0f32; k * n];
        pool.scope(|s| {
            let bands = split_bands(&mut out_t, n, k, s.size());
            launch_f32_fp8(s, 0, &input, &weight, None, bands, n, m);
        });

        assert_eq!(out_t[0], 2.0 + 6.0);
        assert_eq!(out_t[1], -2.0 + 4.5);
    }
}
