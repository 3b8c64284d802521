use once_cell::sync::Lazy;

use sdk::pool::PoolScope;

use super::Band;

/// FP16 decode table; one entry per bit pattern, built once.
static F16_TABLE: Lazy<Vec<f32>> = Lazy::new(|| {
    (0..=u16::MAX)
        .map(|bits| half::f16::from_bits(bits).to_f32())
        .collect()
});

#[inline]
pub fn f16_to_f32(bits: u16) -> f32 {
    F16_TABLE[bits as usize]
}

#[inline]
fn f32_at(bytes: &[u8], idx: usize) -> f32 {
    f32::from_le_bytes([
        bytes[idx * 4],
        bytes[idx * 4 + 1],
        bytes[idx * 4 + 2],
        bytes[idx * 4 + 3],
    ])
}

/// F32 activation × F32 weight rows. `out_t` bands are `[rows, n]`
/// transposed accumulators; bias is the local shard slice.
pub(crate) fn launch_f32_f32<'e>(
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
                let wrow = &weight[j * m * 4..(j + 1) * m * 4];
                let b = bias.map_or(0.0, |b| b[j]);
                for r in 0..n {
                    let arow = &input[r * m..(r + 1) * m];
                    let mut dot = 0.0f32;
                    for jj in 0..m {
                        dot += arow[jj] * f32_at(wrow, jj);
                    }
                    band.chunk[(j - band.st) * n + r] = dot + b;
                }
            }
        });
    }
}

/// F32 activation × F16 weight, decoded on the fly through the table. Also
/// serves the F16×F16 pair once the activation has been widened.
pub(crate) fn launch_f32_f16<'e>(
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
                let wrow = &weight[j * m * 2..(j + 1) * m * 2];
                let b = bias.map_or(0.0, |b| b[j]);
                for r in 0..n {
                    let arow = &input[r * m..(r + 1) * m];
                    let mut dot = 0.0f32;
                    for jj in 0..m {
                        let bits = u16::from_le_bytes([wrow[jj * 2], wrow[jj * 2 + 1]]);
                        dot += arow[jj] * f16_to_f32(bits);
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

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_f16_table_spot_values() {
        assert_eq!(f16_to_f32(half::f16::from_f32(1.0).to_bits()), 1.0);
        assert_eq!(f16_to_f32(half::f16::from_f32(-2.5).to_bits()), -2.5);
        assert_eq!(f16_to_f32(0), 0.0);
    }

    #[test]
    fn test_f32_f32_matches_reference() {
        let n = 2;
        let m = 3;
        let k = 4;
        let input: Vec<f32> = (0..n * m).map(|i| i as f32 * 0.5).collect();
        let weight: Vec<f32> = (0..k * m).map(|i| (i as f32 - 5.0) * 0.25).collect();
        let bias = vec![0.5, -0.5, 1.0, 0.0];
        let wbytes = f32_bytes(&weight);

        let pool = AliveThreadPool::new(3).unwrap();
        let mut out_t = vec![0f32; k * n];
        pool.scope(|s| {
            let bands = split_bands(&mut out_t, n, k, s.size());
            launch_f32_f32(s, 0, &input, &wbytes, Some(&bias), bands, n, m);
        });

        for j in 0..k {
            for r in 0..n {
                let expect: f32 = (0..m)
                    .map(|jj| input[r * m + jj] * weight[j * m + jj])
                    .sum::<f32>()
                    + bias[j];
                assert!((out_t[j * n + r] - expect).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_f32_f16_decodes_weight() {
        let n = 1;
        let m = 4;
        let k = 2;
        let input = vec![1.0f32, 2.0, 3.0, 4.0];
        let wvals = [0.5f32, -1.0, 0.25, 2.0, 1.0, 1.0, -1.0, 0.0];
        let weight: Vec<u8> = wvals
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_bits().to_le_bytes())
            .collect();

        let pool = AliveThreadPool::new(2).unwrap();
        let mut out_t = vec![0f32; k * n];
        pool.scope(|s| {
            let bands = split_bands(&mut out_t, n, k, s.size());
            launch_f32_f16(s, 0, &input, &weight, None, bands, n, m);
        });

        assert!((out_t[0] - (0.5 - 2.0 + 0.75 + 8.0)).abs() < 1e-3);
        assert!((out_t[1] - (1.0 + 2.0 - 3.0)).abs() < 1e-3);
    }

    #[test]
    fn test_more_threads_than_rows() {
        let n = 1;
        let m = 2;
        let k = 2;
        let input = vec![1.0f32, 1.0];
        let wbytes = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);

        let pool = AliveThreadPool::new(8).unwrap();
        let mut out_t = vec![0f32; k * n];
        pool.scope(|s| {
            let bands = split_bands(&mut out_t, n, k, s.size());
            launch_f32_f32(s, 0, &input, &wbytes, None, bands, n, m);
        });
        assert_eq!(out_t, vec![3.0, 7.0]);
    }
}
