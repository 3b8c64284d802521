use sdk::pool::PoolScope;

use super::Band;

/// U8 activation × INT8 weight with per-channel asymmetric configs.
///
/// `C = scale_w · scale_a · (Qa·Qw − zero_w·ΣQa − zero_a·ΣQw + zero_a·zero_w·M)`
///
/// `wsums`/`wzeros`/`wscales` run over the local weight rows; `isums`/
/// `iscales`/`izeros` over the activation rows (one group per row on this
/// path).
#[allow(clippy::too_many_arguments)]
pub(crate) fn launch_u8_i8<'e>(
    s: &PoolScope<'_, 'e>,
    tid_base: usize,
    a: &'e [u8],
    b: &'e [u8],
    wsums: &'e [i32],
    wzeros: &'e [f32],
    wscales: &'e [f32],
    bias: Option<&'e [f32]>,
    isums: &'e [f32],
    iscales: &'e [f32],
    izeros: &'e [f32],
    bands: Vec<Band<'e>>,
    n: usize,
    m: usize,
) {
    for (i, band) in bands.into_iter().enumerate() {
        s.push(tid_base + i, move || {
            for j in band.st..band.end {
                let wrow = &b[j * m..(j + 1) * m];
                let bj = bias.map_or(0.0, |b| b[j]);
                for r in 0..n {
                    let arow = &a[r * m..(r + 1) * m];
                    let mut dot = 0i32;
                    for jj in 0..m {
                        dot += arow[jj] as i32 * wrow[jj] as i32;
                    }
                    let value = wscales[j]
                        * iscales[r]
                        * (dot as f32 - wzeros[j] * isums[r] - izeros[r] * wsums[j] as f32
                            + izeros[r] * wzeros[j] * m as f32);
                    band.chunk[(j - band.st) * n + r] = value + bj;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::split_bands;
    use sdk::quant::{quantize_activation, LowBitConfig, QuantKind};
    use sdk::AliveThreadPool;

    #[test]
    fn test_int8_matches_float_reference() {
        let n = 2;
        let m = 8;
        let k = 3;
        let input: Vec<f32> = (0..n * m).map(|i| (i as f32 * 0.37).sin()).collect();
        let wf: Vec<f32> = (0..k * m).map(|i| (i as f32 * 0.81).cos()).collect();

        // Quantize the weight per row.
        let mut wq = vec![0u8; k * m];
        let mut wzeros = vec![0f32; k];
        let mut wscales = vec![0f32; k];
        let mut wsums = vec![0i32; k];
        for j in 0..k {
            let row = &wf[j * m..(j + 1) * m];
            let lo = row.iter().cloned().fold(f32::MAX, f32::min);
            let hi = row.iter().cloned().fold(f32::MIN, f32::max);
            let c = LowBitConfig::new(lo, hi, 8, QuantKind::Asymmetric);
            for jj in 0..m {
                wq[j * m + jj] = c.quantize(row[jj]);
                wsums[j] += wq[j * m + jj] as i32;
            }
            wzeros[j] = c.zero as f32;
            wscales[j] = c.scale;
        }

        let qa = quantize_activation(&input, n, m, 1, m);

        let pool = AliveThreadPool::new(2).unwrap();
        let mut out_t = vec![0f32; k * n];
        pool.scope(|s| {
            let bands = split_bands(&mut out_t, n, k, s.size());
            launch_u8_i8(
                s, 0, &qa.data, &wq, &wsums, &wzeros, &wscales, None, &qa.sums, &qa.scales,
                &qa.zeros, bands, n, m,
            );
        });

        for j in 0..k {
            for r in 0..n {
                let expect: f32 = (0..m).map(|jj| input[r * m + jj] * wf[j * m + jj]).sum();
                let err = (out_t[j * n + r] - expect).abs();
                // Error budget: activation plus weight grid spacing over m terms.
                let budget = (qa.scales[r] + wscales[j]) * m as f32;
                assert!(err <= budget, "err {} > budget {}", err, budget);
            }
        }
    }
}
