use sdk::pool::PoolScope;
use sdk::Tensor;

use super::Band;

/// U8 activation × INT4 weight, no-zero grid, optionally grouped along the
/// input-channel axis. The ungrouped family runs with `group == 1` and
/// `group_cnt == m`.
///
/// Per (row, group): with activation `a = scale_a·(Qa − zero_a)` and weight
/// `w = min_w + scale_w·Qw`,
/// `C += scale_a · (min_w·(ΣQa − zero_a·gc) + scale_w·(Qa·Qw − zero_a·ΣQw))`
///
/// `mins`/`scales`/`wsums` run over `(local row, group)`; `isums`/`iscales`/
/// `izeros` over `(activation row, group)`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn launch_u8_i4<'e>(
    s: &PoolScope<'_, 'e>,
    tid_base: usize,
    a: &'e [u8],
    b: &'e [u8],
    wsums: &'e [i32],
    mins: &'e [f32],
    scales: &'e [f32],
    bias: Option<&'e [f32]>,
    isums: &'e [f32],
    iscales: &'e [f32],
    izeros: &'e [f32],
    bands: Vec<Band<'e>>,
    n: usize,
    m: usize,
    group: usize,
    group_cnt: usize,
) {
    let row_bytes = m / 2;
    for (i, band) in bands.into_iter().enumerate() {
        s.push(tid_base + i, move || {
            for j in band.st..band.end {
                let wrow = &b[j * row_bytes..(j + 1) * row_bytes];
                let bj = bias.map_or(0.0, |b| b[j]);
                for r in 0..n {
                    let arow = &a[r * m..(r + 1) * m];
                    let mut acc = bj;
                    for g in 0..group {
                        let st = g * group_cnt;
                        let end = ((g + 1) * group_cnt).min(m);
                        let mut dot = 0i32;
                        for jj in st..end {
                            dot += arow[jj] as i32 * Tensor::nibble(wrow, jj) as i32;
                        }
                        let min_w = mins[j * group + g];
                        let scale_w = scales[j * group + g];
                        let wsum = wsums[j * group + g] as f32;
                        let iscale = iscales[r * group + g];
                        let izero = izeros[r * group + g];
                        let isum = isums[r * group + g];
                        let gc = (end - st) as f32;
                        acc += iscale
                            * (min_w * (isum - izero * gc) + scale_w * (dot as f32 - izero * wsum));
                    }
                    band.chunk[(j - band.st) * n + r] = acc;
                }
            }
        });
    }
}
