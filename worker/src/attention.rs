use sdk::pool::AliveThreadPool;

use crate::kvcache::KvCache;

/// Causal attention for one block of consecutive query positions against a
/// single head's K/V storage.
///
/// Block row `r` attends keys `[0, base + r]` inclusive; later positions
/// carry zero weight. Scores are softmaxed online (running max) before the
/// weighted V sum.
#[allow(clippy::too_many_arguments)]
pub fn single_attention_causal(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    out: &mut [f32],
    scale: f32,
    block: usize,
    qdim: usize,
    base: usize,
    vdim: usize,
) {
    let mut scores = Vec::new();
    for r in 0..block {
        let limit = base + r + 1;
        let qrow = &q[r * qdim..(r + 1) * qdim];

        scores.clear();
        scores.reserve(limit);
        let mut max_score = f32::MIN;
        for j in 0..limit {
            let krow = &k[j * qdim..(j + 1) * qdim];
            let dot: f32 = qrow.iter().zip(krow).map(|(a, b)| a * b).sum();
            let s = dot * scale;
            max_score = max_score.max(s);
            scores.push(s);
        }

        let mut sum = 0.0f32;
        for s in scores.iter_mut() {
            *s = (*s - max_score).exp();
            sum += *s;
        }
        let inv = 1.0 / sum;

        let orow = &mut out[r * vdim..(r + 1) * vdim];
        orow.fill(0.0);
        for (j, &p) in scores.iter().enumerate() {
            let vrow = &v[j * vdim..(j + 1) * vdim];
            let w = p * inv;
            for d in 0..vdim {
                orow[d] += w * vrow[d];
            }
        }
    }
}

/// Shape of one attention request after header parsing.
pub struct AttentionSpec {
    pub qhead: usize,
    pub qlen: usize,
    pub qdim: usize,
    pub vdim: usize,
    pub scale: f32,
    pub group: usize,
    pub klen: usize,
}

/// Query-length tile size.
const BLOCK: usize = 4;

/// Run causal attention over this worker's head slice. `q` is the full
/// `[qhead, qlen, qdim]` tensor; the output is the local
/// `[local_heads, qlen, vdim]` slice starting at `start_head`.
///
/// Work is tiled into blocks of four query positions and dispatched onto
/// the pool in waves of pool width.
#[allow(clippy::too_many_arguments)]
pub fn run_attention(
    pool: &AliveThreadPool,
    q: &[f32],
    kcache: &KvCache,
    vcache: &KvCache,
    spec: &AttentionSpec,
    start_head: usize,
    local_heads: usize,
    kv_head_start: usize,
) -> Vec<f32> {
    let mut out = vec![0f32; local_heads * spec.qlen * spec.vdim];

    struct Item<'a> {
        q: &'a [f32],
        k: &'a [f32],
        v: &'a [f32],
        out: &'a mut [f32],
        base: usize,
        block: usize,
    }

    let mut items: Vec<Item> = Vec::new();
    for (h, head_out) in out.chunks_mut(spec.qlen * spec.vdim).enumerate() {
        let o = start_head + h;
        let kv_local = o / spec.group - kv_head_start;
        let k = kcache.head(kv_local);
        let v = vcache.head(kv_local);
        let mut block_outs = head_out.chunks_mut(BLOCK * spec.vdim);
        let mut i = 0;
        while i < spec.qlen {
            let cur = BLOCK.min(spec.qlen - i);
            items.push(Item {
                q: &q[(o * spec.qlen + i) * spec.qdim..(o * spec.qlen + i + cur) * spec.qdim],
                k,
                v,
                out: block_outs.next().expect("block count matches tiling"),
                base: spec.klen - spec.qlen + i,
                block: cur,
            });
            i += cur;
        }
    }

    // Waves of pool width.
    let width = pool.size();
    let mut queue = items.into_iter();
    loop {
        let wave: Vec<Item> = queue.by_ref().take(width).collect();
        if wave.is_empty() {
            break;
        }
        let scale = spec.scale;
        let qdim = spec.qdim;
        let vdim = spec.vdim;
        pool.scope(|s| {
            for (tid, item) in wave.into_iter().enumerate() {
                s.push(tid, move || {
                    single_attention_causal(
                        item.q, item.k, item.v, item.out, scale, item.block, qdim, item.base, vdim,
                    );
                });
            }
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scalar reference: causal softmax attention for one head.
    fn reference(q: &[f32], k: &[f32], v: &[f32], qlen: usize, klen: usize, d: usize, scale: f32) -> Vec<f32> {
        let mut out = vec![0f32; qlen * d];
        for i in 0..qlen {
            let limit = klen - qlen + i + 1;
            let mut weights = vec![0f32; limit];
            for j in 0..limit {
                let dot: f32 = (0..d).map(|x| q[i * d + x] * k[j * d + x]).sum();
                weights[j] = (dot * scale).exp();
            }
            let sum: f32 = weights.iter().sum();
            for j in 0..limit {
                for x in 0..d {
                    out[i * d + x] += weights[j] / sum * v[j * d + x];
                }
            }
        }
        out
    }

    #[test]
    fn test_block_matches_reference() {
        let qlen = 3;
        let klen = 3;
        let d = 2;
        let q = vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let k = vec![1.0, 0.0, 0.0, 1.0, 0.5, 0.5];
        let v = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

        let mut out = vec![0f32; qlen * d];
        single_attention_causal(&q, &k, &v, &mut out, 1.0, qlen, d, klen - qlen, d);
        let expect = reference(&q, &k, &v, qlen, klen, d, 1.0);
        for (a, b) in out.iter().zip(&expect) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_causal_mask_zeroes_future() {
        // With orthonormal rows, position 0 may only see key 0: its output
        // must equal V row 0 exactly regardless of later rows.
        let d = 2;
        let q = vec![1.0, 0.0, 0.0, 1.0];
        let k = vec![1.0, 0.0, 0.0, 1.0];
        let v = vec![7.0, 8.0, 100.0, 200.0];

        let mut out = vec![0f32; 2 * d];
        single_attention_causal(&q, &k, &v, &mut out, 1.0, 2, d, 0, d);
        assert_eq!(&out[0..2], &[7.0, 8.0]);
    }

    #[test]
    fn test_run_attention_tiles_long_queries() {
        // qlen > BLOCK exercises the tiling; single head, group 1.
        let qlen = 6;
        let d = 2;
        let mut kcache = KvCache::new(1, d);
        let mut vcache = KvCache::new(1, d);
        let kdata: Vec<f32> = (0..qlen * d).map(|i| (i as f32 * 0.3).sin()).collect();
        let vdata: Vec<f32> = (0..qlen * d).map(|i| i as f32).collect();
        kcache.append(qlen, &kdata);
        vcache.append(qlen, &vdata);

        let q: Vec<f32> = (0..qlen * d).map(|i| (i as f32 * 0.7).cos()).collect();
        let spec = AttentionSpec {
            qhead: 1,
            qlen,
            qdim: d,
            vdim: d,
            scale: 0.5,
            group: 1,
            klen: qlen,
        };

        let pool = AliveThreadPool::new(2).unwrap();
        let out = run_attention(&pool, &q, &kcache, &vcache, &spec, 0, 1, 0);

        // Reference over the cache's head views (cap-strided copies).
        let kview: Vec<f32> = kcache.head(0)[..qlen * d].to_vec();
        let vview: Vec<f32> = vcache.head(0)[..qlen * d].to_vec();
        let expect = reference(&q, &kview, &vview, qlen, qlen, d, 0.5);
        for (a, b) in out.iter().zip(&expect) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
