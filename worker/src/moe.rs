use std::sync::Arc;

use sdk::frame::MoeHeader;
use sdk::pool::AliveThreadPool;
use sdk::quant::{quantize_activation, quantized_sums};
use sdk::Tensor;

use crate::error::ServerError;
use crate::kernels::activation::swiglu_row;
use crate::kernels::{
    launch_float_linear, launch_int_linear, split_bands, QuantizedInput,
};
use crate::registry::WeightStore;

struct Expert {
    gate_up: Arc<Tensor>,
    down: Arc<Tensor>,
    factor: f32,
}

/// Resolve one row's selected experts from interleaved (gate_up, down)
/// names plus mixture factors.
fn resolve_experts(
    store: &WeightStore,
    names: &[String],
    factors: &[f32],
) -> Result<Vec<Expert>, ServerError> {
    if names.len() != factors.len() * 2 {
        return Err(ServerError::config(
            "moe",
            format!("{} weight names for {} factors", names.len(), factors.len()),
        ));
    }
    let mut experts = Vec::with_capacity(factors.len());
    for (i, &factor) in factors.iter().enumerate() {
        let gate_up = store
            .get(&names[i * 2])
            .ok_or_else(|| ServerError::UnknownWeight(names[i * 2].clone()))?;
        let down = store
            .get(&names[i * 2 + 1])
            .ok_or_else(|| ServerError::UnknownWeight(names[i * 2 + 1].clone()))?;
        experts.push(Expert {
            gate_up,
            down,
            factor,
        });
    }
    Ok(experts)
}

/// Pick the packing window `[st, end]`: consecutive experts whose gate_up
/// widths are integer multiples of the first one, such that the total
/// multiplier divides the thread count evenly. Returns (end, per-unit
/// thread count).
fn packing_window(experts: &[Expert], st: usize, threads: usize) -> (usize, usize) {
    let k0 = experts[st].gate_up.rows();
    let mut end = st;
    let mut sel_sum = 1;
    let mut cur_sum = 1;
    for (l, expert) in experts.iter().enumerate().skip(st + 1) {
        let cur_k = expert.gate_up.rows();
        if k0 == 0 || cur_k % k0 != 0 {
            break;
        }
        cur_sum += cur_k / k0;
        if threads % cur_sum == 0 {
            end = l;
            sel_sum = cur_sum;
        }
    }
    (end, threads / sel_sum)
}

enum RowActivation<'a> {
    Quantized {
        data: &'a [u8],
        sums: &'a [f32],
        iscales: &'a [f32],
        izeros: &'a [f32],
        group: usize,
        group_cnt: usize,
    },
    Float(&'a [f32]),
}

/// Run the selected experts for one activation row, accumulating the
/// factor-weighted expert outputs into `out_row` (length k).
fn run_row(
    pool: &AliveThreadPool,
    experts: &[Expert],
    act: &RowActivation,
    m: usize,
    k: usize,
    out_row: &mut [f32],
) -> Result<(), ServerError> {
    let threads = pool.size();
    let mut st = 0;
    while st < experts.len() {
        let (end, base_threads) = packing_window(experts, st, threads);
        let window = &experts[st..=end];
        let k0 = window[0].gate_up.rows();

        // Fused gate_up launch across the window, one quantized activation.
        let mut middles: Vec<Vec<f32>> = window
            .iter()
            .map(|e| vec![0f32; e.gate_up.rows()])
            .collect();
        pool.scope(|s| -> Result<(), ServerError> {
            let mut tid = 0;
            for (expert, mid) in window.iter().zip(middles.iter_mut()) {
                let local_k = expert.gate_up.rows();
                let cur_threads = (local_k / k0.max(1)).max(1) * base_threads;
                let bands = split_bands(mid, 1, local_k, cur_threads);
                match *act {
                    RowActivation::Quantized {
                        data,
                        sums,
                        iscales,
                        izeros,
                        group,
                        group_cnt,
                    } => {
                        launch_int_linear(
                            s,
                            tid,
                            QuantizedInput {
                                data,
                                sums,
                                iscales,
                                izeros,
                                group,
                                group_cnt,
                            },
                            &expert.gate_up,
                            None,
                            bands,
                            1,
                            m,
                        )?;
                    }
                    RowActivation::Float(input) => {
                        launch_float_linear(s, tid, input, &expert.gate_up, None, bands, 1, m)?;
                    }
                }
                tid += cur_threads;
            }
            Ok(())
        })?;

        // SwiGLU, re-quantize the mid activation, then the down projection
        // over the same thread partition.
        let mut results: Vec<Vec<f32>> = window.iter().map(|_| vec![0f32; k]).collect();
        for ((expert, mid), result) in window.iter().zip(&middles).zip(results.iter_mut()) {
            let spatial = expert.gate_up.rows();
            if spatial % 2 != 0 {
                return Err(ServerError::config(
                    "moe",
                    format!("gate_up width {} is odd", spatial),
                ));
            }
            let mid_len = spatial / 2;
            let mut swig = vec![0f32; mid_len];
            swiglu_row(mid, &mut swig);

            let down = &expert.down;
            if down.cols() != mid_len {
                return Err(ServerError::config(
                    "moe",
                    format!(
                        "down shard width {} does not match swiglu width {}",
                        down.cols(),
                        mid_len
                    ),
                ));
            }
            if down.rows() != k {
                return Err(ServerError::config(
                    "moe",
                    format!("down shard rows {} do not match output {}", down.rows(), k),
                ));
            }

            match act {
                RowActivation::Quantized { .. } => {
                    let (gd, gcd) = if down.dtype == sdk::DataType::Int4Group {
                        (down.group, down.group_cnt)
                    } else {
                        (1, mid_len)
                    };
                    let qa = quantize_activation(&swig, 1, mid_len, gd, gcd);
                    pool.scope(|s| -> Result<(), ServerError> {
                        let bands = split_bands(result, 1, k, s.size());
                        launch_int_linear(
                            s,
                            0,
                            QuantizedInput {
                                data: &qa.data,
                                sums: &qa.sums,
                                iscales: &qa.scales,
                                izeros: &qa.zeros,
                                group: gd,
                                group_cnt: gcd,
                            },
                            down,
                            None,
                            bands,
                            1,
                            mid_len,
                        )
                    })?;
                }
                RowActivation::Float(_) => {
                    pool.scope(|s| -> Result<(), ServerError> {
                        let bands = split_bands(result, 1, k, s.size());
                        launch_float_linear(s, 0, &swig, down, None, bands, 1, mid_len)
                    })?;
                }
            }
        }

        for (expert, result) in window.iter().zip(&results) {
            for (o, r) in out_row.iter_mut().zip(result) {
                *o += expert.factor * r;
            }
        }

        st = end + 1;
    }
    Ok(())
}

/// Execute a MoE request: per row, run the selected experts and sum their
/// weighted outputs. Returns the `[n, k]` partial this worker contributes;
/// the client reduces partials elementwise.
pub(crate) fn run_moe(
    pool: &AliveThreadPool,
    store: &WeightStore,
    header: &MoeHeader,
    iscales: &[f32],
    izeros: &[f32],
    payload: &[u8],
    quantized: bool,
) -> Result<Vec<f32>, ServerError> {
    let (n, m, k) = (header.n, header.m, header.k);
    let group = header.group.max(1);
    let group_cnt = if header.group_cnt == 0 {
        m
    } else {
        header.group_cnt
    };

    let float_input: Vec<f32>;
    let sums: Vec<f32>;
    if quantized {
        float_input = Vec::new();
        sums = quantized_sums(payload, n, m, group, group_cnt);
    } else {
        float_input = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        sums = Vec::new();
    }

    let mut output = vec![0f32; n * k];
    for o in 0..n {
        let (names, factors) = if header.rows.is_empty() {
            if n != 1 {
                return Err(ServerError::config(
                    "moe",
                    format!("{} rows but a single expert selection", n),
                ));
            }
            (&header.weights, &header.factors)
        } else {
            if header.rows.len() != n {
                return Err(ServerError::config(
                    "moe",
                    format!("{} row selections for {} rows", header.rows.len(), n),
                ));
            }
            (&header.rows[o].weights, &header.rows[o].factors)
        };
        let experts = resolve_experts(store, names, factors)?;
        if experts.is_empty() {
            continue;
        }

        let act = if quantized {
            RowActivation::Quantized {
                data: &payload[o * m..(o + 1) * m],
                sums: &sums[o * group..(o + 1) * group],
                iscales: &iscales[o * group..(o + 1) * group],
                izeros: &izeros[o * group..(o + 1) * group],
                group,
                group_cnt,
            }
        } else {
            RowActivation::Float(&float_input[o * m..(o + 1) * m])
        };

        run_row(
            pool,
            &experts,
            &act,
            m,
            k,
            &mut output[o * k..(o + 1) * k],
        )?;
    }
    Ok(output)
}
