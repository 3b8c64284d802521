pub mod activation;
pub mod float;
pub mod fp8;
pub mod gguf;
pub mod int4;
pub mod int8;

use sdk::dtype::DataType;
use sdk::frame::ExType;
use sdk::mailbox::WorkerPort;
use sdk::pool::{AliveThreadPool, PoolScope};
use sdk::Tensor;

use crate::error::ServerError;
use activation::{gelu, silu};

/// One thread's slice of the transposed `[local_k, n]` accumulator:
/// weight rows `[st, end)` stored contiguously.
pub(crate) struct Band<'a> {
    pub st: usize,
    pub end: usize,
    pub chunk: &'a mut [f32],
}

/// Split the accumulator into per-thread contiguous bands of whole rows.
pub(crate) fn split_bands<'a>(
    out_t: &'a mut [f32],
    n: usize,
    local_k: usize,
    parts: usize,
) -> Vec<Band<'a>> {
    debug_assert_eq!(out_t.len(), local_k * n);
    let parts = parts.min(local_k).max(1);
    let base = local_k / parts;
    let rem = local_k % parts;
    let mut bands = Vec::with_capacity(parts);
    let mut rest = out_t;
    let mut st = 0;
    for i in 0..parts {
        let rows = base + usize::from(i < rem);
        if rows == 0 {
            break;
        }
        let (chunk, tail) = rest.split_at_mut(rows * n);
        rest = tail;
        bands.push(Band {
            st,
            end: st + rows,
            chunk,
        });
        st += rows;
    }
    bands
}

/// Client-quantized activation plus the per-(row, group) metadata the int
/// kernels consume.
#[derive(Clone, Copy)]
pub(crate) struct QuantizedInput<'a> {
    pub data: &'a [u8],
    pub sums: &'a [f32],
    pub iscales: &'a [f32],
    pub izeros: &'a [f32],
    pub group: usize,
    pub group_cnt: usize,
}

/// Launch an int-weight linear over already-split bands. Used directly by
/// the MoE path to pack several expert launches into one scope.
pub(crate) fn launch_int_linear<'e>(
    s: &PoolScope<'_, 'e>,
    tid_base: usize,
    input: QuantizedInput<'e>,
    weight: &'e Tensor,
    bias: Option<&'e [f32]>,
    bands: Vec<Band<'e>>,
    n: usize,
    m: usize,
) -> Result<(), ServerError> {
    match weight.dtype {
        DataType::Int8 => {
            if input.group != 1 {
                return Err(ServerError::config(
                    "linear",
                    format!("int8 weight with activation group {}", input.group),
                ));
            }
            int8::launch_u8_i8(
                s,
                tid_base,
                input.data,
                &weight.data,
                weight.weight_sum(),
                &weight.zeros,
                &weight.scales,
                bias,
                input.sums,
                input.iscales,
                input.izeros,
                bands,
                n,
                m,
            );
        }
        DataType::Int4NoZero => {
            if input.group != 1 {
                return Err(ServerError::config(
                    "linear",
                    format!("int4 no-zero weight with activation group {}", input.group),
                ));
            }
            int4::launch_u8_i4(
                s,
                tid_base,
                input.data,
                &weight.data,
                weight.weight_sum(),
                &weight.mins,
                &weight.scales,
                bias,
                input.sums,
                input.iscales,
                input.izeros,
                bands,
                n,
                m,
                1,
                m,
            );
        }
        DataType::Int4Group => {
            if input.group != weight.group || input.group_cnt != weight.group_cnt {
                return Err(ServerError::config(
                    "linear",
                    format!(
                        "activation groups {}x{} do not match weight groups {}x{}",
                        input.group, input.group_cnt, weight.group, weight.group_cnt
                    ),
                ));
            }
            int4::launch_u8_i4(
                s,
                tid_base,
                input.data,
                &weight.data,
                weight.weight_sum(),
                &weight.mins,
                &weight.scales,
                bias,
                input.sums,
                input.iscales,
                input.izeros,
                bands,
                n,
                m,
                weight.group,
                weight.group_cnt,
            );
        }
        other => {
            return Err(ServerError::config(
                "linear",
                format!("int path with {:?} weight", other),
            ))
        }
    }
    Ok(())
}

/// Launch a float-weight linear over already-split bands.
pub(crate) fn launch_float_linear<'e>(
    s: &PoolScope<'_, 'e>,
    tid_base: usize,
    input: &'e [f32],
    weight: &'e Tensor,
    bias: Option<&'e [f32]>,
    bands: Vec<Band<'e>>,
    n: usize,
    m: usize,
) -> Result<(), ServerError> {
    match weight.dtype {
        DataType::Float32 => {
            float::launch_f32_f32(s, tid_base, input, &weight.data, bias, bands, n, m)
        }
        DataType::Float16 => {
            float::launch_f32_f16(s, tid_base, input, &weight.data, bias, bands, n, m)
        }
        DataType::Fp8E4M3 => {
            fp8::launch_f32_fp8(s, tid_base, input, &weight.data, bias, bands, n, m)
        }
        DataType::GgufPacked => {
            let kind = weight.gguf_kind.ok_or_else(|| {
                ServerError::config("linear", "gguf weight without a registered kind")
            })?;
            gguf::launch_f32_gguf(s, tid_base, kind, input, &weight.data, bias, bands, n, m)
        }
        other => {
            return Err(ServerError::config(
                "linear",
                format!("float path with {:?} weight", other),
            ))
        }
    }
    Ok(())
}

pub(crate) enum LinearActivation<'a> {
    Quantized(QuantizedInput<'a>),
    Float(&'a [f32]),
}

/// Run one linear over the worker's shard into a transposed `[local_k, n]`
/// f32 accumulator, parallel over weight rows.
pub(crate) fn compute_linear(
    pool: &AliveThreadPool,
    act: LinearActivation<'_>,
    weight: &Tensor,
    bias: Option<&[f32]>,
    n: usize,
    m: usize,
    out_t: &mut [f32],
) -> Result<(), ServerError> {
    let local_k = weight.rows();
    debug_assert_eq!(out_t.len(), local_k * n);
    pool.scope(|s| -> Result<(), ServerError> {
        let bands = split_bands(out_t, n, local_k, s.size());
        match act {
            LinearActivation::Float(input) => {
                launch_float_linear(s, 0, input, weight, bias, bands, n, m)
            }
            LinearActivation::Quantized(q) => launch_int_linear(s, 0, q, weight, bias, bands, n, m),
        }
    })
}

/// Convert the transposed accumulator into the worker's output band: apply
/// the fused op, convert to the output dtype, and write at the banded
/// offset `part · n · k_out · size`.
pub(crate) fn stage_linear_output(
    port: &WorkerPort,
    part_id: usize,
    n: usize,
    k: usize,
    local_k: usize,
    ex: ExType,
    out_dtype: DataType,
    out_t: &[f32],
) -> Result<(), ServerError> {
    let (k_out, width) = match ex {
        ExType::Swiglu => {
            if local_k % 2 != 0 {
                return Err(ServerError::config(
                    "linear",
                    format!("swiglu over odd local width {}", local_k),
                ));
            }
            (k / 2, local_k / 2)
        }
        _ => (k, local_k),
    };
    let mid = local_k / 2;

    let value_at = |i: usize, j: usize| -> f32 {
        match ex {
            ExType::None => out_t[j * n + i],
            ExType::Swiglu => silu(out_t[j * n + i]) * out_t[(j + mid) * n + i],
            ExType::Gelu => gelu(out_t[j * n + i]),
            ExType::Silu => silu(out_t[j * n + i]),
        }
    };

    let elem = match out_dtype {
        DataType::Float32 => 4,
        DataType::Float16 => 2,
        other => {
            return Err(ServerError::config(
                "linear",
                format!("unsupported output dtype {:?}", other),
            ))
        }
    };

    let mut band = Vec::with_capacity(n * width * elem);
    for i in 0..n {
        for j in 0..width {
            let v = value_at(i, j);
            match out_dtype {
                DataType::Float32 => band.extend_from_slice(&v.to_le_bytes()),
                DataType::Float16 => {
                    band.extend_from_slice(&half::f16::from_f32(v).to_bits().to_le_bytes())
                }
                _ => unreachable!(),
            }
        }
    }

    let offset = part_id * n * k_out * elem;
    port.write_output(offset, &band)?;
    Ok(())
}
