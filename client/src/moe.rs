use sdk::dtype::DataType;
use sdk::frame::{write_json_header, FrameWriter, MoeHeader, MoeRow};
use sdk::quant::quantize_activation;
use sdk::task::TaskCode;

use crate::client::NumaClient;
use crate::error::ClientError;

/// One expert's weight pair as registered with the workers.
#[derive(Clone, Debug)]
pub struct MoeExpert {
    pub gate_up: String,
    pub down: String,
}

/// A MoE invocation. `experts[0]` is the shared expert (may be absent);
/// `experts[1..]` line up with the routing logit channels.
pub struct MoeRequest<'a> {
    pub experts: &'a [Option<MoeExpert>],
    /// Routing logits, `[n, channels]`.
    pub logits: &'a [f32],
    pub gate_bias: Option<&'a [f32]>,
    pub topk: usize,
    pub need_norm: bool,
    pub shared_scale: f32,
    pub route_scale: f32,
    pub m: usize,
    pub k: usize,
    /// Activation grouping for the quantized path, mirrored from the
    /// expert weights.
    pub group: usize,
    pub group_cnt: usize,
    pub quantized: bool,
}

impl NumaClient {
    /// Select experts per row, post the MoE task, and sum the per-worker
    /// partials elementwise.
    pub fn moe(&self, req: &MoeRequest, input: &[f32], n: usize) -> Result<Vec<f32>, ClientError> {
        let channels = req.experts.len().saturating_sub(1);
        if req.logits.len() != n * channels {
            return Err(ClientError::config(
                "moe",
                format!("{} logits for {} rows x {} channels", req.logits.len(), n, channels),
            ));
        }
        if req.topk == 0 || req.topk > channels {
            return Err(ClientError::config(
                "moe",
                format!("topk {} over {} channels", req.topk, channels),
            ));
        }

        let mut rows = Vec::with_capacity(n);
        for o in 0..n {
            rows.push(self.select_row(req, o, channels)?);
        }

        let (group, group_cnt) = if req.quantized {
            (req.group.max(1), req.group_cnt.max(1))
        } else {
            (1, req.m)
        };
        let mut header = MoeHeader {
            op: "moe".to_string(),
            n,
            m: req.m,
            k: req.k,
            group,
            group_cnt,
            output_type: DataType::Float32 as u32,
            factors: Vec::new(),
            weights: Vec::new(),
            rows: Vec::new(),
        };
        if n == 1 {
            let row = rows.pop().expect("one row");
            header.weights = row.weights;
            header.factors = row.factors;
        } else {
            header.rows = rows;
        }

        let mut w = FrameWriter::new();
        write_json_header(&mut w, &header)?;
        let task = if req.quantized {
            let qa = quantize_activation(input, n, req.m, group, group_cnt);
            for c in &qa.configs {
                w.write_f32(c.min);
                w.write_f32(c.max);
            }
            w.write_bytes(&qa.data);
            TaskCode::MoeInt
        } else {
            for &v in input {
                w.write_f32(v);
            }
            TaskCode::MoeFloat
        };

        self.mailbox.write_input(&w.into_bytes())?;
        self.mailbox.kick_all(task)?;
        self.mailbox.wait_all()?;
        self.reduce_partials(n, req.k)
    }

    /// Top-k expert selection for one row: bias-subtract, negate, partition
    /// around the k-th element, then normalize and scale the kept logits.
    /// The shared expert rides along with its own scale.
    fn select_row(
        &self,
        req: &MoeRequest,
        o: usize,
        channels: usize,
    ) -> Result<MoeRow, ClientError> {
        let logits = &req.logits[o * channels..(o + 1) * channels];
        let mut keyed: Vec<(f32, usize)> = (0..channels)
            .map(|j| {
                let bias = req.gate_bias.map_or(0.0, |b| b[j]);
                (-(logits[j] + bias), j)
            })
            .collect();
        if req.topk < channels {
            keyed.select_nth_unstable_by(req.topk - 1, |a, b| {
                a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        let selected = &keyed[..req.topk];

        let sum = if req.need_norm {
            selected.iter().map(|&(_, j)| logits[j]).sum::<f32>()
        } else {
            1.0
        };

        let mut row = MoeRow {
            weights: Vec::new(),
            factors: Vec::new(),
        };
        let mut push = |expert: &Option<MoeExpert>, factor: f32| {
            if let Some(e) = expert {
                row.weights.push(e.gate_up.clone());
                row.weights.push(e.down.clone());
                row.factors.push(factor);
            }
        };
        for &(_, j) in selected {
            push(&req.experts[j + 1], logits[j] / sum * req.route_scale);
        }
        push(&req.experts[0], req.shared_scale);

        if row.factors.is_empty() {
            return Err(ClientError::config("moe", "no experts resolved for row"));
        }
        Ok(row)
    }
}
