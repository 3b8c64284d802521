use sdk::dtype::DataType;
use sdk::frame::{ExType, LinearFrame};
use sdk::layout::{shard_range, REGION_NAME};
use sdk::mailbox::Mailbox;
use sdk::quant::quantize_activation;
use sdk::shm::SharedRegion;
use sdk::task::TaskCode;

use crate::error::ClientError;

/// Metadata the client keeps for a registered weight; produced at
/// registration time and consumed when building request frames.
#[derive(Clone, Debug)]
pub struct WeightDesc {
    pub name: String,
    pub bias_name: String,
    pub dtype: DataType,
    /// Logical output channels (rows of the full weight).
    pub k: usize,
    /// Activation quantization grouping, mirrored from the weight.
    pub group: usize,
    pub group_cnt: usize,
}

/// Client end of the compute plane. Owned by the inference engine; issues
/// ops from the inference thread, kicks every worker, waits, reduces.
pub struct NumaClient {
    pub(crate) mailbox: Mailbox,
    version: u32,
}

impl NumaClient {
    /// Map the named POSIX region and probe the server info handshake.
    pub fn connect() -> Result<Self, ClientError> {
        Self::with_region(SharedRegion::open(REGION_NAME)?)
    }

    /// Build a client over an existing region (tests embed workers
    /// in-process and share an anonymous region).
    pub fn with_region(region: SharedRegion) -> Result<Self, ClientError> {
        let mut mailbox = Mailbox::new(region, 1);
        mailbox.kick(0, TaskCode::ServerInfo)?;
        mailbox.wait(0)?;

        let len = mailbox.read_output_u32(0)? as usize;
        let mut buf = vec![0u8; len];
        mailbox.read_output(4, &mut buf)?;
        let info: serde_json::Value = serde_json::from_slice(&buf)
            .map_err(|e| ClientError::Handshake(format!("bad server info: {}", e)))?;
        let version = info["version"].as_u64().unwrap_or(0) as u32;
        let workers = info["numacnt"]
            .as_u64()
            .ok_or_else(|| ClientError::Handshake("server info missing numacnt".to_string()))?
            as usize;
        if workers == 0 {
            return Err(ClientError::Handshake("zero workers".to_string()));
        }
        mailbox.set_workers(workers);
        log::info!("connected to {} workers (server v{})", workers, version);
        Ok(Self { mailbox, version })
    }

    pub fn worker_count(&self) -> usize {
        self.mailbox.workers()
    }

    pub fn server_version(&self) -> u32 {
        self.version
    }

    /// Linear over a registered weight: `output = input · W^T + b`, with an
    /// optional fused activation. The activation is quantized online on the
    /// int-weight path; the result is widened to f32 for the caller.
    pub fn linear(
        &self,
        weight: &WeightDesc,
        input: &[f32],
        n: usize,
        m: usize,
        ex: ExType,
        out_dtype: DataType,
    ) -> Result<Vec<f32>, ClientError> {
        if !matches!(out_dtype, DataType::Float32 | DataType::Float16) {
            return Err(ClientError::config(
                "linear",
                format!("unsupported output dtype {:?}", out_dtype),
            ));
        }
        if input.len() != n * m {
            return Err(ClientError::config(
                "linear",
                format!("input length {} for {}x{}", input.len(), n, m),
            ));
        }
        if ex == ExType::Swiglu && weight.k % 2 != 0 {
            return Err(ClientError::config(
                "linear",
                format!("swiglu over odd k {}", weight.k),
            ));
        }

        if weight.dtype.is_quantized() {
            let (group, group_cnt) = if weight.dtype == DataType::Int4Group {
                (weight.group, weight.group_cnt)
            } else {
                (1, m)
            };
            let qa = quantize_activation(input, n, m, group, group_cnt);
            let frame = LinearFrame {
                n,
                m,
                k: weight.k,
                group,
                group_cnt,
                weight_name: weight.name.clone(),
                bias_name: weight.bias_name.clone(),
                ex,
                out_dtype,
                configs: qa.configs.iter().map(|c| (c.min, c.max)).collect(),
            };
            self.mailbox.write_input(&frame.encode(&qa.data))?;
            self.mailbox.kick_all(TaskCode::LinearInt)?;
        } else if matches!(
            weight.dtype,
            DataType::Float32 | DataType::Float16 | DataType::Fp8E4M3 | DataType::GgufPacked
        ) {
            let frame = LinearFrame {
                n,
                m,
                k: weight.k,
                group: 1,
                group_cnt: m,
                weight_name: weight.name.clone(),
                bias_name: weight.bias_name.clone(),
                ex,
                out_dtype: DataType::Float32,
                configs: Vec::new(),
            };
            let payload: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
            self.mailbox.write_input(&frame.encode(&payload))?;
            self.mailbox.kick_all(TaskCode::LinearFloat)?;
            self.mailbox.wait_all()?;
            return self.gather_linear(n, weight.k, ex, DataType::Float32);
        } else {
            return Err(ClientError::config(
                "linear",
                format!("unsupported weight dtype {:?}", weight.dtype),
            ));
        }

        self.mailbox.wait_all()?;
        self.gather_linear(n, weight.k, ex, out_dtype)
    }

    /// F16 activation against an F16 weight; the output is decoded from
    /// f16 for the caller.
    pub fn linear_f16(
        &self,
        weight: &WeightDesc,
        input: &[u16],
        n: usize,
        m: usize,
        ex: ExType,
    ) -> Result<Vec<f32>, ClientError> {
        if weight.dtype != DataType::Float16 {
            return Err(ClientError::config(
                "linear",
                format!("f16 activation with {:?} weight", weight.dtype),
            ));
        }
        let frame = LinearFrame {
            n,
            m,
            k: weight.k,
            group: 1,
            group_cnt: m,
            weight_name: weight.name.clone(),
            bias_name: weight.bias_name.clone(),
            ex,
            out_dtype: DataType::Float16,
            configs: Vec::new(),
        };
        let payload: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.mailbox.write_input(&frame.encode(&payload))?;
        self.mailbox.kick_all(TaskCode::LinearFloat)?;
        self.mailbox.wait_all()?;
        self.gather_linear(n, weight.k, ex, DataType::Float16)
    }

    /// Gather per-worker `[n, local]` bands from the output region and
    /// interleave them into the `[n, k_out]` result. Row-sharded outputs
    /// concatenate along the channel axis; no arithmetic reduction.
    fn gather_linear(
        &self,
        n: usize,
        k: usize,
        ex: ExType,
        out_dtype: DataType,
    ) -> Result<Vec<f32>, ClientError> {
        let workers = self.mailbox.workers();
        let swiglu = ex == ExType::Swiglu;
        let k_out = if swiglu { k / 2 } else { k };
        let elem = if out_dtype == DataType::Float16 { 2 } else { 4 };

        let mut out = vec![0f32; n * k_out];
        for w in 0..workers {
            let (base, local) = if swiglu {
                shard_range(k / 2, w, workers)
            } else {
                shard_range(k, w, workers)
            };
            if local == 0 {
                continue;
            }
            let mut band = vec![0u8; n * local * elem];
            self.mailbox.read_output(w * n * k_out * elem, &mut band)?;
            for i in 0..n {
                for j in 0..local {
                    let at = (i * local + j) * elem;
                    out[i * k_out + base + j] = if elem == 2 {
                        half::f16::from_bits(u16::from_le_bytes([band[at], band[at + 1]]))
                            .to_f32()
                    } else {
                        f32::from_le_bytes([band[at], band[at + 1], band[at + 2], band[at + 3]])
                    };
                }
            }
        }
        Ok(out)
    }

    /// Sum per-worker `[n, k]` f32 partials elementwise, the reduction for
    /// column-sharded outputs.
    pub(crate) fn reduce_partials(&self, n: usize, k: usize) -> Result<Vec<f32>, ClientError> {
        let workers = self.mailbox.workers();
        let mut out = vec![0f32; n * k];
        let mut band = vec![0u8; n * k * 4];
        for w in 0..workers {
            self.mailbox.read_output(w * n * k * 4, &mut band)?;
            for (o, chunk) in out.iter_mut().zip(band.chunks_exact(4)) {
                *o += f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        Ok(out)
    }
}
