use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::json;

use sdk::dtype::DataType;
use sdk::frame::{
    read_json_header, AttentionHeader, FrameReader, LinearFrame, MoeHeader, RegisterHeader,
    MASK_CAUSAL,
};
use sdk::layout::CONTROL_SLOT;
use sdk::mailbox::WorkerPort;
use sdk::pool::AliveThreadPool;
use sdk::quant::{quantized_sums, LowBitConfig, QuantKind};
use sdk::shm::SharedRegion;
use sdk::task::TaskCode;

use crate::attention::{run_attention, AttentionSpec};
use crate::error::ServerError;
use crate::kernels::float::f16_to_f32;
use crate::kernels::{compute_linear, stage_linear_output, LinearActivation, QuantizedInput};
use crate::kvcache::KvStore;
use crate::moe::run_moe;
use crate::registry::{shard_range, WeightStore};

pub const SERVER_VERSION: u32 = 1;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub part_id: usize,
    pub part_cnt: usize,
    pub threads: usize,
    pub kv_idle: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            part_id: 0,
            part_cnt: 1,
            threads: num_cpus::get(),
            kv_idle: Duration::from_secs(120),
        }
    }
}

/// One worker process: owns a shard of every registered weight, a slice of
/// every KV cache, and a thread pool; spins on its flag word and dispatches
/// on the task code.
pub struct ComputeServer {
    config: ServerConfig,
    port: WorkerPort,
    pool: AliveThreadPool,
    weights: WeightStore,
    kv: KvStore,
    long_buffer: Vec<u8>,
}

impl ComputeServer {
    pub fn new(region: SharedRegion, config: ServerConfig) -> Result<Self, ServerError> {
        let port = WorkerPort::new(region, config.part_id)?;
        let pool = AliveThreadPool::new(config.threads)?;
        let weights = WeightStore::new(config.part_id, config.part_cnt);
        let kv = KvStore::new(config.kv_idle);
        log::info!(
            "compute server {}/{} up with {} threads",
            config.part_id,
            config.part_cnt,
            pool.size()
        );
        Ok(Self {
            config,
            port,
            pool,
            weights,
            kv,
            long_buffer: Vec::new(),
        })
    }

    /// Dispatch loop. Spins on the flag; after a second of idling re-checks
    /// the parent pid and exits if reparented to init, after three seconds
    /// yields the CPU. `stop` supports in-process embedding.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), ServerError> {
        let mut last_run = Instant::now();
        let mut parent = parent_pid();
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            let Some(raw) = self.port.poll() else {
                let gap = last_run.elapsed();
                if gap > Duration::from_secs(1) {
                    let current = parent_pid();
                    if current != parent {
                        parent = current;
                        if parent == 1 {
                            log::info!("numa worker {} exit: parent died", self.config.part_id);
                            return Err(ServerError::ParentExited);
                        }
                    }
                }
                if gap > Duration::from_secs(3) {
                    std::thread::yield_now();
                }
                continue;
            };
            last_run = Instant::now();

            let task = TaskCode::from_u32(raw)
                .ok_or(sdk::error::FrameError::UnknownTaskCode(raw))?;
            self.dispatch(task)?;
            self.port.complete();
        }
    }

    /// Process at most one posted task. Used by in-process tests and by
    /// `run`; the dispatch table is closed.
    pub fn dispatch(&mut self, task: TaskCode) -> Result<(), ServerError> {
        match task {
            TaskCode::LinearInt => self.run_linear_int(),
            TaskCode::LinearFloat => self.run_linear_float(),
            TaskCode::MoeInt => self.run_moe_task(true),
            TaskCode::MoeFloat => self.run_moe_task(false),
            TaskCode::AppendKvCache => self.append_kv_cache(),
            TaskCode::Attention => self.attention(),
            TaskCode::ServerInfo => self.send_server_info(),
            TaskCode::FindData => self.find_data(),
            TaskCode::StartLongData => self.receive_long_data(),
            TaskCode::FinishLongData => self.finish_long_data(),
        }
    }

    fn read_linear_frame(&self, with_configs: bool) -> Result<(LinearFrame, Vec<u8>), ServerError> {
        let head = self.port.read_input_vec(0, 40)?;
        let mut r = FrameReader::new(&head);
        let n = r.read_i32()? as usize;
        let m = r.read_i32()? as usize;
        let _k = r.read_i32()?;
        let group = r.read_i32()?.max(1) as usize;
        let _group_cnt = r.read_i32()?;
        let weight_name_len = r.read_i32()? as usize;
        let bias_name_len = r.read_i32()? as usize;
        let _ex = r.read_i32()?;
        let out_dtype = DataType::from_u32(r.read_i32()? as u32)?;

        let config_bytes = if with_configs { n * group * 8 } else { 0 };
        let payload_len = if with_configs {
            n * m
        } else {
            let unit = out_dtype.unit_size().ok_or_else(|| {
                ServerError::config("linear", format!("non-dense activation {:?}", out_dtype))
            })?;
            n * m * unit
        };
        let total = 40 + config_bytes + weight_name_len + bias_name_len + payload_len;

        let bytes = self.port.read_input_vec(0, total)?;
        let mut r = FrameReader::new(&bytes);
        let frame = LinearFrame::decode(&mut r, with_configs)?;
        let payload = r.read_bytes(payload_len)?.to_vec();
        Ok((frame, payload))
    }

    fn shard_bias(&self, name: &str) -> Result<Option<Vec<f32>>, ServerError> {
        if name.is_empty() {
            return Ok(None);
        }
        let bias = self
            .weights
            .get(name)
            .ok_or_else(|| ServerError::UnknownWeight(name.to_string()))?;
        Ok(Some(bias.as_f32()))
    }

    fn run_linear_int(&mut self) -> Result<(), ServerError> {
        let (frame, payload) = self.read_linear_frame(true)?;
        let weight = self
            .weights
            .get(&frame.weight_name)
            .ok_or_else(|| ServerError::UnknownWeight(frame.weight_name.clone()))?;
        let bias = self.shard_bias(&frame.bias_name)?;

        let mut iscales = Vec::with_capacity(frame.configs.len());
        let mut izeros = Vec::with_capacity(frame.configs.len());
        for &(min, max) in &frame.configs {
            let c = LowBitConfig::new(min, max, 8, QuantKind::Asymmetric);
            iscales.push(c.scale);
            izeros.push(c.zero as f32);
        }
        let sums = quantized_sums(&payload, frame.n, frame.m, frame.group, frame.group_cnt);

        let local_k = weight.rows();
        let mut out_t = vec![0f32; local_k * frame.n];
        compute_linear(
            &self.pool,
            LinearActivation::Quantized(QuantizedInput {
                data: &payload,
                sums: &sums,
                iscales: &iscales,
                izeros: &izeros,
                group: frame.group,
                group_cnt: frame.group_cnt,
            }),
            &weight,
            bias.as_deref(),
            frame.n,
            frame.m,
            &mut out_t,
        )?;

        stage_linear_output(
            &self.port,
            self.config.part_id,
            frame.n,
            frame.k,
            local_k,
            frame.ex,
            frame.out_dtype,
            &out_t,
        )
    }

    fn run_linear_float(&mut self) -> Result<(), ServerError> {
        let (frame, payload) = self.read_linear_frame(false)?;
        let weight = self
            .weights
            .get(&frame.weight_name)
            .ok_or_else(|| ServerError::UnknownWeight(frame.weight_name.clone()))?;
        let bias = self.shard_bias(&frame.bias_name)?;

        let input: Vec<f32> = match frame.out_dtype {
            DataType::Float32 => payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DataType::Float16 => payload
                .chunks_exact(2)
                .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
            other => {
                return Err(ServerError::config(
                    "linearFloat",
                    format!("unsupported activation dtype {:?}", other),
                ))
            }
        };

        let local_k = weight.rows();
        let mut out_t = vec![0f32; local_k * frame.n];
        compute_linear(
            &self.pool,
            LinearActivation::Float(&input),
            &weight,
            bias.as_deref(),
            frame.n,
            frame.m,
            &mut out_t,
        )?;

        stage_linear_output(
            &self.port,
            self.config.part_id,
            frame.n,
            frame.k,
            local_k,
            frame.ex,
            frame.out_dtype,
            &out_t,
        )
    }

    fn run_moe_task(&mut self, quantized: bool) -> Result<(), ServerError> {
        let mut len_buf = [0u8; 4];
        self.port.read_input(0, &mut len_buf)?;
        let json_len = u32::from_le_bytes(len_buf) as usize;
        let head = self.port.read_input_vec(0, 4 + json_len)?;
        let mut r = FrameReader::new(&head);
        let header: MoeHeader = read_json_header(&mut r)?;

        if DataType::from_u32(header.output_type)? != DataType::Float32 {
            return Err(ServerError::config(
                "moe",
                format!("unsupported output type {}", header.output_type),
            ));
        }

        let group = header.group.max(1);
        let config_bytes = if quantized { header.n * group * 8 } else { 0 };
        let payload_len = if quantized {
            header.n * header.m
        } else {
            header.n * header.m * 4
        };
        let rest = self
            .port
            .read_input_vec(4 + json_len, config_bytes + payload_len)?;

        let mut iscales = Vec::new();
        let mut izeros = Vec::new();
        if quantized {
            let mut r = FrameReader::new(&rest);
            for _ in 0..header.n * group {
                let min = r.read_f32()?;
                let max = r.read_f32()?;
                let c = LowBitConfig::new(min, max, 8, QuantKind::Asymmetric);
                iscales.push(c.scale);
                izeros.push(c.zero as f32);
            }
        }
        let payload = &rest[config_bytes..];

        let output = run_moe(
            &self.pool,
            &self.weights,
            &header,
            &iscales,
            &izeros,
            payload,
            quantized,
        )?;

        let bytes: Vec<u8> = output.iter().flat_map(|v| v.to_le_bytes()).collect();
        let offset = self.config.part_id * header.n * header.k * 4;
        self.port.write_output(offset, &bytes)?;
        Ok(())
    }

    fn append_kv_cache(&mut self) -> Result<(), ServerError> {
        let head = self.port.read_input_vec(0, 12)?;
        let mut r = FrameReader::new(&head);
        let uid = r.read_u64()?;
        let dims_size = r.read_i32()? as usize;
        if dims_size != 3 {
            return Err(ServerError::config(
                "appendKvCache",
                format!("dims size {} (expected 3)", dims_size),
            ));
        }

        let rest = self.port.read_input_vec(12, dims_size * 4 + 4)?;
        let mut r = FrameReader::new(&rest);
        let heads = r.read_i32()? as usize;
        let new_len = r.read_i32()? as usize;
        let dim = r.read_i32()? as usize;
        let dtype = DataType::from_u32(r.read_u32()?)?;
        if !dtype.is_float() {
            return Err(ServerError::config(
                "appendKvCache",
                format!("unsupported dtype {:?}", dtype),
            ));
        }

        let unit = dtype.unit_size().expect("float dtype");
        let payload = self
            .port
            .read_input_vec(12 + dims_size * 4 + 4, heads * new_len * dim * unit)?;

        // Widen to f32 on ingest so attention reads one layout.
        let full: Vec<f32> = match dtype {
            DataType::Float32 => payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DataType::Float16 => payload
                .chunks_exact(2)
                .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
            DataType::BFloat16 => payload
                .chunks_exact(2)
                .map(|c| half::bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            _ => unreachable!(),
        };

        let (head_base, local_heads) =
            shard_range(heads, self.config.part_id, self.config.part_cnt);
        let mut local = Vec::with_capacity(local_heads * new_len * dim);
        local.extend_from_slice(
            &full[head_base * new_len * dim..(head_base + local_heads) * new_len * dim],
        );

        self.kv
            .get_or_create(uid, local_heads, dim)
            .append(new_len, &local);
        Ok(())
    }

    fn attention(&mut self) -> Result<(), ServerError> {
        let mut len_buf = [0u8; 4];
        self.port.read_input(0, &mut len_buf)?;
        let json_len = u32::from_le_bytes(len_buf) as usize;
        let head = self.port.read_input_vec(0, 4 + json_len)?;
        let mut r = FrameReader::new(&head);
        let header: AttentionHeader = read_json_header(&mut r)?;

        if header.mask_type != MASK_CAUSAL {
            return Err(ServerError::config(
                "attention",
                format!("mask type {} is not accelerated", header.mask_type),
            ));
        }
        if DataType::from_u32(header.qtype)? != DataType::Float32 {
            return Err(ServerError::config(
                "attention",
                format!("unsupported query dtype {}", header.qtype),
            ));
        }

        let qbytes = self
            .port
            .read_input_vec(4 + json_len, header.qhead * header.qlen * header.qdim * 4)?;
        let q: Vec<f32> = qbytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let kcache = self
            .kv
            .get(header.kid)
            .ok_or(ServerError::UnknownCache(header.kid))?;
        let vcache = self
            .kv
            .get(header.vid)
            .ok_or(ServerError::UnknownCache(header.vid))?;

        if header.qlen > kcache.len {
            return Err(ServerError::config(
                "attention",
                format!("query length {} exceeds cache length {}", header.qlen, kcache.len),
            ));
        }

        let group = header.group.max(1);
        let (start_head, local_heads) =
            shard_range(header.qhead, self.config.part_id, self.config.part_cnt);
        let kv_heads = header.qhead / group;
        let kv_head_start = self.config.part_id * (kv_heads / self.config.part_cnt);

        let spec = AttentionSpec {
            qhead: header.qhead,
            qlen: header.qlen,
            qdim: header.qdim,
            vdim: vcache.dim,
            scale: header.scale,
            group,
            klen: kcache.len,
        };
        let out = run_attention(
            &self.pool,
            &q,
            &kcache,
            &vcache,
            &spec,
            start_head,
            local_heads,
            kv_head_start,
        );

        let bytes: Vec<u8> = out.iter().flat_map(|v| v.to_le_bytes()).collect();
        let offset = start_head * header.qlen * spec.vdim * 4;
        self.port.write_output(offset, &bytes)?;
        Ok(())
    }

    /// Worker 0 answers `{version, numacnt}`; the client probes this at
    /// startup to learn the worker count.
    fn send_server_info(&mut self) -> Result<(), ServerError> {
        if self.config.part_id != 0 {
            return Ok(());
        }
        let info = json!({
            "version": SERVER_VERSION,
            "numacnt": self.config.part_cnt,
        })
        .to_string();
        let mut out = (info.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(info.as_bytes());
        self.port.write_output(0, &out)?;
        Ok(())
    }

    fn find_data(&mut self) -> Result<(), ServerError> {
        let mut len_buf = [0u8; 4];
        self.port.read_input(0, &mut len_buf)?;
        let name_len = u32::from_le_bytes(len_buf) as usize;
        let name = String::from_utf8_lossy(&self.port.read_input_vec(4, name_len)?).to_string();
        let found = u32::from(self.weights.contains(&name));
        self.port
            .write_output(self.config.part_id * CONTROL_SLOT, &found.to_le_bytes())?;
        Ok(())
    }

    /// Append one chunk of a long upload to the per-worker scratch buffer.
    fn receive_long_data(&mut self) -> Result<(), ServerError> {
        let mut len_buf = [0u8; 4];
        self.port.read_input(0, &mut len_buf)?;
        let chunk_len = i32::from_le_bytes(len_buf) as usize;
        let chunk = self.port.read_input_vec(4, chunk_len)?;
        self.long_buffer.extend_from_slice(&chunk);
        Ok(())
    }

    /// Parse the accumulated long-data buffer as a registration frame.
    fn finish_long_data(&mut self) -> Result<(), ServerError> {
        let buffer = std::mem::take(&mut self.long_buffer);
        let mut r = FrameReader::new(&buffer);
        let config_len = r.read_i32()? as usize;
        let config_bytes = r.read_bytes(config_len)?;
        let header: RegisterHeader = serde_json::from_slice(config_bytes)
            .map_err(|e| ServerError::config("finishLongData", format!("bad header: {}", e)))?;
        let payload = r.read_bytes(r.remaining())?;

        match header.op.as_str() {
            "registerData" => self.weights.register(&header, payload),
            "unregisterData" => {
                self.weights.unregister(&header.data_name);
                Ok(())
            }
            other => Err(ServerError::config(
                "finishLongData",
                format!("unknown op '{}'", other),
            )),
        }
    }
}

fn parent_pid() -> i32 {
    // SAFETY: getppid has no failure modes or preconditions.
    unsafe { libc::getppid() }
}
