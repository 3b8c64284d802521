use sdk::dtype::DataType;
use sdk::frame::{FrameWriter, RegisterHeader};
use sdk::layout::SIZE_INPUT;
use sdk::quant::{LowBitConfig, QuantKind};
use sdk::task::TaskCode;
use sdk::Tensor;

use crate::client::{NumaClient, WeightDesc};
use crate::error::ClientError;

/// How a weight is partitioned across workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightKind {
    /// Row-sharded along the output-channel axis; partial outputs
    /// concatenate.
    Linear,
    /// Gate and up halves row-sharded independently for fused SwiGLU.
    LinearSwiglu,
    /// Column-sharded along the input-channel axis; partial outputs are
    /// summed.
    LinearColumn,
}

impl WeightKind {
    fn tag(&self) -> &'static str {
        match self {
            WeightKind::Linear => "linear",
            WeightKind::LinearSwiglu => "linearSwiglu",
            WeightKind::LinearColumn => "linearColumn",
        }
    }
}

/// Serialize the canonical registration payload: dims, dtype, per-channel
/// quantization metadata, then the tensor body, in exactly the order the
/// workers read it.
fn weight_payload(tensor: &Tensor) -> Result<Vec<u8>, ClientError> {
    let mut w = FrameWriter::new();
    w.write_i32(tensor.dims.len() as i32);
    for &d in &tensor.dims {
        w.write_i32(d as i32);
    }
    w.write_i32(tensor.dtype as i32);

    match tensor.dtype {
        DataType::Float32 | DataType::Float16 | DataType::BFloat16 | DataType::Fp8E4M3 => {}
        DataType::GgufPacked => {
            let kind = tensor.gguf_kind.ok_or_else(|| {
                ClientError::config("registerData", "gguf tensor without a kind")
            })?;
            w.write_u32(kind as u32);
        }
        DataType::Int8 => {
            w.write_i32(0);
            for i in 0..tensor.rows() {
                let min = -tensor.zeros[i] * tensor.scales[i];
                let max = min + 255.0 * tensor.scales[i];
                w.write_f32(min);
                w.write_f32(max);
            }
        }
        DataType::Int4NoZero => {
            w.write_i32(0);
            for i in 0..tensor.rows() {
                w.write_f32(tensor.mins[i]);
                w.write_f32(tensor.scales[i]);
            }
        }
        DataType::Int4Group => {
            w.write_i32(0);
            w.write_i32(tensor.group as i32);
            w.write_i32(tensor.group_cnt as i32);
            for i in 0..tensor.rows() * tensor.group {
                w.write_f32(tensor.mins[i]);
                w.write_f32(tensor.scales[i]);
            }
        }
    }

    w.write_bytes(&tensor.data);
    Ok(w.into_bytes())
}

impl NumaClient {
    /// Stream a long-data buffer (`i32 configLen, configJson, payload`) to
    /// every worker in input-region-sized chunks, then trigger the parse.
    fn upload_long(&self, config_json: &[u8], payload: &[u8]) -> Result<(), ClientError> {
        let mut stream = FrameWriter::new();
        stream.write_i32(config_json.len() as i32);
        stream.write_bytes(config_json);
        stream.write_bytes(payload);
        let stream = stream.into_bytes();

        let chunk_max = SIZE_INPUT - 4;
        for chunk in stream.chunks(chunk_max) {
            let mut frame = FrameWriter::new();
            frame.write_i32(chunk.len() as i32);
            frame.write_bytes(chunk);
            self.mailbox.write_input(&frame.into_bytes())?;
            self.mailbox.kick_all(TaskCode::StartLongData)?;
            self.mailbox.wait_all()?;
        }
        self.mailbox.kick_all(TaskCode::FinishLongData)?;
        self.mailbox.wait_all()?;
        Ok(())
    }

    /// Register a full weight tensor with every worker; each extracts only
    /// its shard. Returns the descriptor later ops consume.
    pub fn register_weight(
        &self,
        name: &str,
        kind: WeightKind,
        tensor: &Tensor,
    ) -> Result<WeightDesc, ClientError> {
        let header = RegisterHeader {
            op: "registerData".to_string(),
            data_name: name.to_string(),
            weight_type: kind.tag().to_string(),
        };
        let json = serde_json::to_vec(&header)
            .map_err(|e| ClientError::config("registerData", e.to_string()))?;
        let payload = weight_payload(tensor)?;
        self.upload_long(&json, &payload)?;
        log::info!("registered weight {} ({:?}, {:?})", name, tensor.dtype, kind);

        Ok(WeightDesc {
            name: name.to_string(),
            bias_name: String::new(),
            dtype: tensor.dtype,
            k: tensor.rows(),
            group: tensor.group,
            group_cnt: tensor.group_cnt,
        })
    }

    pub fn unregister_weight(&self, name: &str) -> Result<(), ClientError> {
        let header = RegisterHeader {
            op: "unregisterData".to_string(),
            data_name: name.to_string(),
            weight_type: String::new(),
        };
        let json = serde_json::to_vec(&header)
            .map_err(|e| ClientError::config("unregisterData", e.to_string()))?;
        self.upload_long(&json, &[])
    }

    /// True when every worker holds a shard of `name`.
    pub fn find_weight(&self, name: &str) -> Result<bool, ClientError> {
        let mut frame = FrameWriter::new();
        frame.write_i32(name.len() as i32);
        frame.write_bytes(name.as_bytes());
        self.mailbox.write_input(&frame.into_bytes())?;
        self.mailbox.kick_all(TaskCode::FindData)?;
        self.mailbox.wait_all()?;

        for w in 0..self.mailbox.workers() {
            let found = self
                .mailbox
                .read_output_u32(w * sdk::layout::CONTROL_SLOT)?;
            if found == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Quantize a float weight `[k, m]` to per-row asymmetric INT8.
pub fn quantize_weight_int8(values: &[f32], k: usize, m: usize) -> Tensor {
    let mut tensor = Tensor::new(DataType::Int8, vec![k, m]);
    tensor.data = vec![0u8; k * m];
    for i in 0..k {
        let row = &values[i * m..(i + 1) * m];
        let lo = row.iter().cloned().fold(f32::MAX, f32::min);
        let hi = row.iter().cloned().fold(f32::MIN, f32::max);
        let c = LowBitConfig::new(lo, hi, 8, QuantKind::Asymmetric);
        for j in 0..m {
            tensor.data[i * m + j] = c.quantize(row[j]);
        }
        tensor.zeros.push(c.zero as f32);
        tensor.scales.push(c.scale);
    }
    tensor
}

/// Quantize a float weight `[k, m]` to per-row no-zero INT4.
pub fn quantize_weight_int4_nozero(values: &[f32], k: usize, m: usize) -> Tensor {
    let mut tensor = Tensor::new(DataType::Int4NoZero, vec![k, m]);
    tensor.data = vec![0u8; k * m / 2];
    for i in 0..k {
        let row = &values[i * m..(i + 1) * m];
        let prow = &mut tensor.data[i * m / 2..(i + 1) * (m / 2)];
        let lo = row.iter().cloned().fold(f32::MAX, f32::min);
        let hi = row.iter().cloned().fold(f32::MIN, f32::max);
        let c = LowBitConfig::new(lo, hi, 4, QuantKind::NoZero);
        for j in 0..m {
            Tensor::set_nibble(prow, j, c.quantize(row[j]));
        }
        tensor.mins.push(c.min);
        tensor.scales.push(c.scale);
    }
    tensor
}

/// Quantize a float weight `[k, m]` to grouped no-zero INT4 with
/// `group_cnt` elements per group.
pub fn quantize_weight_int4_group(values: &[f32], k: usize, m: usize, group_cnt: usize) -> Tensor {
    let group = m / group_cnt;
    let mut tensor = Tensor::new(DataType::Int4Group, vec![k, m]);
    tensor.group = group;
    tensor.group_cnt = group_cnt;
    tensor.data = vec![0u8; k * m / 2];
    for i in 0..k {
        let row = &values[i * m..(i + 1) * m];
        let prow = &mut tensor.data[i * m / 2..(i + 1) * (m / 2)];
        for g in 0..group {
            let st = g * group_cnt;
            let end = ((g + 1) * group_cnt).min(m);
            let lo = row[st..end].iter().cloned().fold(f32::MAX, f32::min);
            let hi = row[st..end].iter().cloned().fold(f32::MIN, f32::max);
            let c = LowBitConfig::new(lo, hi, 4, QuantKind::NoZero);
            for j in st..end {
                Tensor::set_nibble(prow, j, c.quantize(row[j]));
            }
            tensor.mins.push(c.min);
            tensor.scales.push(c.scale);
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int4_group_metadata_shape() {
        let values: Vec<f32> = (0..16).map(|i| i as f32 * 0.1).collect();
        let t = quantize_weight_int4_group(&values, 2, 8, 4);
        assert_eq!(t.group, 2);
        assert_eq!(t.mins.len(), 4);
        assert_eq!(t.data.len(), 8);
    }

    #[test]
    fn test_int8_payload_round_trips_configs() {
        let values = vec![-1.0f32, 0.0, 0.5, 1.0];
        let t = quantize_weight_int8(&values, 2, 2);
        let payload = weight_payload(&t).unwrap();
        // dims_size + 2 dims + dtype + axis + 2 (min,max) pairs + body
        assert_eq!(payload.len(), 4 + 8 + 4 + 4 + 16 + 4);
        // The worker rebuilds the same zero point from (min, max).
        for i in 0..2 {
            let min = -t.zeros[i] * t.scales[i];
            let max = min + 255.0 * t.scales[i];
            let c = LowBitConfig::new(min, max, 8, QuantKind::Asymmetric);
            assert_eq!(c.zero as f32, t.zeros[i]);
            assert!((c.scale - t.scales[i]).abs() < 1e-7);
        }
    }

    #[test]
    fn test_quantized_weight_dequant_error_bounded() {
        let values: Vec<f32> = (0..32).map(|i| ((i * 7) % 13) as f32 * 0.3 - 1.5).collect();
        let t = quantize_weight_int4_nozero(&values, 4, 8);
        for i in 0..4 {
            let c = LowBitConfig::from_min_scale(t.mins[i], t.scales[i], 4);
            for j in 0..8 {
                let q = Tensor::nibble(&t.data[i * 4..(i + 1) * 4], j);
                let err = (c.dequantize(q) - values[i * 8 + j]).abs();
                assert!(err <= c.scale);
            }
        }
    }
}
