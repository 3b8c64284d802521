use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::error::FrameError;

/// Fused post-activation applied by the linear kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExType {
    None = 0,
    Swiglu = 1,
    Gelu = 2,
    Silu = 3,
}

impl ExType {
    pub fn from_u32(value: u32) -> Result<Self, FrameError> {
        match value {
            0 => Ok(ExType::None),
            1 => Ok(ExType::Swiglu),
            2 => Ok(ExType::Gelu),
            3 => Ok(ExType::Silu),
            other => Err(FrameError::BadHeader(format!("bad ex type {}", other))),
        }
    }
}

/// Causal masking is the only accelerated kind.
pub const MASK_CAUSAL: u32 = 0;

/// Forward-only cursor over a request frame. Readers never seek backwards.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < len {
            return Err(FrameError::Truncated {
                need: len,
                have: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_i32(&mut self) -> Result<i32, FrameError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, FrameError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_f32(&mut self) -> Result<f32, FrameError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        self.take(len)
    }

    pub fn read_string(&mut self, len: usize) -> Result<String, FrameError> {
        let b = self.take(len)?;
        String::from_utf8(b.to_vec())
            .map_err(|_| FrameError::BadHeader("name is not utf-8".to_string()))
    }

    pub fn skip(&mut self, len: usize) -> Result<(), FrameError> {
        self.take(len).map(|_| ())
    }
}

/// Builder for the packed side of the wire.
#[derive(Default)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Packed linear request: a ten-word header, the per-(row, group) activation
/// configs on the int path, the weight and bias names, then the payload.
#[derive(Debug, Clone)]
pub struct LinearFrame {
    pub n: usize,
    pub m: usize,
    pub k: usize,
    pub group: usize,
    pub group_cnt: usize,
    pub weight_name: String,
    pub bias_name: String,
    pub ex: ExType,
    pub out_dtype: DataType,
    /// (min, max) per (row, group); empty on the float path.
    pub configs: Vec<(f32, f32)>,
}

impl LinearFrame {
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut w = FrameWriter::new();
        w.write_i32(self.n as i32);
        w.write_i32(self.m as i32);
        w.write_i32(self.k as i32);
        w.write_i32(self.group as i32);
        w.write_i32(self.group_cnt as i32);
        w.write_i32(self.weight_name.len() as i32);
        w.write_i32(self.bias_name.len() as i32);
        w.write_i32(self.ex as i32);
        w.write_i32(self.out_dtype as i32);
        w.write_i32(0);
        for &(min, max) in &self.configs {
            w.write_f32(min);
            w.write_f32(max);
        }
        w.write_bytes(self.weight_name.as_bytes());
        w.write_bytes(self.bias_name.as_bytes());
        w.write_bytes(payload);
        w.into_bytes()
    }

    /// Decode the header (and configs when `with_configs`); the reader is
    /// left positioned at the payload.
    pub fn decode(r: &mut FrameReader, with_configs: bool) -> Result<Self, FrameError> {
        let n = r.read_i32()? as usize;
        let m = r.read_i32()? as usize;
        let k = r.read_i32()? as usize;
        let group = r.read_i32()?.max(1) as usize;
        let group_cnt = r.read_i32()?;
        let weight_name_len = r.read_i32()? as usize;
        let bias_name_len = r.read_i32()? as usize;
        let ex = ExType::from_u32(r.read_i32()? as u32)?;
        let out_dtype = DataType::from_u32(r.read_i32()? as u32)?;
        r.skip(4)?;
        let group_cnt = if group_cnt <= 0 { m } else { group_cnt as usize };
        let mut configs = Vec::new();
        if with_configs {
            configs.reserve(n * group);
            for _ in 0..n * group {
                configs.push((r.read_f32()?, r.read_f32()?));
            }
        }
        let weight_name = r.read_string(weight_name_len)?;
        let bias_name = r.read_string(bias_name_len)?;
        Ok(Self {
            n,
            m,
            k,
            group,
            group_cnt,
            weight_name,
            bias_name,
            ex,
            out_dtype,
            configs,
        })
    }
}

/// One row's expert selection in a batched MoE request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoeRow {
    pub weights: Vec<String>,
    pub factors: Vec<f32>,
}

/// MoE request header (JSON, length-prefixed). `weights` holds the gate_up
/// and down names of each selected expert interleaved; `factors` the mixture
/// weights. Batched requests carry per-row selections in `rows` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoeHeader {
    pub op: String,
    pub n: usize,
    pub m: usize,
    pub k: usize,
    pub group: usize,
    pub group_cnt: usize,
    pub output_type: u32,
    #[serde(default)]
    pub factors: Vec<f32>,
    #[serde(default)]
    pub weights: Vec<String>,
    #[serde(default)]
    pub rows: Vec<MoeRow>,
}

/// Attention request header (JSON, length-prefixed), followed by raw Q.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionHeader {
    pub kid: u64,
    pub vid: u64,
    pub qhead: usize,
    pub qlen: usize,
    pub qdim: usize,
    pub qtype: u32,
    pub group: usize,
    pub scale: f32,
    pub mask_type: u32,
}

/// Weight registration header, carried inside the long-data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterHeader {
    pub op: String,
    pub data_name: String,
    #[serde(default)]
    pub weight_type: String,
}

/// Write a `u32` length-prefixed JSON header.
pub fn write_json_header<T: Serialize>(w: &mut FrameWriter, value: &T) -> Result<(), FrameError> {
    let json = serde_json::to_vec(value)
        .map_err(|e| FrameError::BadHeader(format!("encode: {}", e)))?;
    w.write_u32(json.len() as u32);
    w.write_bytes(&json);
    Ok(())
}

/// Read a `u32` length-prefixed JSON header.
pub fn read_json_header<T: DeserializeOwned>(r: &mut FrameReader) -> Result<T, FrameError> {
    let len = r.read_u32()? as usize;
    let bytes = r.read_bytes(len)?;
    serde_json::from_slice(bytes).map_err(|e| FrameError::BadHeader(format!("decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_truncation() {
        let mut r = FrameReader::new(&[1, 0, 0]);
        assert!(matches!(r.read_i32(), Err(FrameError::Truncated { .. })));
    }

    #[test]
    fn test_linear_frame_round_trip() {
        let frame = LinearFrame {
            n: 2,
            m: 8,
            k: 4,
            group: 2,
            group_cnt: 4,
            weight_name: "w.proj".to_string(),
            bias_name: "w.bias".to_string(),
            ex: ExType::Swiglu,
            out_dtype: DataType::Float32,
            configs: vec![(0.0, 1.0), (-1.0, 1.0), (0.5, 2.0), (-2.0, 0.0)],
        };
        let payload = vec![7u8; 16];
        let bytes = frame.encode(&payload);

        let mut r = FrameReader::new(&bytes);
        let back = LinearFrame::decode(&mut r, true).unwrap();
        assert_eq!(back.n, 2);
        assert_eq!(back.k, 4);
        assert_eq!(back.group_cnt, 4);
        assert_eq!(back.weight_name, "w.proj");
        assert_eq!(back.bias_name, "w.bias");
        assert_eq!(back.ex, ExType::Swiglu);
        assert_eq!(back.configs.len(), 4);
        assert_eq!(back.configs[1], (-1.0, 1.0));
        assert_eq!(r.read_bytes(16).unwrap(), &payload[..]);
    }

    #[test]
    fn test_linear_frame_float_path() {
        let frame = LinearFrame {
            n: 1,
            m: 4,
            k: 3,
            group: 1,
            group_cnt: 4,
            weight_name: "w".to_string(),
            bias_name: String::new(),
            ex: ExType::None,
            out_dtype: DataType::Float16,
            configs: Vec::new(),
        };
        let bytes = frame.encode(&[]);
        let mut r = FrameReader::new(&bytes);
        let back = LinearFrame::decode(&mut r, false).unwrap();
        assert_eq!(back.out_dtype, DataType::Float16);
        assert!(back.bias_name.is_empty());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_group_defaults_to_full_width() {
        let mut frame = LinearFrame {
            n: 1,
            m: 6,
            k: 2,
            group: 1,
            group_cnt: 6,
            weight_name: "w".to_string(),
            bias_name: String::new(),
            ex: ExType::None,
            out_dtype: DataType::Float32,
            configs: vec![(0.0, 1.0)],
        };
        frame.group_cnt = 0;
        let bytes = frame.encode(&[]);
        let mut r = FrameReader::new(&bytes);
        let back = LinearFrame::decode(&mut r, true).unwrap();
        assert_eq!(back.group_cnt, 6);
    }

    #[test]
    fn test_json_header_round_trip() {
        let header = AttentionHeader {
            kid: 11,
            vid: 12,
            qhead: 8,
            qlen: 3,
            qdim: 64,
            qtype: DataType::Float32 as u32,
            group: 2,
            scale: 0.125,
            mask_type: MASK_CAUSAL,
        };
        let mut w = FrameWriter::new();
        write_json_header(&mut w, &header).unwrap();
        w.write_bytes(&[1, 2, 3]);
        let bytes = w.into_bytes();

        let mut r = FrameReader::new(&bytes);
        let back: AttentionHeader = read_json_header(&mut r).unwrap();
        assert_eq!(back.kid, 11);
        assert_eq!(back.qdim, 64);
        assert_eq!(r.remaining(), 3);
    }

    #[test]
    fn test_moe_header_defaults() {
        let json = br#"{"op":"moe","n":1,"m":4,"k":4,"group":1,"groupCnt":4,"outputType":0,"factors":[0.5],"weights":["e0.gu","e0.down"]}"#;
        let mut w = FrameWriter::new();
        w.write_u32(json.len() as u32);
        w.write_bytes(json);
        let bytes = w.into_bytes();
        let mut r = FrameReader::new(&bytes);
        let header: MoeHeader = read_json_header(&mut r).unwrap();
        assert_eq!(header.weights.len(), 2);
        assert!(header.rows.is_empty());
    }
}
