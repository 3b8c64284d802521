use sdk::dtype::DataType;
use sdk::frame::{write_json_header, AttentionHeader, FrameWriter, MASK_CAUSAL};
use sdk::task::TaskCode;

use crate::client::NumaClient;
use crate::error::ClientError;

/// Client-side descriptor of a KV cache whose data lives only on the
/// workers. The client tracks the logical length.
#[derive(Clone, Debug)]
pub struct KvCacheHandle {
    pub uid: u64,
    pub heads: usize,
    pub dim: usize,
    pub len: usize,
}

impl KvCacheHandle {
    pub fn new(uid: u64, heads: usize, dim: usize) -> Self {
        Self {
            uid,
            heads,
            dim,
            len: 0,
        }
    }
}

impl NumaClient {
    /// Append `[heads, new_len, dim]` of fresh K or V to every worker's
    /// slice of the cache, then advance the local length bookkeeping.
    pub fn append_kv(
        &self,
        handle: &mut KvCacheHandle,
        new_len: usize,
        data: &[f32],
    ) -> Result<(), ClientError> {
        if data.len() != handle.heads * new_len * handle.dim {
            return Err(ClientError::config(
                "appendKvCache",
                format!(
                    "payload {} for {}x{}x{}",
                    data.len(),
                    handle.heads,
                    new_len,
                    handle.dim
                ),
            ));
        }

        let mut w = FrameWriter::new();
        w.write_u64(handle.uid);
        w.write_i32(3);
        w.write_i32(handle.heads as i32);
        w.write_i32(new_len as i32);
        w.write_i32(handle.dim as i32);
        w.write_u32(DataType::Float32 as u32);
        for &v in data {
            w.write_f32(v);
        }

        self.mailbox.write_input(&w.into_bytes())?;
        self.mailbox.kick_all(TaskCode::AppendKvCache)?;
        self.mailbox.wait_all()?;
        handle.len += new_len;
        Ok(())
    }

    /// Causal attention of `[qhead, qlen, qdim]` queries against a cached
    /// K/V pair. Each worker writes its head slice; the result reads back
    /// contiguous as `[qhead, qlen, v.dim]`.
    #[allow(clippy::too_many_arguments)]
    pub fn attention(
        &self,
        q: &[f32],
        qhead: usize,
        qlen: usize,
        qdim: usize,
        k: &KvCacheHandle,
        v: &KvCacheHandle,
        scale: f32,
        group: usize,
        mask_type: u32,
    ) -> Result<Vec<f32>, ClientError> {
        if mask_type != MASK_CAUSAL {
            return Err(ClientError::config(
                "attention",
                format!("mask type {} is not accelerated here", mask_type),
            ));
        }
        if q.len() != qhead * qlen * qdim {
            return Err(ClientError::config(
                "attention",
                format!("query length {} for {}x{}x{}", q.len(), qhead, qlen, qdim),
            ));
        }

        let header = AttentionHeader {
            kid: k.uid,
            vid: v.uid,
            qhead,
            qlen,
            qdim,
            qtype: DataType::Float32 as u32,
            group,
            scale,
            mask_type,
        };
        let mut w = FrameWriter::new();
        write_json_header(&mut w, &header)?;
        for &x in q {
            w.write_f32(x);
        }

        self.mailbox.write_input(&w.into_bytes())?;
        self.mailbox.kick_all(TaskCode::Attention)?;
        self.mailbox.wait_all()?;

        let total = qhead * qlen * v.dim;
        let mut bytes = vec![0u8; total * 4];
        self.mailbox.read_output(0, &mut bytes)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
