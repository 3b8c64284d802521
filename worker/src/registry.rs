use std::sync::Arc;

use dashmap::DashMap;

use sdk::dtype::{DataType, GgufKind};
use sdk::frame::{FrameReader, RegisterHeader};
pub(crate) use sdk::layout::shard_range;
use sdk::quant::{LowBitConfig, QuantKind};
use sdk::Tensor;

use crate::error::ServerError;

/// Name-keyed store of this worker's weight shards. Each registered weight
/// holds exactly one vertical slice of the logical tensor; the payload is
/// parsed strictly forwards.
pub struct WeightStore {
    map: DashMap<String, Arc<Tensor>>,
    part_id: usize,
    part_cnt: usize,
}

impl WeightStore {
    pub fn new(part_id: usize, part_cnt: usize) -> Self {
        Self {
            map: DashMap::new(),
            part_id,
            part_cnt,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tensor>> {
        self.map.get(name).map(|r| r.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn unregister(&self, name: &str) {
        if self.map.remove(name).is_some() {
            log::info!("unregistered weight {}", name);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Parse a registration payload and extract this worker's shard.
    pub fn register(&self, header: &RegisterHeader, payload: &[u8]) -> Result<(), ServerError> {
        if self.map.contains_key(&header.data_name) {
            return Ok(());
        }

        let mut r = FrameReader::new(payload);
        let dims_size = r.read_i32()? as usize;
        let mut dims = Vec::with_capacity(dims_size);
        for _ in 0..dims_size {
            dims.push(r.read_i32()? as usize);
        }
        let dtype = DataType::from_u32(r.read_i32()? as u32)?;

        let tensor = match header.weight_type.as_str() {
            "linear" => self.extract_rows(&mut r, dtype, &dims, false)?,
            "linearSwiglu" => self.extract_rows(&mut r, dtype, &dims, true)?,
            "linearColumn" => self.extract_columns(&mut r, dtype, &dims)?,
            other => {
                return Err(ServerError::config(
                    "registerData",
                    format!("unknown weight type tag '{}'", other),
                ))
            }
        };

        log::info!(
            "registered weight {} ({:?}, local dims {:?})",
            header.data_name,
            dtype,
            tensor.dims
        );
        self.map.insert(header.data_name.clone(), Arc::new(tensor));
        Ok(())
    }

    /// Row ranges of this worker's shard. For SwiGLU weights the gate and up
    /// halves of the K axis are sliced independently and concatenated.
    fn row_slices(&self, k: usize, swiglu: bool) -> Vec<(usize, usize)> {
        if swiglu {
            let half = k / 2;
            let (base, local) = shard_range(half, self.part_id, self.part_cnt);
            vec![(base, local), (half + base, local)]
        } else {
            let (base, local) = shard_range(k, self.part_id, self.part_cnt);
            vec![(base, local)]
        }
    }

    /// Copy the slices of a row-major body with `row_bytes` per row into a
    /// fresh buffer, never seeking backwards.
    fn read_row_slices(
        r: &mut FrameReader,
        slices: &[(usize, usize)],
        row_bytes: usize,
    ) -> Result<Vec<u8>, ServerError> {
        let local_rows: usize = slices.iter().map(|(_, local)| local).sum();
        let mut data = Vec::with_capacity(local_rows * row_bytes);
        let mut cursor = 0usize;
        for &(base, local) in slices {
            debug_assert!(base >= cursor);
            r.skip((base - cursor) * row_bytes)?;
            data.extend_from_slice(r.read_bytes(local * row_bytes)?);
            cursor = base + local;
        }
        Ok(data)
    }

    fn extract_rows(
        &self,
        r: &mut FrameReader,
        dtype: DataType,
        dims: &[usize],
        swiglu: bool,
    ) -> Result<Tensor, ServerError> {
        let k = dims[0];
        let m: usize = dims[1..].iter().product::<usize>().max(1);
        let slices = self.row_slices(k, swiglu);
        let local_k: usize = slices.iter().map(|(_, local)| local).sum();

        let mut local_dims = dims.to_vec();
        local_dims[0] = local_k;
        let mut tensor = Tensor::new(dtype, local_dims);

        match dtype {
            DataType::Float32 | DataType::Float16 | DataType::BFloat16 | DataType::Fp8E4M3 => {
                let row_bytes = dtype.row_bytes(m).expect("dense dtype");
                tensor.data = Self::read_row_slices(r, &slices, row_bytes)?;
            }
            DataType::GgufPacked => {
                let kind = GgufKind::from_u32(r.read_u32()?)?;
                tensor.gguf_kind = Some(kind);
                tensor.data = Self::read_row_slices(r, &slices, kind.row_bytes(m))?;
            }
            DataType::Int8 => {
                let axis = r.read_i32()?;
                let kk = if axis < 0 { 1 } else { dims[axis as usize] };
                let mut zeros = Vec::with_capacity(kk);
                let mut scales = Vec::with_capacity(kk);
                for _ in 0..kk {
                    let min = r.read_f32()?;
                    let max = r.read_f32()?;
                    let config = LowBitConfig::new(min, max, 8, QuantKind::Asymmetric);
                    zeros.push(config.zero as f32);
                    scales.push(config.scale);
                }
                for &(base, local) in &slices {
                    for i in 0..local {
                        tensor.zeros.push(zeros[base + i]);
                        tensor.scales.push(scales[base + i]);
                    }
                }
                tensor.data = Self::read_row_slices(r, &slices, m)?;
            }
            DataType::Int4NoZero => {
                let axis = r.read_i32()?;
                let kk = if axis < 0 { 1 } else { dims[axis as usize] };
                let mut mins = Vec::with_capacity(kk);
                let mut scales = Vec::with_capacity(kk);
                for _ in 0..kk {
                    mins.push(r.read_f32()?);
                    scales.push(r.read_f32()?);
                }
                for &(base, local) in &slices {
                    for i in 0..local {
                        tensor.mins.push(mins[base + i]);
                        tensor.scales.push(scales[base + i]);
                    }
                }
                tensor.data = Self::read_row_slices(r, &slices, m / 2)?;
            }
            DataType::Int4Group => {
                let axis = r.read_i32()?;
                let group = r.read_i32()? as usize;
                let group_cnt = r.read_i32()? as usize;
                let kk = if axis < 0 { 1 } else { dims[axis as usize] };
                let mut mins = Vec::with_capacity(kk * group);
                let mut scales = Vec::with_capacity(kk * group);
                for _ in 0..kk * group {
                    mins.push(r.read_f32()?);
                    scales.push(r.read_f32()?);
                }
                for &(base, local) in &slices {
                    for i in 0..local {
                        for g in 0..group {
                            tensor.mins.push(mins[(base + i) * group + g]);
                            tensor.scales.push(scales[(base + i) * group + g]);
                        }
                    }
                }
                tensor.group = group;
                tensor.group_cnt = group_cnt;
                tensor.data = Self::read_row_slices(r, &slices, m / 2)?;
            }
        }
        Ok(tensor)
    }

    /// Column shard: columns `[part·localM, …)` with localM rounded up to
    /// even; the last worker absorbs the remainder. Used by reduction-style
    /// weights (MoE down projections).
    fn extract_columns(
        &self,
        r: &mut FrameReader,
        dtype: DataType,
        dims: &[usize],
    ) -> Result<Tensor, ServerError> {
        let k = dims[0];
        let m = dims[1];
        let mut local_m = m / self.part_cnt;
        if local_m % 2 == 1 {
            local_m += 1;
        }
        let base = self.part_id * local_m;
        if self.part_id == self.part_cnt - 1 {
            local_m = m - base;
        }

        let mut tensor = Tensor::new(dtype, vec![k, local_m]);

        match dtype {
            DataType::Float32 => {
                for _ in 0..k {
                    r.skip(base * 4)?;
                    tensor.data.extend_from_slice(r.read_bytes(local_m * 4)?);
                    r.skip((m - base - local_m) * 4)?;
                }
            }
            DataType::Int4NoZero => {
                let axis = r.read_i32()?;
                let kk = if axis < 0 { 1 } else { dims[axis as usize] };
                for _ in 0..kk {
                    tensor.mins.push(r.read_f32()?);
                    tensor.scales.push(r.read_f32()?);
                }
                for _ in 0..k {
                    r.skip(base / 2)?;
                    tensor.data.extend_from_slice(r.read_bytes(local_m / 2)?);
                    r.skip(m / 2 - base / 2 - local_m / 2)?;
                }
            }
            DataType::Int4Group => {
                let axis = r.read_i32()?;
                let group = r.read_i32()? as usize;
                let group_cnt = r.read_i32()? as usize;
                let kk = if axis < 0 { 1 } else { dims[axis as usize] };
                let cur_group = local_m / group_cnt;
                let group_base = base / group_cnt;
                for _ in 0..kk {
                    for g in 0..group {
                        let min = r.read_f32()?;
                        let scale = r.read_f32()?;
                        if g >= group_base && g < group_base + cur_group {
                            tensor.mins.push(min);
                            tensor.scales.push(scale);
                        }
                    }
                }
                tensor.group = cur_group;
                tensor.group_cnt = group_cnt;
                for _ in 0..k {
                    r.skip(base / 2)?;
                    tensor.data.extend_from_slice(r.read_bytes(local_m / 2)?);
                    r.skip(m / 2 - base / 2 - local_m / 2)?;
                }
            }
            other => {
                return Err(ServerError::config(
                    "registerData",
                    format!("linearColumn with {:?} weight", other),
                ))
            }
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::frame::FrameWriter;

    fn header(name: &str, weight_type: &str) -> RegisterHeader {
        RegisterHeader {
            op: "registerData".to_string(),
            data_name: name.to_string(),
            weight_type: weight_type.to_string(),
        }
    }

    fn f32_payload(dims: &[usize], values: &[f32]) -> Vec<u8> {
        let mut w = FrameWriter::new();
        w.write_i32(dims.len() as i32);
        for &d in dims {
            w.write_i32(d as i32);
        }
        w.write_i32(DataType::Float32 as i32);
        for &v in values {
            w.write_f32(v);
        }
        w.into_bytes()
    }

    #[test]
    fn test_row_shard_split() {
        // 3 rows over 2 workers: worker 0 takes row 0, worker 1 rows 1..3.
        let values: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let payload = f32_payload(&[3, 4], &values);

        let w0 = WeightStore::new(0, 2);
        w0.register(&header("w", "linear"), &payload).unwrap();
        let t0 = w0.get("w").unwrap();
        assert_eq!(t0.dims, vec![1, 4]);
        assert_eq!(t0.as_f32(), &values[0..4]);

        let w1 = WeightStore::new(1, 2);
        w1.register(&header("w", "linear"), &payload).unwrap();
        let t1 = w1.get("w").unwrap();
        assert_eq!(t1.dims, vec![2, 4]);
        assert_eq!(t1.as_f32(), &values[4..12]);
    }

    #[test]
    fn test_swiglu_shard_pairs_gate_and_up() {
        // K=4 (gate rows 0,1 / up rows 2,3), 2 workers: worker 0 gets rows
        // {0, 2}, worker 1 rows {1, 3}.
        let values: Vec<f32> = (0..8).map(|i| i as f32 * 10.0).collect();
        let payload = f32_payload(&[4, 2], &values);

        let w0 = WeightStore::new(0, 2);
        w0.register(&header("w", "linearSwiglu"), &payload).unwrap();
        assert_eq!(w0.get("w").unwrap().as_f32(), vec![0.0, 10.0, 40.0, 50.0]);

        let w1 = WeightStore::new(1, 2);
        w1.register(&header("w", "linearSwiglu"), &payload).unwrap();
        assert_eq!(w1.get("w").unwrap().as_f32(), vec![20.0, 30.0, 60.0, 70.0]);
    }

    #[test]
    fn test_int4_group_config_reindex() {
        // K=2, M=8, 2 groups of 4; single worker keeps everything.
        let mut w = FrameWriter::new();
        w.write_i32(2);
        w.write_i32(2);
        w.write_i32(8);
        w.write_i32(DataType::Int4Group as i32);
        w.write_i32(0); // per-channel axis
        w.write_i32(2); // group
        w.write_i32(4); // groupCnt
        for i in 0..4 {
            w.write_f32(i as f32 * -1.0); // min
            w.write_f32(0.1 * (i + 1) as f32); // scale
        }
        w.write_bytes(&[0x21, 0x43, 0x65, 0x87, 0x10, 0x32, 0x54, 0x76]);
        let payload = w.into_bytes();

        let store = WeightStore::new(0, 1);
        store.register(&header("w", "linear"), &payload).unwrap();
        let t = store.get("w").unwrap();
        assert_eq!(t.group, 2);
        assert_eq!(t.group_cnt, 4);
        assert_eq!(t.mins, vec![0.0, -1.0, -2.0, -3.0]);
        assert_eq!(t.scales.len(), 4);
        assert_eq!(t.data.len(), 8);
        // Weight sums match the packed nibbles per (row, group).
        assert_eq!(t.weight_sum().len(), 4);
    }

    #[test]
    fn test_int8_configs_follow_row_shard() {
        // K=4, M=2 over 2 workers; per-row (min, max) pairs.
        let mut w = FrameWriter::new();
        w.write_i32(2);
        w.write_i32(4);
        w.write_i32(2);
        w.write_i32(DataType::Int8 as i32);
        w.write_i32(0);
        for i in 0..4 {
            w.write_f32(-(i as f32 + 1.0));
            w.write_f32(i as f32 + 1.0);
        }
        w.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let payload = w.into_bytes();

        let store = WeightStore::new(1, 2);
        store.register(&header("w", "linear"), &payload).unwrap();
        let t = store.get("w").unwrap();
        assert_eq!(t.dims, vec![2, 2]);
        assert_eq!(t.data, vec![5, 6, 7, 8]);
        assert_eq!(t.scales.len(), 2);
        // Row 2's grid is (-3, 3), row 3's (-4, 4).
        assert!((t.scales[0] - 6.0 / 255.0).abs() < 1e-6);
        assert!((t.scales[1] - 8.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_column_shard_f32() {
        // K=2, M=6 over 2 workers: localM = 6/2 = 3 rounded up to 4, so
        // worker 0 takes columns 0..4 and worker 1 columns 4..6.
        let values: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let payload = f32_payload(&[2, 6], &values);

        let w0 = WeightStore::new(0, 2);
        w0.register(&header("w", "linearColumn"), &payload).unwrap();
        let t0 = w0.get("w").unwrap();
        assert_eq!(t0.dims, vec![2, 4]);
        assert_eq!(t0.as_f32(), vec![0.0, 1.0, 2.0, 3.0, 6.0, 7.0, 8.0, 9.0]);

        let w1 = WeightStore::new(1, 2);
        w1.register(&header("w", "linearColumn"), &payload).unwrap();
        let t1 = w1.get("w").unwrap();
        assert_eq!(t1.dims, vec![2, 2]);
        assert_eq!(t1.as_f32(), vec![4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        let payload = f32_payload(&[1, 2], &[1.0, 2.0]);
        let store = WeightStore::new(0, 1);
        store.register(&header("w", "linear"), &payload).unwrap();
        store.register(&header("w", "linear"), &payload).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unknown_weight_type_rejected() {
        let payload = f32_payload(&[1, 2], &[1.0, 2.0]);
        let store = WeightStore::new(0, 1);
        let err = store.register(&header("w", "conv2d"), &payload);
        assert!(matches!(err, Err(ServerError::Configuration { .. })));
    }

    #[test]
    fn test_unregister_drops_entry() {
        let payload = f32_payload(&[1, 2], &[1.0, 2.0]);
        let store = WeightStore::new(0, 1);
        store.register(&header("w", "linear"), &payload).unwrap();
        store.unregister("w");
        assert!(store.is_empty());
    }
}
