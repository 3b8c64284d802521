use once_cell::sync::OnceCell;

use crate::dtype::{DataType, GgufKind};

/// A dense n-dimensional buffer plus its quantization metadata.
///
/// For quantized weights the metadata arrays run along the quantized axis
/// (rows), multiplied by the group count when grouped. The per-row sum of
/// quantized values is computed lazily and is idempotent.
pub struct Tensor {
    pub dtype: DataType,
    pub dims: Vec<usize>,
    pub data: Vec<u8>,
    /// Per-channel minimums (no-zero families); length rows, or rows*group.
    pub mins: Vec<f32>,
    /// Per-channel scales; length rows, or rows*group.
    pub scales: Vec<f32>,
    /// Per-channel zero points (asymmetric INT8); length rows.
    pub zeros: Vec<f32>,
    /// Group count along the input-channel axis; 1 when ungrouped.
    pub group: usize,
    /// Elements per group; the full width when ungrouped.
    pub group_cnt: usize,
    pub gguf_kind: Option<GgufKind>,
    weight_sum: OnceCell<Vec<i32>>,
}

impl Tensor {
    pub fn new(dtype: DataType, dims: Vec<usize>) -> Self {
        let group_cnt = dims.last().copied().unwrap_or(0);
        Self {
            dtype,
            dims,
            data: Vec::new(),
            mins: Vec::new(),
            scales: Vec::new(),
            zeros: Vec::new(),
            group: 1,
            group_cnt,
            gguf_kind: None,
            weight_sum: OnceCell::new(),
        }
    }

    pub fn from_f32(dims: Vec<usize>, values: &[f32]) -> Self {
        debug_assert_eq!(dims.iter().product::<usize>(), values.len());
        let mut t = Self::new(DataType::Float32, dims);
        t.data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        t
    }

    pub fn rows(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    pub fn cols(&self) -> usize {
        self.dims.get(1).copied().unwrap_or(0)
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Expected payload byte size for the tensor body.
    pub fn byte_size(&self) -> usize {
        match self.dtype {
            DataType::GgufPacked => self
                .gguf_kind
                .map(|k| self.rows() * k.row_bytes(self.cols()))
                .unwrap_or(0),
            DataType::Int4NoZero | DataType::Int4Group => self.element_count() / 2,
            other => other.unit_size().unwrap_or(0) * self.element_count(),
        }
    }

    /// View the body as f32 (valid for Float32 tensors only).
    pub fn as_f32(&self) -> Vec<f32> {
        debug_assert_eq!(self.dtype, DataType::Float32);
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Decode nibble `j` of a packed int4 row. Values pack little-nibble
    /// first, two per byte.
    #[inline]
    pub fn nibble(row: &[u8], j: usize) -> u8 {
        let b = row[j / 2];
        if j % 2 == 0 {
            b & 0x0F
        } else {
            b >> 4
        }
    }

    #[inline]
    pub fn set_nibble(row: &mut [u8], j: usize, q: u8) {
        let b = &mut row[j / 2];
        if j % 2 == 0 {
            *b = (*b & 0xF0) | (q & 0x0F);
        } else {
            *b = (*b & 0x0F) | (q << 4);
        }
    }

    /// Lazy per-(row, group) sums of the quantized weight values. Length is
    /// `rows` for ungrouped types and `rows * group` for grouped ones.
    pub fn weight_sum(&self) -> &[i32] {
        self.weight_sum.get_or_init(|| self.compute_weight_sum())
    }

    fn compute_weight_sum(&self) -> Vec<i32> {
        let k = self.rows();
        let m = self.cols();
        match self.dtype {
            DataType::Int8 => {
                let mut sums = vec![0i32; k];
                for i in 0..k {
                    sums[i] = self.data[i * m..(i + 1) * m].iter().map(|&x| x as i32).sum();
                }
                sums
            }
            DataType::Int4NoZero => {
                let mut sums = vec![0i32; k];
                let row_bytes = m / 2;
                for i in 0..k {
                    let row = &self.data[i * row_bytes..(i + 1) * row_bytes];
                    sums[i] = (0..m).map(|j| Self::nibble(row, j) as i32).sum();
                }
                sums
            }
            DataType::Int4Group => {
                let mut sums = vec![0i32; k * self.group];
                let row_bytes = m / 2;
                for i in 0..k {
                    let row = &self.data[i * row_bytes..(i + 1) * row_bytes];
                    for g in 0..self.group {
                        let st = g * self.group_cnt;
                        let end = ((g + 1) * self.group_cnt).min(m);
                        sums[i * self.group + g] =
                            (st..end).map(|j| Self::nibble(row, j) as i32).sum();
                    }
                }
                sums
            }
            _ => Vec::new(),
        }
    }
}
