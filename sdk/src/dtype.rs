use crate::error::FrameError;

/// Element types carried on the wire. The numbering is part of the payload
/// format and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DataType {
    Float32 = 0,
    BFloat16 = 1,
    Int8 = 3,
    Float16 = 7,
    Int4NoZero = 8,
    Int4Group = 9,
    Fp8E4M3 = 10,
    GgufPacked = 11,
}

impl DataType {
    pub fn from_u32(value: u32) -> Result<Self, FrameError> {
        match value {
            0 => Ok(DataType::Float32),
            1 => Ok(DataType::BFloat16),
            3 => Ok(DataType::Int8),
            7 => Ok(DataType::Float16),
            8 => Ok(DataType::Int4NoZero),
            9 => Ok(DataType::Int4Group),
            10 => Ok(DataType::Fp8E4M3),
            11 => Ok(DataType::GgufPacked),
            other => Err(FrameError::UnknownDataType(other)),
        }
    }

    /// Bytes per element for dense types. The nibble-packed int4 families
    /// store two elements per byte; GGUF rows are block-packed and have no
    /// per-element size.
    pub fn unit_size(&self) -> Option<usize> {
        match self {
            DataType::Float32 => Some(4),
            DataType::BFloat16 | DataType::Float16 => Some(2),
            DataType::Int8 | DataType::Fp8E4M3 => Some(1),
            DataType::Int4NoZero | DataType::Int4Group | DataType::GgufPacked => None,
        }
    }

    /// Row byte width for a weight row of `m` logical elements.
    pub fn row_bytes(&self, m: usize) -> Option<usize> {
        match self {
            DataType::Int4NoZero | DataType::Int4Group => Some(m / 2),
            DataType::GgufPacked => None,
            other => other.unit_size().map(|u| u * m),
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DataType::Float32 | DataType::Float16 | DataType::BFloat16
        )
    }

    pub fn is_quantized(&self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int4NoZero | DataType::Int4Group
        )
    }
}

/// GGUF block formats accepted by the registry. Closed: new kinds are an
/// explicit extension, not a runtime surprise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GgufKind {
    Q4_0 = 2,
    Q8_0 = 8,
}

impl GgufKind {
    pub fn from_u32(value: u32) -> Result<Self, FrameError> {
        match value {
            2 => Ok(GgufKind::Q4_0),
            8 => Ok(GgufKind::Q8_0),
            other => Err(FrameError::UnknownDataType(other)),
        }
    }

    /// Elements per block.
    pub fn block_len(&self) -> usize {
        32
    }

    /// Bytes per packed block.
    pub fn block_bytes(&self) -> usize {
        match self {
            GgufKind::Q4_0 => 2 + 16,
            GgufKind::Q8_0 => 2 + 32,
        }
    }

    pub fn row_bytes(&self, m: usize) -> usize {
        (m / self.block_len()) * self.block_bytes()
    }
}
