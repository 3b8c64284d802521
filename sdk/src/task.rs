/// Task codes written into a worker's flag word. 0 means idle and is not a
/// task; the table is closed on both sides of the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TaskCode {
    LinearInt = 1,
    LinearFloat = 2,
    MoeInt = 3,
    MoeFloat = 4,
    AppendKvCache = 5,
    Attention = 6,
    ServerInfo = 7,
    FindData = 8,
    StartLongData = 9,
    FinishLongData = 10,
}

impl TaskCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(TaskCode::LinearInt),
            2 => Some(TaskCode::LinearFloat),
            3 => Some(TaskCode::MoeInt),
            4 => Some(TaskCode::MoeFloat),
            5 => Some(TaskCode::AppendKvCache),
            6 => Some(TaskCode::Attention),
            7 => Some(TaskCode::ServerInfo),
            8 => Some(TaskCode::FindData),
            9 => Some(TaskCode::StartLongData),
            10 => Some(TaskCode::FinishLongData),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for code in [
            TaskCode::LinearInt,
            TaskCode::LinearFloat,
            TaskCode::MoeInt,
            TaskCode::MoeFloat,
            TaskCode::AppendKvCache,
            TaskCode::Attention,
            TaskCode::ServerInfo,
            TaskCode::FindData,
            TaskCode::StartLongData,
            TaskCode::FinishLongData,
        ] {
            assert_eq!(TaskCode::from_u32(code as u32), Some(code));
        }
        assert_eq!(TaskCode::from_u32(0), None);
        assert_eq!(TaskCode::from_u32(99), None);
    }
}
