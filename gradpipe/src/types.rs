/// Rank of a process (0-indexed).
pub type Rank = u32;

/// Routing key of one partition. Unique across all tensors of a job.
pub type Key = u64;

/// Data types a tensor can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which device holds a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// Host memory only. Needs no pipeline.
    Cpu,
    /// Accelerator with the given ordinal.
    Gpu(u32),
}

impl DeviceId {
    pub fn is_cpu(self) -> bool {
        matches!(self, DeviceId::Cpu)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceId::Cpu => f.write_str("cpu"),
            DeviceId::Gpu(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

/// One processing step a partition passes through.
///
/// Each stage is served by its own queue and worker loop. The
/// `Coordinate*` stages are the rendezvous steps non-root processes take
/// before the single authorized process issues the real call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Stage {
    CoordinateReduce = 0,
    Reduce = 1,
    CopyD2H = 2,
    PcieReduce = 3,
    CoordinatePush = 4,
    Push = 5,
    Pull = 6,
    CopyH2D = 7,
    CoordinateBroadcast = 8,
    Broadcast = 9,
}

impl Stage {
    /// Every stage, in declaration order.
    pub const ALL: [Stage; 10] = [
        Stage::CoordinateReduce,
        Stage::Reduce,
        Stage::CopyD2H,
        Stage::PcieReduce,
        Stage::CoordinatePush,
        Stage::Push,
        Stage::Pull,
        Stage::CopyH2D,
        Stage::CoordinateBroadcast,
        Stage::Broadcast,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Stage::CoordinateReduce => "COORDINATE_REDUCE",
            Stage::Reduce => "REDUCE",
            Stage::CopyD2H => "COPYD2H",
            Stage::PcieReduce => "PCIE_REDUCE",
            Stage::CoordinatePush => "COORDINATE_PUSH",
            Stage::Push => "PUSH",
            Stage::Pull => "PULL",
            Stage::CopyH2D => "COPYH2D",
            Stage::CoordinateBroadcast => "COORDINATE_BROADCAST",
            Stage::Broadcast => "BROADCAST",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of store request, combined with the data type into a command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    DefaultPushPull = 0,
    RowSparsePushPull = 1,
    CompressedPushPull = 2,
}

/// Command code sent with every store push/pull.
///
/// Cantor pairing of request kind and dtype, so servers can recover both
/// from a single integer.
pub fn command_type(kind: RequestKind, dtype: DataType) -> i32 {
    let m = kind as i32;
    let d = dtype as i32;
    ((m + d) * (m + d + 1)) / 2 + d
}
