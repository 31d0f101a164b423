/// Rank of a participant in a communicator group (0-indexed).
pub type Rank = u32;

/// Identifier pairing one bucket reduction across all ranks of a pass.
///
/// Built as `(pass << 32) | bucket_index`, so every worker derives the same
/// tag for the same bucket no matter in which local order buckets fill up.
pub type CollectiveTag = u64;

/// Build the collective tag for `bucket` in `pass`.
pub const fn collective_tag(pass: u64, bucket: usize) -> CollectiveTag {
    (pass << 32) | (bucket as u64 & 0xFFFF_FFFF)
}

/// Identity of a trainable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub u64);

impl From<u64> for ParamId {
    fn from(id: u64) -> Self {
        ParamId(id)
    }
}

impl std::fmt::Display for ParamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Element types a gradient bucket can hold.
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

    /// Whether this is a floating-point type.
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            DataType::F32 | DataType::F64 | DataType::F16 | DataType::BF16
        )
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations applied to bucket contents across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// How a parameter's gradient is represented.
///
/// Sparse gradients carry a subset of rows of a `height x row_width` matrix
/// and cannot share a contiguous bucket buffer with anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradKind {
    Dense,
    Sparse { height: usize, row_width: usize },
}

impl GradKind {
    pub const fn is_sparse(self) -> bool {
        matches!(self, GradKind::Sparse { .. })
    }
}

/// Static description of one trainable parameter, fixed for a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamDescriptor {
    pub id: ParamId,
    /// Gradient footprint in bytes (dense-equivalent for sparse parameters).
    pub size_bytes: usize,
    pub dtype: DataType,
    pub kind: GradKind,
}

impl ParamDescriptor {
    /// Dense parameter described by its byte size.
    pub fn new(id: u64, size_bytes: usize, dtype: DataType) -> Self {
        Self {
            id: ParamId(id),
            size_bytes,
            dtype,
            kind: GradKind::Dense,
        }
    }

    /// Dense parameter with `numel` elements of `dtype`.
    pub fn dense(id: u64, numel: usize, dtype: DataType) -> Self {
        Self::new(id, numel * dtype.size_in_bytes(), dtype)
    }

    /// Parameter whose gradient selects rows of a `height x row_width` matrix.
    pub fn sparse(
        id: u64,
        height: usize,
        row_width: usize,
        dtype: DataType,
    ) -> Self {
        Self {
            id: ParamId(id),
            size_bytes: height * row_width * dtype.size_in_bytes(),
            dtype,
            kind: GradKind::Sparse { height, row_width },
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.kind.is_sparse()
    }
}
