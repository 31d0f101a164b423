//! Partitioning of parameters into communication buckets.
//!
//! Planning is a pure function of the parameter list and the size limits, so
//! every worker that sees the same inputs computes the same plan.

use std::collections::{HashMap, HashSet};

use crate::error::{GradSyncError, Result};
use crate::types::{DataType, GradKind, ParamDescriptor, ParamId};

/// Alignment of every slot inside a bucket buffer, in bytes.
///
/// Large enough for the widest supported element type, so a slot can be
/// viewed as a typed slice without copying.
pub const SLOT_ALIGN: usize = 8;

/// Round `size` up to the next multiple of [`SLOT_ALIGN`].
pub const fn align_up(size: usize) -> usize {
    size.div_ceil(SLOT_ALIGN) * SLOT_ALIGN
}

/// Ordered list of buckets, each an ordered list of parameter ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BucketPlan {
    buckets: Vec<Vec<ParamId>>,
}

impl BucketPlan {
    /// Wrap an externally computed plan. It is validated when handed to a
    /// [`Reducer`](crate::Reducer).
    pub fn from_buckets(buckets: Vec<Vec<ParamId>>) -> Self {
        Self { buckets }
    }

    pub fn buckets(&self) -> &[Vec<ParamId>] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn into_buckets(self) -> Vec<Vec<ParamId>> {
        self.buckets
    }

    /// Check the plan against `params`: every parameter appears exactly once,
    /// buckets are non-empty and homogeneous in dtype and kind, sparse
    /// parameters sit alone, and dense sizes are whole elements.
    pub fn validate(&self, params: &[ParamDescriptor]) -> Result<()> {
        let by_id: HashMap<ParamId, &ParamDescriptor> = params.iter().map(|p| (p.id, p)).collect();
        if by_id.len() != params.len() {
            return Err(GradSyncError::InvalidPlan(
                "duplicate parameter ids in descriptor list".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(params.len());
        for (index, bucket) in self.buckets.iter().enumerate() {
            let Some(first) = bucket.first() else {
                return Err(GradSyncError::InvalidPlan(format!("bucket {index} is empty")));
            };
            let head = lookup(&by_id, *first)?;
            if head.is_sparse() && bucket.len() > 1 {
                return Err(GradSyncError::InvalidPlan(format!(
                    "bucket {index} mixes sparse parameter {first} with others"
                )));
            }
            for &id in bucket {
                let desc = lookup(&by_id, id)?;
                if !seen.insert(id) {
                    return Err(GradSyncError::InvalidPlan(format!(
                        "parameter {id} appears in more than one slot"
                    )));
                }
                if desc.dtype != head.dtype {
                    return Err(GradSyncError::InvalidPlan(format!(
                        "bucket {index} mixes {} and {}",
                        head.dtype, desc.dtype
                    )));
                }
                if desc.kind.is_sparse() != head.kind.is_sparse() {
                    return Err(GradSyncError::InvalidPlan(format!(
                        "bucket {index} mixes dense and sparse parameters"
                    )));
                }
                if desc.kind == GradKind::Dense && desc.size_bytes % desc.dtype.size_in_bytes() != 0
                {
                    return Err(GradSyncError::InvalidPlan(format!(
                        "parameter {id}: {} bytes is not a whole number of {} elements",
                        desc.size_bytes, desc.dtype
                    )));
                }
            }
        }

        if let Some(missing) = params.iter().find(|p| !seen.contains(&p.id)) {
            return Err(GradSyncError::InvalidPlan(format!(
                "parameter {} is not assigned to any bucket",
                missing.id
            )));
        }
        Ok(())
    }
}

fn lookup<'a>(
    by_id: &HashMap<ParamId, &'a ParamDescriptor>,
    id: ParamId,
) -> Result<&'a ParamDescriptor> {
    by_id
        .get(&id)
        .copied()
        .ok_or_else(|| GradSyncError::InvalidPlan(format!("unknown parameter {id} in plan")))
}

/// Bucket under construction for one dtype.
struct OpenBucket {
    members: Vec<ParamId>,
    first_position: usize,
    bytes: usize,
    /// Buckets already closed for this dtype; selects the active size limit.
    closed: usize,
}

impl OpenBucket {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            first_position: 0,
            bytes: 0,
            closed: 0,
        }
    }

    fn take(&mut self) -> (usize, Vec<ParamId>) {
        self.closed += 1;
        self.bytes = 0;
        (self.first_position, std::mem::take(&mut self.members))
    }
}

/// Partition `params` into buckets.
///
/// Parameters are consumed in the given order, which should be the order
/// gradients are expected to become ready (usually reverse forward order).
/// Each parameter takes [`align_up`]`(size_bytes)` bytes. A bucket closes when
/// the next parameter would push it past the active threshold:
/// `size_limits[i]` bounds the i-th bucket of a dtype and the last entry
/// applies to every bucket after that. Dense parameters of different dtypes
/// never share a bucket, and every sparse parameter gets its own. Buckets
/// are returned ordered by the position of their first member.
pub fn plan(params: &[ParamDescriptor], size_limits: &[usize]) -> Result<BucketPlan> {
    let Some(&last_limit) = size_limits.last() else {
        return Err(GradSyncError::InvalidPlan("no bucket size limits given".into()));
    };
    if size_limits.contains(&0) {
        return Err(GradSyncError::InvalidPlan("bucket size limit must be non-zero".into()));
    }
    let limit_for = |closed: usize| size_limits.get(closed).copied().unwrap_or(last_limit);

    let mut seen = HashSet::with_capacity(params.len());
    let mut open: HashMap<DataType, OpenBucket> = HashMap::new();
    let mut done: Vec<(usize, Vec<ParamId>)> = Vec::new();

    for (position, param) in params.iter().enumerate() {
        if !seen.insert(param.id) {
            return Err(GradSyncError::InvalidPlan(format!(
                "parameter {} listed twice",
                param.id
            )));
        }

        if param.is_sparse() {
            done.push((position, vec![param.id]));
            continue;
        }

        let footprint = align_up(param.size_bytes);
        let bucket = open.entry(param.dtype).or_insert_with(OpenBucket::new);
        if !bucket.members.is_empty() && bucket.bytes + footprint > limit_for(bucket.closed) {
            done.push(bucket.take());
        }
        if bucket.members.is_empty() {
            bucket.first_position = position;
        }
        bucket.members.push(param.id);
        bucket.bytes += footprint;
    }

    for bucket in open.values_mut() {
        if !bucket.members.is_empty() {
            done.push(bucket.take());
        }
    }
    done.sort_by_key(|(first, _)| *first);

    let plan = BucketPlan::from_buckets(done.into_iter().map(|(_, members)| members).collect());
    tracing::debug!(
        params = params.len(),
        buckets = plan.len(),
        "planned gradient buckets"
    );
    Ok(plan)
}
