//! Gradient bucketing and overlapped all-reduce for data-parallel training.
//!
//! Gradients reported during a backward pass are copied into fixed buckets;
//! each bucket is reduced across workers as soon as all its members have
//! arrived, and `finalize_backward` waits for the last reductions and
//! scatters the averaged results back per parameter.

pub mod backend;
pub mod bucket;
pub mod config;
pub mod error;
pub mod gradient;
pub mod hooks;
pub mod local;
pub mod plan;
mod reduce;
pub mod reducer;
pub mod types;

pub use backend::{CommBackend, CommHandle, NoOpBackend};
pub use bucket::{Bucket, BucketState, BucketSummary, ReadinessIndex, SlotRef};
pub use config::{DispatchOrder, GradSyncConfig, UnusedParamPolicy};
pub use error::{GradSyncError, Result};
pub use gradient::{DenseGrad, GradStore, Gradient, SparseGrad};
pub use hooks::{HookRegistry, HookTable, ReadyHook};
pub use local::{LocalBackend, LocalGroup};
pub use plan::{BucketPlan, SLOT_ALIGN, align_up, plan};
pub use reducer::{FinalizeReport, PassPhase, Reducer};
pub use types::{
    CollectiveTag, DataType, GradKind, ParamDescriptor, ParamId, Rank, ReduceOp, collective_tag,
};
