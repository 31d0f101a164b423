//! Communication backend interface and completion handles.

use std::future::Future;

use tokio::task::JoinHandle;

use crate::error::{GradSyncError, Result};
use crate::gradient::Gradient;
use crate::types::{CollectiveTag, Rank, ReduceOp};

/// A distributed reduction service shared by all ranks of a group.
///
/// Every rank must issue the same set of tags each pass. The payload's
/// variant carries dtype and representation: dense payloads are reduced
/// element-wise, sparse payloads are concatenated in rank order.
pub trait CommBackend: Send + Sync {
    /// This participant's rank (0-indexed).
    fn rank(&self) -> Rank;

    /// Number of participants in the group.
    fn world_size(&self) -> u32;

    /// Start reducing `payload` across the group. Ownership of the buffer
    /// passes to the backend until the returned handle is waited on.
    fn reduce_async(&self, tag: CollectiveTag, payload: Gradient, op: ReduceOp) -> CommHandle;
}

/// Completion token for one reduction.
///
/// `wait()` blocks the calling thread until the reduced buffer is available.
/// It must not be called from inside a tokio runtime thread.
///
/// If dropped without calling `wait()`, the background task is aborted and
/// the buffer is lost.
pub struct CommHandle {
    rank: Rank,
    inner: HandleInner,
}

enum HandleInner {
    Done(Option<Result<Gradient>>),
    Task {
        runtime: tokio::runtime::Handle,
        join: Option<JoinHandle<Result<Gradient>>>,
    },
}

impl CommHandle {
    /// Run `fut` on `runtime` and return a handle to its result.
    pub fn spawn(
        runtime: &tokio::runtime::Handle,
        rank: Rank,
        fut: impl Future<Output = Result<Gradient>> + Send + 'static,
    ) -> Self {
        Self {
            rank,
            inner: HandleInner::Task {
                runtime: runtime.clone(),
                join: Some(runtime.spawn(fut)),
            },
        }
    }

    /// A handle whose result is already known.
    pub fn completed(rank: Rank, result: Result<Gradient>) -> Self {
        Self {
            rank,
            inner: HandleInner::Done(Some(result)),
        }
    }

    /// Block until the reduction completes and return the reduced buffer.
    pub fn wait(mut self) -> Result<Gradient> {
        match &mut self.inner {
            HandleInner::Done(result) => result.take().unwrap_or(Err(GradSyncError::Cancelled)),
            HandleInner::Task { runtime, join } => {
                let Some(join) = join.take() else {
                    return Err(GradSyncError::Cancelled);
                };
                match runtime.block_on(join) {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => Err(GradSyncError::Cancelled),
                    Err(e) => Err(GradSyncError::backend(
                        "reduce",
                        self.rank,
                        format!("collective task panicked: {e}"),
                    )),
                }
            }
        }
    }

    /// Check if the reduction has finished (non-blocking).
    pub fn is_finished(&self) -> bool {
        match &self.inner {
            HandleInner::Done(_) => true,
            HandleInner::Task { join, .. } => join.as_ref().is_none_or(|h| h.is_finished()),
        }
    }
}

impl Drop for CommHandle {
    fn drop(&mut self) {
        if let HandleInner::Task {
            join: Some(handle), ..
        } = &self.inner
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CommHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommHandle")
            .field("rank", &self.rank)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Single-process backend: the reduction of one contribution is itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpBackend;

impl NoOpBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CommBackend for NoOpBackend {
    fn rank(&self) -> Rank {
        0
    }

    fn world_size(&self) -> u32 {
        1
    }

    fn reduce_async(&self, tag: CollectiveTag, payload: Gradient, op: ReduceOp) -> CommHandle {
        tracing::trace!(tag, %op, "no-op reduce");
        CommHandle::completed(0, Ok(payload))
    }
}
