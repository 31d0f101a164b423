//! In-process collective group.
//!
//! Every rank of a [`LocalGroup`] lives in the same process and shares one
//! tokio runtime and one rendezvous table. A reduction completes when all
//! ranks have contributed under the same tag; contributions are combined in
//! rank order, so every rank receives a bit-identical result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::backend::{CommBackend, CommHandle};
use crate::config::GradSyncConfig;
use crate::error::{GradSyncError, Result};
use crate::gradient::Gradient;
use crate::reduce::reduce_slice;
use crate::types::{CollectiveTag, Rank, ReduceOp};

type Outcome = std::result::Result<Gradient, String>;

/// One in-progress collective, keyed by tag.
struct Rendezvous {
    op: ReduceOp,
    contributions: Vec<Option<Gradient>>,
    waiters: Vec<Option<oneshot::Sender<Outcome>>>,
    arrived: usize,
}

impl Rendezvous {
    fn new(world_size: usize, op: ReduceOp) -> Self {
        Self {
            op,
            contributions: (0..world_size).map(|_| None).collect(),
            waiters: (0..world_size).map(|_| None).collect(),
            arrived: 0,
        }
    }

    /// Deliver the same failure to every rank already waiting.
    fn fail(self, reason: &str) {
        for tx in self.waiters.into_iter().flatten() {
            let _ = tx.send(Err(reason.to_string()));
        }
    }
}

/// State shared by every rank of the group. Never holds the runtime, so
/// dropping it from a runtime thread is safe.
struct GroupState {
    world_size: u32,
    timeout: Duration,
    table: Mutex<HashMap<CollectiveTag, Rendezvous>>,
    closed: Vec<AtomicBool>,
}

impl GroupState {
    fn first_closed(&self) -> Option<Rank> {
        self.closed
            .iter()
            .position(|c| c.load(Ordering::Acquire))
            .map(|r| r as Rank)
    }

    /// Fail and remove every pending rendezvous.
    fn abort_all(&self, reason: &str) -> Result<()> {
        let drained: Vec<Rendezvous> = {
            let mut table = self
                .table
                .lock()
                .map_err(|_| GradSyncError::LockPoisoned("local group table"))?;
            table.drain().map(|(_, rv)| rv).collect()
        };
        for rv in drained {
            rv.fail(reason);
        }
        Ok(())
    }

    /// Remove a rendezvous that timed out and release its other waiters.
    fn expire(&self, tag: CollectiveTag) {
        let stale = match self.table.lock() {
            Ok(mut table) => table.remove(&tag),
            Err(_) => None,
        };
        if let Some(rv) = stale {
            rv.fail("collective timed out waiting for peers");
        }
    }
}

/// Factory for in-process groups.
pub struct LocalGroup;

impl LocalGroup {
    /// Create `world_size` connected backends, one per rank.
    ///
    /// All backends share a multi-thread tokio runtime that lives as long as
    /// any of them.
    pub fn bootstrap(world_size: u32, config: &GradSyncConfig) -> Result<Vec<LocalBackend>> {
        if world_size == 0 {
            return Err(GradSyncError::backend(
                "bootstrap",
                0,
                "world size must be at least 1",
            ));
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("gradsync-local")
            .enable_time()
            .build()?;
        let runtime = Arc::new(runtime);

        let state = Arc::new(GroupState {
            world_size,
            timeout: config.collective_timeout,
            table: Mutex::new(HashMap::new()),
            closed: (0..world_size).map(|_| AtomicBool::new(false)).collect(),
        });

        tracing::info!(world_size, timeout = ?config.collective_timeout, "local group ready");

        Ok((0..world_size)
            .map(|rank| LocalBackend {
                rank,
                runtime: Arc::clone(&runtime),
                state: Arc::clone(&state),
            })
            .collect())
    }
}

/// One rank's endpoint into a [`LocalGroup`].
pub struct LocalBackend {
    rank: Rank,
    runtime: Arc<tokio::runtime::Runtime>,
    state: Arc<GroupState>,
}

impl LocalBackend {
    /// Simulate a crash of this rank: every pending collective fails, and
    /// every later collective on any rank of the group fails immediately.
    pub fn close(&self) {
        self.state.closed[self.rank as usize].store(true, Ordering::Release);
        tracing::warn!(rank = self.rank, "local rank closed");
        let reason = format!("peer rank {} closed", self.rank);
        if let Err(e) = self.state.abort_all(&reason) {
            tracing::error!(rank = self.rank, error = %e, "failed to abort pending collectives");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed[self.rank as usize].load(Ordering::Acquire)
    }

    /// Number of collectives still waiting for contributions.
    pub fn pending_collectives(&self) -> usize {
        self.state.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn contribute(
        &self,
        tag: CollectiveTag,
        payload: Gradient,
        op: ReduceOp,
    ) -> std::result::Result<oneshot::Receiver<Outcome>, String> {
        let (tx, rx) = oneshot::channel();
        let rank = self.rank as usize;
        let world = self.state.world_size as usize;

        let complete = {
            let mut table = self
                .state
                .table
                .lock()
                .map_err(|_| "local group table poisoned".to_string())?;
            // Checked under the table lock so `close()` cannot miss this entry.
            if let Some(dead) = self.state.first_closed() {
                return Err(format!("peer rank {dead} closed"));
            }
            let rv = table
                .entry(tag)
                .or_insert_with(|| Rendezvous::new(world, op));
            if rv.contributions[rank].is_some() {
                return Err(format!("rank {rank} contributed twice to tag {tag:#x}"));
            }
            if rv.op != op {
                let reason = format!(
                    "desynchronized collective: tag {tag:#x} reduced with {} and {op}",
                    rv.op
                );
                if let Some(rv) = table.remove(&tag) {
                    rv.fail(&reason);
                }
                return Err(reason);
            }
            rv.contributions[rank] = Some(payload);
            rv.waiters[rank] = Some(tx);
            rv.arrived += 1;
            if rv.arrived == world {
                table.remove(&tag)
            } else {
                None
            }
        };

        if let Some(rv) = complete {
            let outcome = combine(rv.contributions.into_iter().flatten().collect(), rv.op);
            tracing::trace!(tag, ok = outcome.is_ok(), "local collective complete");
            for tx in rv.waiters.into_iter().flatten() {
                let _ = tx.send(match &outcome {
                    Ok(g) => Ok(g.clone()),
                    Err(e) => Err(e.clone()),
                });
            }
        }
        Ok(rx)
    }
}

impl CommBackend for LocalBackend {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.state.world_size
    }

    fn reduce_async(&self, tag: CollectiveTag, payload: Gradient, op: ReduceOp) -> CommHandle {
        let rank = self.rank;
        let rx = match self.contribute(tag, payload, op) {
            Ok(rx) => rx,
            Err(reason) => {
                return CommHandle::completed(
                    rank,
                    Err(GradSyncError::backend("all_reduce", rank, reason)),
                );
            }
        };

        let state = Arc::clone(&self.state);
        CommHandle::spawn(self.runtime.handle(), rank, async move {
            match tokio::time::timeout(state.timeout, rx).await {
                Ok(Ok(Ok(reduced))) => Ok(reduced),
                Ok(Ok(Err(reason))) => Err(GradSyncError::backend("all_reduce", rank, reason)),
                Ok(Err(_)) => Err(GradSyncError::backend(
                    "all_reduce",
                    rank,
                    "collective abandoned",
                )),
                Err(_) => {
                    state.expire(tag);
                    Err(GradSyncError::backend(
                        "all_reduce",
                        rank,
                        format!("timed out after {:?}", state.timeout),
                    ))
                }
            }
        })
    }
}

/// Combine contributions in rank order.
fn combine(contributions: Vec<Gradient>, op: ReduceOp) -> Outcome {
    let mut iter = contributions.into_iter();
    let Some(mut acc) = iter.next() else {
        return Err("collective with no contributions".into());
    };
    for (offset, next) in iter.enumerate() {
        let peer = offset + 1;
        if next.kind() != acc.kind() || next.dtype() != acc.dtype() {
            return Err(format!(
                "desynchronized collective: rank {peer} sent {} {:?}, rank 0 sent {} {:?}",
                next.dtype(),
                next.kind(),
                acc.dtype(),
                acc.kind()
            ));
        }
        match (&mut acc, &next) {
            (Gradient::Dense(dst), Gradient::Dense(src)) => {
                if dst.as_bytes().len() != src.as_bytes().len() {
                    return Err(format!(
                        "desynchronized collective: rank {peer} sent {} bytes, rank 0 sent {}",
                        src.as_bytes().len(),
                        dst.as_bytes().len()
                    ));
                }
                let dtype = dst.dtype();
                reduce_slice(dst.as_bytes_mut(), src.as_bytes(), dtype, op)
                    .map_err(|e| e.to_string())?;
            }
            (Gradient::Sparse(dst), Gradient::Sparse(src)) => {
                if op != ReduceOp::Sum {
                    return Err(format!("sparse gradients only support sum, got {op}"));
                }
                dst.extend_from(src).map_err(|e| e.to_string())?;
            }
            _ => return Err("desynchronized collective: mixed representations".into()),
        }
    }
    Ok(acc)
}
