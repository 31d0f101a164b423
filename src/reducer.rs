//! The reducer: tracks gradient readiness per bucket, dispatches complete
//! buckets to the backend, and finalizes the pass.
//!
//! Locks are always taken in the order dispatch cursor, bucket, pass state.
//! The pass-state lock is never held while a bucket lock is acquired.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_queue::SegQueue;

use crate::backend::{CommBackend, CommHandle};
use crate::bucket::{Bucket, BucketState, BucketSummary, ReadinessIndex, SlotRef};
use crate::config::{DispatchOrder, GradSyncConfig, UnusedParamPolicy};
use crate::error::{GradSyncError, Result};
use crate::gradient::{GradStore, Gradient};
use crate::hooks::HookRegistry;
use crate::plan::{BucketPlan, plan};
use crate::types::{ParamDescriptor, ParamId, Rank, ReduceOp, collective_tag};

/// Where the reducer is within a backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    /// No gradient reported yet.
    Idle,
    /// Gradients are arriving; some buckets may be in flight.
    Accumulating,
    /// Every bucket has been handed to the backend.
    AllDispatched,
    /// `finalize_backward` is waiting on the backend.
    Finalizing,
    /// Reduced gradients were scattered; the next report opens a new pass.
    Complete,
}

impl fmt::Display for PassPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PassPhase::Idle => "idle",
            PassPhase::Accumulating => "accumulating",
            PassPhase::AllDispatched => "all-dispatched",
            PassPhase::Finalizing => "finalizing",
            PassPhase::Complete => "complete",
        })
    }
}

/// Outcome of a successful `finalize_backward`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Pass that was finalized.
    pub pass: u64,
    pub buckets_reduced: usize,
    /// Parameters that never reported ready and were zero-filled.
    pub forced: Vec<ParamId>,
}

struct PassState {
    phase: PassPhase,
    pass: u64,
}

struct InFlight {
    bucket: usize,
    handle: CommHandle,
}

/// Gradient synchronization engine for one rank.
///
/// Share it as `Arc<Reducer>`: `mark_variable_ready` may be called from any
/// number of backward threads at once, while `finalize_backward` and
/// `reset_pass` are called by the training loop. Waiting on the backend
/// blocks, so neither of those may run on a tokio runtime thread.
pub struct Reducer {
    descriptors: Vec<ParamDescriptor>,
    buckets: Vec<Mutex<Bucket>>,
    index: ReadinessIndex,
    backend: Arc<dyn CommBackend>,
    config: GradSyncConfig,
    state: Mutex<PassState>,
    /// Next bucket allowed to dispatch in ordered mode.
    dispatch_cursor: Mutex<usize>,
    dispatched: AtomicUsize,
    outstanding: SegQueue<InFlight>,
}

impl Reducer {
    /// Build a reducer over `plan`, which is validated against `params`.
    pub fn new(
        params: Vec<ParamDescriptor>,
        plan: BucketPlan,
        backend: Arc<dyn CommBackend>,
        config: GradSyncConfig,
    ) -> Result<Self> {
        plan.validate(&params)?;

        let by_id: HashMap<ParamId, &ParamDescriptor> =
            params.iter().map(|p| (p.id, p)).collect();
        let buckets: Vec<Mutex<Bucket>> = plan
            .buckets()
            .iter()
            .enumerate()
            .map(|(i, members)| {
                let descs: Vec<&ParamDescriptor> =
                    members.iter().filter_map(|id| by_id.get(id).copied()).collect();
                Mutex::new(Bucket::new(i, &descs))
            })
            .collect();
        let index = ReadinessIndex::build(&plan);

        tracing::info!(
            rank = backend.rank(),
            world_size = backend.world_size(),
            params = params.len(),
            buckets = buckets.len(),
            order = ?config.dispatch_order,
            "reducer initialized"
        );

        Ok(Self {
            descriptors: params,
            buckets,
            index,
            backend,
            config,
            state: Mutex::new(PassState {
                phase: PassPhase::Idle,
                pass: 0,
            }),
            dispatch_cursor: Mutex::new(0),
            dispatched: AtomicUsize::new(0),
            outstanding: SegQueue::new(),
        })
    }

    /// Plan buckets from `config.bucket_size_limits` and build a reducer.
    pub fn with_planned_buckets(
        params: Vec<ParamDescriptor>,
        backend: Arc<dyn CommBackend>,
        config: GradSyncConfig,
    ) -> Result<Self> {
        let plan = plan(&params, &config.bucket_size_limits)?;
        Self::new(params, plan, backend, config)
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn rank(&self) -> Rank {
        self.backend.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.backend.world_size()
    }

    pub fn config(&self) -> &GradSyncConfig {
        &self.config
    }

    pub fn descriptors(&self) -> &[ParamDescriptor] {
        &self.descriptors
    }

    /// Bucket slot assigned to `param`.
    pub fn slot_of(&self, param: ParamId) -> Option<SlotRef> {
        self.index.get(param)
    }

    pub fn phase(&self) -> Result<PassPhase> {
        Ok(self.lock_state()?.phase)
    }

    /// Current pass number, starting at 0.
    pub fn pass(&self) -> Result<u64> {
        Ok(self.lock_state()?.pass)
    }

    /// Reductions handed to the backend and not yet waited on.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn bucket_summaries(&self) -> Result<Vec<BucketSummary>> {
        (0..self.buckets.len())
            .map(|i| Ok(self.lock_bucket(i)?.summary()))
            .collect()
    }

    /// Open a pass explicitly. Returns its number.
    pub fn prepare_for_backward(&self) -> Result<u64> {
        self.begin_accumulating("prepare_for_backward")
    }

    /// Install one ready hook per parameter into `registry`.
    pub fn register_hooks(self: &Arc<Self>, registry: &mut dyn HookRegistry) -> usize {
        for desc in &self.descriptors {
            let reducer = Arc::clone(self);
            let param = desc.id;
            registry.register_ready_hook(
                param,
                Box::new(move |grad| reducer.mark_variable_ready(param, grad)),
            );
        }
        tracing::debug!(hooks = self.descriptors.len(), "ready hooks registered");
        self.descriptors.len()
    }

    /// Record that `param`'s gradient is final for this pass.
    ///
    /// The gradient is copied into its bucket slot. When this was the last
    /// missing member the bucket is dispatched (immediately, or once all
    /// lower-indexed buckets are out in ordered mode). Safe to call
    /// concurrently; a bucket is dispatched exactly once per pass.
    pub fn mark_variable_ready(&self, param: ParamId, grad: &Gradient) -> Result<()> {
        let slot = self
            .index
            .get(param)
            .ok_or(GradSyncError::UnassignedParameter { param })?;
        let pass = self.current_pass("mark_variable_ready")?;

        let complete = {
            let mut bucket = self.lock_bucket(slot.bucket_index)?;
            let complete = bucket.mark_ready(slot.slot_index, grad, pass)?;
            // Only an accepted gradient opens the pass.
            self.begin_accumulating("mark_variable_ready")?;
            tracing::trace!(
                %param,
                bucket = slot.bucket_index,
                pending = bucket.pending(),
                "gradient ready"
            );
            if complete {
                match self.config.dispatch_order {
                    DispatchOrder::Eager => self.dispatch_locked(&mut bucket, pass)?,
                    DispatchOrder::InOrder => bucket.set_ready(),
                }
            }
            complete
        };

        if complete && self.config.dispatch_order == DispatchOrder::InOrder {
            self.advance_ordered(pass)?;
        }
        Ok(())
    }

    /// Finish the pass: complete unready buckets per the configured policy,
    /// wait for every reduction in bucket order, average, and write each
    /// parameter's reduced gradient into `grads`.
    ///
    /// On any failure the pass is abandoned: every other outstanding
    /// reduction is still waited on, buckets are reset, the reducer goes
    /// back to `Idle` on the next pass number, and the first error is
    /// returned.
    pub fn finalize_backward(&self, grads: &mut GradStore) -> Result<FinalizeReport> {
        let pass = {
            let mut st = self.lock_state()?;
            if st.phase == PassPhase::Finalizing {
                return Err(GradSyncError::InvalidState {
                    operation: "finalize_backward",
                    phase: st.phase,
                });
            }
            st.phase = PassPhase::Finalizing;
            st.pass
        };

        match self.finalize_pass(pass, grads) {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::error!(pass, error = %e, "pass failed, resetting buckets");
                self.abandon_pass()?;
                Err(e)
            }
        }
    }

    fn finalize_pass(&self, pass: u64, grads: &mut GradStore) -> Result<FinalizeReport> {
        if self.config.unused_params == UnusedParamPolicy::Error {
            let missing = self.missing_params()?;
            if !missing.is_empty() {
                tracing::warn!(pass, params = ?missing, "parameters never marked ready");
                return Err(GradSyncError::ReadinessTimeout {
                    pass,
                    params: missing,
                });
            }
        }

        let forced = self.force_complete(pass)?;
        if !forced.is_empty() {
            tracing::warn!(
                pass,
                params = ?forced,
                "parameters never marked ready, using zero gradients"
            );
        }

        self.drain(true)?;

        let world_size = self.backend.world_size();
        let average = self.config.average && self.config.reduce_op == ReduceOp::Sum;
        for i in 0..self.buckets.len() {
            let mut bucket = self.lock_bucket(i)?;
            if average {
                bucket.average(world_size)?;
            }
            bucket.scatter(grads)?;
            bucket.reset();
        }
        self.reset_counters()?;

        {
            let mut st = self.lock_state()?;
            st.pass += 1;
            st.phase = PassPhase::Complete;
        }
        tracing::debug!(pass, buckets = self.buckets.len(), "pass finalized");

        Ok(FinalizeReport {
            pass,
            buckets_reduced: self.buckets.len(),
            forced,
        })
    }

    /// Abandon the current pass: wait for and discard every outstanding
    /// reduction, then reset all buckets. Returns how many reductions were
    /// drained. The reducer is ready for a new pass afterwards, including
    /// after a failed `finalize_backward`. Must not race `finalize_backward`.
    pub fn reset_pass(&self) -> Result<usize> {
        let drained = self.outstanding.len();
        self.abandon_pass()?;
        tracing::info!(drained, "pass reset");
        Ok(drained)
    }

    /// Pass number a ready signal belongs to; fails while finalizing.
    fn current_pass(&self, operation: &'static str) -> Result<u64> {
        let st = self.lock_state()?;
        if st.phase == PassPhase::Finalizing {
            return Err(GradSyncError::InvalidState {
                operation,
                phase: st.phase,
            });
        }
        Ok(st.pass)
    }

    fn begin_accumulating(&self, operation: &'static str) -> Result<u64> {
        let mut st = self.lock_state()?;
        match st.phase {
            PassPhase::Idle | PassPhase::Complete => {
                st.phase = PassPhase::Accumulating;
                tracing::debug!(pass = st.pass, "pass started");
            }
            PassPhase::Accumulating | PassPhase::AllDispatched => {}
            PassPhase::Finalizing => {
                return Err(GradSyncError::InvalidState {
                    operation,
                    phase: st.phase,
                });
            }
        }
        Ok(st.pass)
    }

    /// Hand a complete bucket to the backend. Caller holds the bucket lock.
    fn dispatch_locked(&self, bucket: &mut Bucket, pass: u64) -> Result<()> {
        let Some(payload) = bucket.take_for_dispatch() else {
            return Ok(());
        };
        let index = bucket.index();
        tracing::debug!(
            bucket = index,
            pass,
            bytes = payload.byte_len(),
            "dispatching bucket"
        );
        let handle = self.backend.reduce_async(
            collective_tag(pass, index),
            payload,
            self.config.reduce_op,
        );
        self.outstanding.push(InFlight {
            bucket: index,
            handle,
        });

        let dispatched = self.dispatched.fetch_add(1, Ordering::AcqRel) + 1;
        if dispatched == self.buckets.len() {
            let mut st = self.lock_state()?;
            if st.phase == PassPhase::Accumulating {
                st.phase = PassPhase::AllDispatched;
            }
        }
        Ok(())
    }

    /// Dispatch ready buckets from the cursor onwards until one is not ready.
    fn advance_ordered(&self, pass: u64) -> Result<()> {
        let mut cursor = self.lock_cursor()?;
        while *cursor < self.buckets.len() {
            let mut bucket = self.lock_bucket(*cursor)?;
            if bucket.state() != BucketState::Ready {
                break;
            }
            self.dispatch_locked(&mut bucket, pass)?;
            *cursor += 1;
        }
        Ok(())
    }

    fn missing_params(&self) -> Result<Vec<ParamId>> {
        let mut missing = Vec::new();
        for i in 0..self.buckets.len() {
            let bucket = self.lock_bucket(i)?;
            missing.extend(
                bucket
                    .members()
                    .iter()
                    .enumerate()
                    .filter(|(slot, _)| !bucket.is_slot_ready(*slot))
                    .map(|(_, id)| *id),
            );
        }
        Ok(missing)
    }

    /// Zero-fill and dispatch every bucket not yet handed to the backend,
    /// in index order.
    fn force_complete(&self, pass: u64) -> Result<Vec<ParamId>> {
        let mut cursor = self.lock_cursor()?;
        let mut forced = Vec::new();
        for i in 0..self.buckets.len() {
            let mut bucket = self.lock_bucket(i)?;
            match bucket.state() {
                BucketState::Pending => {
                    forced.extend(bucket.fill_missing());
                    self.dispatch_locked(&mut bucket, pass)?;
                }
                BucketState::Ready => self.dispatch_locked(&mut bucket, pass)?,
                BucketState::InFlight | BucketState::Finalized => {}
            }
        }
        *cursor = self.buckets.len();
        Ok(forced)
    }

    /// Wait on every outstanding reduction in bucket order and put the
    /// buffers back. All handles are waited on even after a failure; the
    /// first error is returned. With `keep` unset results are discarded.
    fn drain(&self, keep: bool) -> Result<()> {
        let mut inflight = Vec::with_capacity(self.outstanding.len());
        while let Some(f) = self.outstanding.pop() {
            inflight.push(f);
        }
        inflight.sort_by_key(|f| f.bucket);

        let mut first_err = None;
        for InFlight { bucket, handle } in inflight {
            let result = handle.wait();
            let mut b = self.lock_bucket(bucket)?;
            let outcome = match result {
                Ok(reduced) if keep => b.restore(reduced),
                Ok(_) => {
                    b.restore_zeroed();
                    Ok(())
                }
                Err(e) => {
                    b.restore_zeroed();
                    Err(e)
                }
            };
            if let Err(e) = outcome {
                if keep {
                    tracing::error!(bucket, error = %e, "bucket reduction failed");
                } else {
                    tracing::warn!(bucket, error = %e, "discarded failed reduction");
                }
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drain without keeping results, reset buckets, and leave the reducer
    /// idle on the next pass number.
    fn abandon_pass(&self) -> Result<()> {
        // Failures here were already logged and the results are unwanted.
        let _ = self.drain(false);
        for i in 0..self.buckets.len() {
            self.lock_bucket(i)?.reset();
        }
        self.reset_counters()?;

        let mut st = self.lock_state()?;
        if matches!(
            st.phase,
            PassPhase::Accumulating | PassPhase::AllDispatched | PassPhase::Finalizing
        ) {
            st.pass += 1;
        }
        st.phase = PassPhase::Idle;
        Ok(())
    }

    fn reset_counters(&self) -> Result<()> {
        *self.lock_cursor()? = 0;
        self.dispatched.store(0, Ordering::Release);
        Ok(())
    }

    fn lock_bucket(&self, index: usize) -> Result<MutexGuard<'_, Bucket>> {
        self.buckets[index]
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("bucket"))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, PassState>> {
        self.state
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("pass state"))
    }

    fn lock_cursor(&self) -> Result<MutexGuard<'_, usize>> {
        self.dispatch_cursor
            .lock()
            .map_err(|_| GradSyncError::LockPoisoned("dispatch cursor"))
    }
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reducer")
            .field("rank", &self.backend.rank())
            .field("params", &self.descriptors.len())
            .field("buckets", &self.buckets.len())
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}
