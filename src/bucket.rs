//! Gradient buckets and the parameter-to-slot index.

use std::collections::HashMap;
use std::fmt;

use crate::error::{GradSyncError, Result};
use crate::gradient::{DenseGrad, GradStore, Gradient, SparseGrad};
use crate::plan::{BucketPlan, align_up};
use crate::reduce::div_slice;
use crate::types::{DataType, GradKind, ParamDescriptor, ParamId};

/// Lifecycle of a bucket within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    /// Waiting for member gradients.
    Pending,
    /// Complete, waiting for lower-indexed buckets to dispatch first.
    Ready,
    /// Contents handed to the backend.
    InFlight,
    /// Reduced contents are back in the bucket.
    Finalized,
}

impl fmt::Display for BucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BucketState::Pending => "pending",
            BucketState::Ready => "ready",
            BucketState::InFlight => "in-flight",
            BucketState::Finalized => "finalized",
        })
    }
}

/// Position of a parameter's gradient inside the bucket set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub bucket_index: usize,
    pub slot_index: usize,
}

/// Maps every parameter to its bucket slot. Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct ReadinessIndex {
    slots: HashMap<ParamId, SlotRef>,
}

impl ReadinessIndex {
    pub fn build(plan: &BucketPlan) -> Self {
        let mut slots = HashMap::new();
        for (bucket_index, members) in plan.buckets().iter().enumerate() {
            for (slot_index, &id) in members.iter().enumerate() {
                slots.insert(
                    id,
                    SlotRef {
                        bucket_index,
                        slot_index,
                    },
                );
            }
        }
        Self { slots }
    }

    pub fn get(&self, id: ParamId) -> Option<SlotRef> {
        self.slots.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Point-in-time view of one bucket, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSummary {
    pub index: usize,
    pub members: Vec<ParamId>,
    pub bytes: usize,
    pub dtype: DataType,
    pub kind: GradKind,
    pub pending: usize,
    pub state: BucketState,
}

impl fmt::Display for BucketSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.kind.is_sparse() { "sparse" } else { "dense" };
        write!(
            f,
            "bucket {} [{kind} {}] {} bytes, {}/{} pending, {}: ",
            self.index,
            self.dtype,
            self.bytes,
            self.pending,
            self.members.len(),
            self.state
        )?;
        for (i, id) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

/// One contiguous staging region for a group of parameter gradients.
///
/// Dense buckets hold the concatenated member gradients in a single buffer
/// with every slot starting at an 8-byte boundary. Sparse buckets have a
/// single member and hold its gradient as-is. `contents` is `None` exactly
/// while the buffer is owned by the backend.
#[derive(Debug)]
pub struct Bucket {
    index: usize,
    dtype: DataType,
    kind: GradKind,
    members: Vec<ParamId>,
    offsets: Vec<usize>,
    lengths: Vec<usize>,
    total_bytes: usize,
    contents: Option<Gradient>,
    ready: Vec<bool>,
    pending: usize,
    state: BucketState,
}

impl Bucket {
    /// Allocate a bucket for `members`, which must share dtype and kind.
    pub fn new(index: usize, members: &[&ParamDescriptor]) -> Self {
        let (dtype, kind) = members
            .first()
            .map(|d| (d.dtype, d.kind))
            .unwrap_or((DataType::U8, GradKind::Dense));

        let mut offsets = Vec::with_capacity(members.len());
        let mut lengths = Vec::with_capacity(members.len());
        let mut total_bytes = 0;
        for desc in members {
            offsets.push(total_bytes);
            lengths.push(desc.size_bytes);
            total_bytes += align_up(desc.size_bytes);
        }

        let mut bucket = Self {
            index,
            dtype,
            kind,
            members: members.iter().map(|d| d.id).collect(),
            offsets,
            lengths,
            total_bytes,
            contents: None,
            ready: vec![false; members.len()],
            pending: members.len(),
            state: BucketState::Pending,
        };
        bucket.contents = Some(bucket.fresh_contents());
        bucket
    }

    fn fresh_contents(&self) -> Gradient {
        match self.kind {
            GradKind::Dense => DenseGrad::zeros(self.dtype, self.total_bytes).into(),
            GradKind::Sparse { height, row_width } => {
                SparseGrad::empty(self.dtype, height, row_width).into()
            }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn kind(&self) -> GradKind {
        self.kind
    }

    pub fn members(&self) -> &[ParamId] {
        &self.members
    }

    /// Byte offset of `slot` within the dense buffer.
    pub fn offset(&self, slot: usize) -> usize {
        self.offsets[slot]
    }

    /// Gradient length in bytes of `slot`.
    pub fn length(&self, slot: usize) -> usize {
        self.lengths[slot]
    }

    /// Size of the dense buffer including alignment padding.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn state(&self) -> BucketState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }

    pub fn is_slot_ready(&self, slot: usize) -> bool {
        self.ready[slot]
    }

    /// Whether the contents are currently owned by a backend.
    pub fn is_in_flight(&self) -> bool {
        self.contents.is_none()
    }

    /// Copy `grad` into `slot` and count it as arrived.
    ///
    /// Returns `true` when this was the last pending member. On error the
    /// bucket is left untouched.
    pub fn mark_ready(&mut self, slot: usize, grad: &Gradient, pass: u64) -> Result<bool> {
        let param = self.members[slot];
        if self.ready[slot] {
            return Err(GradSyncError::DuplicateReady { param, pass });
        }
        self.check_gradient(slot, grad)?;

        let (offset, length) = (self.offsets[slot], self.lengths[slot]);
        match (self.contents.as_mut(), grad) {
            (Some(Gradient::Dense(buf)), Gradient::Dense(g)) => {
                buf.as_bytes_mut()[offset..offset + length].copy_from_slice(g.as_bytes());
            }
            (Some(Gradient::Sparse(buf)), Gradient::Sparse(g)) => {
                buf.clear();
                buf.extend_from(g)?;
            }
            (None, _) => {
                return Err(GradSyncError::mismatch(param, "bucket buffer is in flight"));
            }
            _ => return Err(GradSyncError::mismatch(param, "bucket representation changed")),
        }

        self.ready[slot] = true;
        self.pending -= 1;
        Ok(self.pending == 0)
    }

    fn check_gradient(&self, slot: usize, grad: &Gradient) -> Result<()> {
        let param = self.members[slot];
        if grad.dtype() != self.dtype {
            return Err(GradSyncError::mismatch(
                param,
                format!("dtype {} but expected {}", grad.dtype(), self.dtype),
            ));
        }
        if grad.kind() != self.kind {
            return Err(GradSyncError::mismatch(
                param,
                format!("kind {:?} but expected {:?}", grad.kind(), self.kind),
            ));
        }
        if let Gradient::Dense(d) = grad
            && d.as_bytes().len() != self.lengths[slot]
        {
            return Err(GradSyncError::mismatch(
                param,
                format!(
                    "{} bytes but expected {}",
                    d.as_bytes().len(),
                    self.lengths[slot]
                ),
            ));
        }
        Ok(())
    }

    /// Zero-fill every slot that has not arrived and mark the bucket complete.
    ///
    /// Sparse members become an empty row set. Returns the filled parameters.
    pub fn fill_missing(&mut self) -> Vec<ParamId> {
        let mut filled = Vec::new();
        for slot in 0..self.members.len() {
            if self.ready[slot] {
                continue;
            }
            let (offset, length) = (self.offsets[slot], self.lengths[slot]);
            match self.contents.as_mut() {
                Some(Gradient::Dense(buf)) => {
                    buf.as_bytes_mut()[offset..offset + length].fill(0);
                }
                Some(Gradient::Sparse(buf)) => buf.clear(),
                None => {}
            }
            self.ready[slot] = true;
            filled.push(self.members[slot]);
        }
        self.pending = 0;
        filled
    }

    /// Mark a complete bucket as waiting for its turn to dispatch.
    pub fn set_ready(&mut self) {
        self.state = BucketState::Ready;
    }

    /// Hand the contents over for reduction. `None` if already in flight.
    pub fn take_for_dispatch(&mut self) -> Option<Gradient> {
        let contents = self.contents.take()?;
        self.state = BucketState::InFlight;
        Some(contents)
    }

    /// Put reduced contents back after a collective completes.
    pub fn restore(&mut self, reduced: Gradient) -> Result<()> {
        let shape_ok = reduced.dtype() == self.dtype
            && reduced.kind() == self.kind
            && match &reduced {
                Gradient::Dense(d) => d.as_bytes().len() == self.total_bytes,
                Gradient::Sparse(_) => true,
            };
        if !shape_ok {
            let actual = reduced.byte_len();
            self.contents = Some(self.fresh_contents());
            self.state = BucketState::Finalized;
            return Err(GradSyncError::BufferSizeMismatch {
                expected: self.total_bytes,
                actual,
            });
        }
        self.contents = Some(reduced);
        self.state = BucketState::Finalized;
        Ok(())
    }

    /// Replace a buffer that was lost with the backend by a zeroed one.
    pub fn restore_zeroed(&mut self) {
        self.contents = Some(self.fresh_contents());
        self.state = BucketState::Finalized;
    }

    /// Divide the reduced contents by `world_size`.
    pub fn average(&mut self, world_size: u32) -> Result<()> {
        match self.contents.as_mut() {
            Some(Gradient::Dense(buf)) => div_slice(buf.as_bytes_mut(), self.dtype, world_size),
            Some(Gradient::Sparse(buf)) => div_slice(buf.values_mut(), self.dtype, world_size),
            None => Ok(()),
        }
    }

    /// Copy each member's slice of the contents into `store`.
    pub fn scatter(&self, store: &mut GradStore) -> Result<()> {
        match self.contents.as_ref() {
            Some(Gradient::Dense(buf)) => {
                for (slot, &id) in self.members.iter().enumerate() {
                    let (offset, length) = (self.offsets[slot], self.lengths[slot]);
                    let bytes = buf.as_bytes()[offset..offset + length].to_vec();
                    store.insert(id, DenseGrad::new(self.dtype, bytes)?.into());
                }
            }
            Some(Gradient::Sparse(buf)) => {
                if let Some(&id) = self.members.first() {
                    store.insert(id, Gradient::Sparse(buf.clone()));
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Start a new pass: every member pending, contents reusable.
    pub fn reset(&mut self) {
        self.ready.fill(false);
        self.pending = self.members.len();
        self.state = BucketState::Pending;
        match self.contents.as_mut() {
            Some(Gradient::Sparse(buf)) => buf.clear(),
            Some(Gradient::Dense(_)) => {}
            None => self.contents = Some(self.fresh_contents()),
        }
    }

    pub fn summary(&self) -> BucketSummary {
        BucketSummary {
            index: self.index,
            members: self.members.clone(),
            bytes: self.total_bytes,
            dtype: self.dtype,
            kind: self.kind,
            pending: self.pending,
            state: self.state,
        }
    }
}
