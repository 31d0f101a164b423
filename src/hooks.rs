//! Ready-callback registration between a backward engine and the reducer.

use std::collections::HashMap;

use crate::error::{GradSyncError, Result};
use crate::gradient::Gradient;
use crate::types::ParamId;

/// Callback invoked by the backward engine once a parameter's gradient is
/// final for the current pass. May run on any engine thread.
pub type ReadyHook = Box<dyn Fn(&Gradient) -> Result<()> + Send + Sync>;

/// Implemented by whatever computes gradients and wants to announce them.
pub trait HookRegistry {
    fn register_ready_hook(&mut self, param: ParamId, hook: ReadyHook);
}

/// Plain map of hooks, for engines that just need somewhere to keep them.
#[derive(Default)]
pub struct HookTable {
    hooks: HashMap<ParamId, Vec<ReadyHook>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every hook registered for `param`, stopping at the first error.
    pub fn fire(&self, param: ParamId, grad: &Gradient) -> Result<()> {
        let hooks = self
            .hooks
            .get(&param)
            .ok_or(GradSyncError::UnassignedParameter { param })?;
        for hook in hooks {
            hook(grad)?;
        }
        Ok(())
    }

    pub fn contains(&self, param: ParamId) -> bool {
        self.hooks.contains_key(&param)
    }

    /// Number of parameters with at least one hook.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl HookRegistry for HookTable {
    fn register_ready_hook(&mut self, param: ParamId, hook: ReadyHook) {
        self.hooks.entry(param).or_default().push(hook);
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTable")
            .field("params", &self.hooks.len())
            .finish()
    }
}
