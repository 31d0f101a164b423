use std::time::Duration;

use crate::types::ReduceOp;

/// When a complete bucket is handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchOrder {
    /// As soon as its last member arrives. Collectives are matched by tag.
    #[default]
    Eager,
    /// Only after every lower-indexed bucket was dispatched, for transports
    /// that pair collectives by call order.
    InOrder,
}

/// What `finalize_backward` does with parameters that never reported ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnusedParamPolicy {
    /// Treat their gradient as zero, log a warning and finish the pass.
    #[default]
    ZeroFill,
    /// Fail the pass with `ReadinessTimeout`.
    Error,
}

/// Runtime configuration for bucketing and reduction.
#[derive(Debug, Clone)]
pub struct GradSyncConfig {
    /// Byte thresholds for consecutive buckets of one dtype; the last entry
    /// applies to every later bucket.
    pub bucket_size_limits: Vec<usize>,

    /// Reduction applied across ranks.
    pub reduce_op: ReduceOp,

    /// Divide reduced gradients by the world size.
    pub average: bool,

    pub dispatch_order: DispatchOrder,

    pub unused_params: UnusedParamPolicy,

    /// Timeout for one bucket collective in the in-process group.
    pub collective_timeout: Duration,
}

impl Default for GradSyncConfig {
    fn default() -> Self {
        Self {
            // Small first bucket so communication starts early in the pass.
            bucket_size_limits: vec![1024 * 1024, 25 * 1024 * 1024], // 1 MiB, 25 MiB
            reduce_op: ReduceOp::Sum,
            average: true,
            dispatch_order: DispatchOrder::Eager,
            unused_params: UnusedParamPolicy::ZeroFill,
            collective_timeout: Duration::from_secs(30),
        }
    }
}

impl GradSyncConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `GRADSYNC_BUCKET_SIZE_LIMITS` (comma-separated bytes)
    /// - `GRADSYNC_AVERAGE` (`true`/`false`)
    /// - `GRADSYNC_ORDERED_DISPATCH` (`true`/`false`)
    /// - `GRADSYNC_UNUSED_PARAMS` (`zero`/`error`)
    /// - `GRADSYNC_COLLECTIVE_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = lookup("GRADSYNC_BUCKET_SIZE_LIMITS")
            && let Some(limits) = parse_limits(&v)
        {
            cfg.bucket_size_limits = limits;
        }
        if let Some(v) = lookup("GRADSYNC_AVERAGE")
            && let Ok(b) = v.parse::<bool>()
        {
            cfg.average = b;
        }
        if let Some(v) = lookup("GRADSYNC_ORDERED_DISPATCH")
            && let Ok(b) = v.parse::<bool>()
        {
            cfg.dispatch_order = if b {
                DispatchOrder::InOrder
            } else {
                DispatchOrder::Eager
            };
        }
        if let Some(v) = lookup("GRADSYNC_UNUSED_PARAMS") {
            match v.as_str() {
                "zero" => cfg.unused_params = UnusedParamPolicy::ZeroFill,
                "error" => cfg.unused_params = UnusedParamPolicy::Error,
                _ => {}
            }
        }
        if let Some(v) = lookup("GRADSYNC_COLLECTIVE_TIMEOUT_SECS")
            && let Ok(s) = v.parse::<u64>()
        {
            cfg.collective_timeout = Duration::from_secs(s);
        }

        cfg
    }
}

fn parse_limits(v: &str) -> Option<Vec<usize>> {
    let limits = v
        .split(',')
        .map(|s| s.trim().parse::<usize>().ok().filter(|&n| n > 0))
        .collect::<Option<Vec<_>>>()?;
    (!limits.is_empty()).then_some(limits)
}
