//! Kernel configuration
//!
//! Limits applied by the dispatch engine. Everything has a default so
//! `KernelConfig::default()` is a working configuration.

use std::time::Duration;

use crate::table::MAX_HANDLES;

/// Default capacity of one process handle table
pub const DEFAULT_MAX_HANDLES: usize = 1024;

/// Default number of calls a server endpoint queues before rejecting
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Kernel limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Handle numbers available to each process
    pub max_handles_per_process: usize,
    /// Pending calls per server endpoint; further calls fail `QueueFull`
    pub max_queue_depth: usize,
    /// Applied to every `call`; `None` waits for the reply indefinitely
    pub call_timeout: Option<Duration>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_handles_per_process: DEFAULT_MAX_HANDLES,
            max_queue_depth: DEFAULT_QUEUE_DEPTH,
            call_timeout: None,
        }
    }
}

impl KernelConfig {
    /// Clamped to [`MAX_HANDLES`], the size of the handle number space
    pub fn with_max_handles(mut self, max: usize) -> Self {
        self.max_handles_per_process = max.min(MAX_HANDLES);
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}
