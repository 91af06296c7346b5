//! Update rate control for snapshot streams

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Update rate for snapshot streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every decoded frame, at whatever cadence the feed pushes
    #[default]
    Native,

    /// Throttled to at most this many snapshots per second
    /// A rate of zero is treated as Native
    Max(u32),
}

impl UpdateRate {
    /// Normalize the rate, folding degenerate throttles into Native
    pub fn normalize(self) -> Self {
        match self {
            UpdateRate::Max(0) => UpdateRate::Native,
            other => other,
        }
    }

    /// Check if throttling is needed
    pub fn needs_throttle(self) -> bool {
        matches!(self.normalize(), UpdateRate::Max(_))
    }

    /// Get throttle interval if needed
    pub fn throttle_interval(self) -> Option<Duration> {
        match self.normalize() {
            UpdateRate::Native => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}
