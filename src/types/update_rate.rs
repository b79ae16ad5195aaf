//! Update rate control for telemetry subscriptions

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Update rate for telemetry subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every message as it arrives from the feed
    Native,

    /// At most this many updates per second, merging what arrives in between
    Max(u32),
}

impl UpdateRate {
    /// Get throttle interval if needed
    ///
    /// `Max(0)` is treated as `Native`.
    pub fn throttle_interval(self) -> Option<Duration> {
        match self {
            UpdateRate::Native | UpdateRate::Max(0) => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}
