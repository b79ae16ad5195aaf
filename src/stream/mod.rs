//! Stream combinators for telemetry subscriptions

mod throttle;

pub use throttle::{Absorb, Throttle, ThrottleExt};
