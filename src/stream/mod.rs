//! Stream combinators for snapshot subscribers

mod throttle;

pub use throttle::{Throttle, ThrottleExt};
