//! Feed connection management
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──open ok──► Connected
//!      ▲                        │   ▲                    │
//!      │                   open failed │              link closed
//!      │                        ▼   │                    │
//!      └──disconnect()──── Reconnecting ◄────────────────┘
//!                           (retry timer: min(base * 2^n, cap))
//! ```
//!
//! `disconnect()` is valid from every state and always lands in `Disconnected`.

mod backoff;
mod manager;

#[cfg(test)]
mod tests;

pub use backoff::{BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_CAP_DELAY};
pub use manager::{ConnectionState, FeedConnectionManager, FeedOptions, FeedStatus};
