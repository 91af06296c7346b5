//! Core types for live standings and lap history.
//!
//! ## Architecture
//!
//! - [`RaceSnapshot`] is the ephemeral view decoded from one feed frame
//! - [`RawSessionPayload`] / [`SessionPayload`] are the ingest input before and after validation
//! - [`LapRecord`] and [`SessionSummary`] are the persisted lap history
//! - [`DriverProfile`] and [`DriverStats`] belong to the identity layer
//! - [`Lookup`] carries "no data" as a normal answer
//!
//! ## Usage Example
//!
//! ```rust
//! use kartwall::types::{SessionId, SessionPayload};
//! use chrono::NaiveDate;
//!
//! let payload = SessionPayload::from_json(
//!     r#"{"name":"Heat 3","drivers":[{"driverKey":"A","laps":[
//!         {"lapNumber":1,"lapTimeMs":45231,"position":1,"kartNumber":7}]}]}"#,
//! ).unwrap();
//!
//! let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
//! assert_eq!(SessionId::derive(&payload.name, date).as_str(), "20261018-heat-3");
//! ```

mod identity;
mod payload;
mod record;
mod snapshot;
mod update_rate;

pub use identity::{DriverProfile, DriverStats, DriverSummary, LinkingStatus};
pub use payload::{DriverLaps, LapEntry, RawDriverLaps, RawSessionPayload, SessionPayload};
pub use record::{
    DriverPositionTrace, LapKey, LapRecord, Lookup, PositionPoint, RecentSession, SessionId,
    SessionSummary,
};
pub use snapshot::{RaceSnapshot, SnapshotDriver};
pub use update_rate::UpdateRate;
