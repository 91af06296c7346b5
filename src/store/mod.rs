//! Durable collections for lap history and driver profiles
//!
//! Three seams:
//! - [`LapStore`]: lap records and session summaries, written only by capture
//! - [`ProfileStore`]: driver profiles, written only by the identity layer
//! - [`LegacyLapSource`]: lap-by-lap captures kept per external user
//!
//! [`MemoryStore`] and [`SledStore`] implement all three. A driver's laps and
//! their summary are written and purged together, and multi-collection writes
//! are atomic with respect to readers in either backend.

use chrono::{DateTime, Utc};

use crate::types::{DriverProfile, LapRecord, SessionId, SessionSummary};
use crate::{KartwallError, Result};

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// What an upsert did to each submitted record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    /// Key not seen before
    pub created: usize,
    /// Key existed with different lap content
    pub updated: usize,
    /// Key existed with identical lap content; left untouched
    pub unchanged: usize,
}

impl UpsertCounts {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged
    }
}

/// Records removed by a retention purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub laps: usize,
    pub summaries: usize,
}

/// Lap records keyed by (session, driver, lap) and per-driver session summaries.
#[async_trait::async_trait]
pub trait LapStore: Send + Sync + 'static {
    /// Upsert one driver's laps in one session by (session, driver, lap) and
    /// rebuild that driver's session summary from every stored lap, as one step.
    ///
    /// A record whose lap content is unchanged keeps its original `recorded_at`.
    /// Concurrent calls for the same pair never leave a summary that misses
    /// laps either call wrote. Every record must belong to the pair.
    async fn upsert_driver_laps(
        &self,
        session_id: &SessionId,
        driver_key: &str,
        laps: Vec<LapRecord>,
    ) -> Result<UpsertCounts>;

    /// Laps of one driver in one session, ascending by lap number.
    async fn driver_session_laps(
        &self,
        session_id: &SessionId,
        driver_key: &str,
    ) -> Result<Vec<LapRecord>>;

    /// Every lap of a session, ordered by driver then lap number.
    async fn session_laps(&self, session_id: &SessionId) -> Result<Vec<LapRecord>>;

    /// Every lap a driver has driven, in any session.
    async fn driver_laps(&self, driver_key: &str) -> Result<Vec<LapRecord>>;

    /// Summaries of one driver, most recent first.
    async fn driver_summaries(&self, driver_key: &str) -> Result<Vec<SessionSummary>>;

    /// Delete every (session, driver) group whose newest lap was recorded
    /// strictly before `cutoff`, laps and summary together.
    ///
    /// A summary with no laps left is judged by its own `recorded_at`.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts>;
}

/// Driver profiles keyed by driver name, with a unique external-id index.
#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync + 'static {
    async fn profile(&self, driver_name: &str) -> Result<Option<DriverProfile>>;

    async fn profile_by_external_id(&self, external_user_id: &str)
    -> Result<Option<DriverProfile>>;

    /// All profiles ordered by driver name.
    async fn profiles(&self) -> Result<Vec<DriverProfile>>;

    /// Store the profile unless one with the same name exists. Returns whether it was stored.
    async fn insert_profile_if_absent(&self, profile: DriverProfile) -> Result<bool>;

    /// Insert or replace a profile, keeping the external-id index in step.
    ///
    /// Fails with [`KartwallError::IdentityConflict`] when the profile's
    /// external id is already indexed to another driver. The check and the
    /// write happen as one step.
    async fn put_profile(&self, profile: DriverProfile) -> Result<()>;
}

/// Lap-by-lap captures kept per external user, from before laps were stored
/// per driver. Read as a fallback when the lap store has nothing.
#[async_trait::async_trait]
pub trait LegacyLapSource: Send + Sync + 'static {
    /// Laps recorded for this user in this session, ascending by lap number.
    /// Empty when nothing is held for the pair.
    async fn session_laps(&self, external_user_id: &str, session_id: &SessionId) -> Result<Vec<LapRecord>>;

    /// Replace the laps held for (user, session). Returns how many were stored.
    async fn import_laps(
        &self,
        external_user_id: &str,
        session_id: &SessionId,
        laps: Vec<LapRecord>,
    ) -> Result<usize>;
}

/// Reject records that do not belong to the (session, driver) pair.
pub(crate) fn check_driver_group(session_id: &SessionId, driver_key: &str, laps: &[LapRecord]) -> Result<()> {
    match laps.iter().find(|lap| &lap.session_id != session_id || lap.driver_key != driver_key) {
        Some(stray) => Err(KartwallError::validation(
            "laps",
            format!(
                "lap {} of {} in {} does not belong to {driver_key} in {session_id}",
                stray.lap_number, stray.driver_key, stray.session_id
            ),
        )),
        None => Ok(()),
    }
}

/// The error for an external id already held by another driver.
pub(crate) fn link_conflict(profile: &DriverProfile, holder: &str) -> Option<KartwallError> {
    let external = profile.external_user_id.as_ref()?;
    (holder != profile.driver_name).then(|| KartwallError::IdentityConflict {
        external_user_id: external.clone(),
        linked_driver: holder.to_string(),
    })
}

/// Most recent first; ties broken by session id for a stable order.
pub(crate) fn sort_recent_first(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| {
        b.recorded_at.cmp(&a.recorded_at).then_with(|| b.session_id.cmp(&a.session_id))
    });
}
