//! Lap capture: ingest finalized session payloads and answer lap queries
//!
//! [`LapCaptureService`] is the only writer of lap records and session
//! summaries. Payloads are upserted by (session, driver, lap), so a payload
//! submitted twice leaves the store as it was after the first submission.
//! Drivers are resolved through an [`IdentityResolver`]; a user with no
//! linked driver simply has no laps.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::identity::IdentityResolver;
use crate::store::LapStore;
use crate::types::{
    DriverPositionTrace, LapEntry, LapRecord, PositionPoint, RecentSession, SessionId,
    SessionPayload,
};
use crate::{KartwallError, Result};

pub use crate::store::LegacyLapSource;

/// Default age after which lap history is purged.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// What one `process_lap_data` call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureReport {
    pub session_id: SessionId,
    pub session_name: String,
    pub drivers_processed: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_unchanged: usize,
    pub profiles_created: usize,
}

/// Where lap-by-lap data was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Primary,
    Legacy,
    None,
}

/// Lap-by-lap answer. Failures are reported in-band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapByLapOutcome {
    pub success: bool,
    #[serde(rename = "dataSource")]
    pub source: DataSource,
    pub laps: Vec<LapRecord>,
    pub error: Option<String>,
}

impl LapByLapOutcome {
    fn found(source: DataSource, mut laps: Vec<LapRecord>) -> Self {
        laps.sort_by_key(|lap| lap.lap_number);
        Self { success: true, source, laps, error: None }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self { success: false, source: DataSource::None, laps: Vec::new(), error: Some(error.into()) }
    }
}

pub struct LapCaptureService {
    store: Arc<dyn LapStore>,
    identity: Arc<dyn IdentityResolver>,
    legacy: Option<Arc<dyn LegacyLapSource>>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl LapCaptureService {
    pub fn new(store: Arc<dyn LapStore>, identity: Arc<dyn IdentityResolver>) -> Self {
        Self {
            store,
            identity,
            legacy: None,
            clock: Arc::new(SystemClock),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_legacy_source(mut self, legacy: Arc<dyn LegacyLapSource>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Store every lap of a finalized session.
    ///
    /// The session id comes from the payload name and the session date. When
    /// the payload carries no `session_date` the UTC capture day is used, so a
    /// session resubmitted after UTC midnight without a date lands under a new
    /// id. A lap number repeated within one driver entry keeps its last
    /// occurrence.
    pub async fn process_lap_data(&self, payload: SessionPayload) -> Result<CaptureReport> {
        let now = self.clock.now();
        let day = payload.session_date.unwrap_or_else(|| now.date_naive());
        let session_id = SessionId::derive(&payload.name, day);
        let mut report = CaptureReport {
            session_id: session_id.clone(),
            session_name: payload.name.clone(),
            drivers_processed: 0,
            records_created: 0,
            records_updated: 0,
            records_unchanged: 0,
            profiles_created: 0,
        };

        let mut driver_names = Vec::with_capacity(payload.drivers.len());
        for driver in payload.drivers {
            let mut by_lap: BTreeMap<u32, LapEntry> = BTreeMap::new();
            for lap in driver.laps {
                by_lap.insert(lap.lap_number, lap);
            }

            let records: Vec<LapRecord> = by_lap
                .into_values()
                .map(|lap| LapRecord {
                    session_id: session_id.clone(),
                    session_name: payload.name.clone(),
                    driver_key: driver.driver_key.clone(),
                    lap_number: lap.lap_number,
                    lap_time_ms: lap.lap_time_ms,
                    position: lap.position,
                    kart_number: lap.kart_number,
                    recorded_at: now,
                })
                .collect();

            let counts = self.store.upsert_driver_laps(&session_id, &driver.driver_key, records).await?;
            report.records_created += counts.created;
            report.records_updated += counts.updated;
            report.records_unchanged += counts.unchanged;

            debug!(
                session = %session_id,
                driver = %driver.driver_key,
                created = counts.created,
                updated = counts.updated,
                unchanged = counts.unchanged,
                "Captured driver laps"
            );
            report.drivers_processed += 1;
            driver_names.push(driver.driver_key);
        }

        report.profiles_created = self.identity.register_drivers(&driver_names).await?;

        info!(
            session = %report.session_id,
            drivers = report.drivers_processed,
            created = report.records_created,
            updated = report.records_updated,
            "Processed session lap data"
        );
        Ok(report)
    }

    /// The linked driver's laps in one session, ascending by lap number.
    pub async fn get_driver_lap_progression(
        &self,
        external_user_id: &str,
        session_id: &SessionId,
    ) -> Result<Vec<LapRecord>> {
        let Some(driver_key) = self.resolve_driver(external_user_id).await? else {
            return Ok(Vec::new());
        };
        let mut laps = self.store.driver_session_laps(session_id, &driver_key).await?;
        laps.sort_by_key(|lap| lap.lap_number);
        Ok(laps)
    }

    /// Up to `limit` of the linked driver's sessions, most recent first.
    pub async fn get_recent_session_laps(
        &self,
        external_user_id: &str,
        limit: usize,
    ) -> Result<Vec<RecentSession>> {
        let Some(driver_key) = self.resolve_driver(external_user_id).await? else {
            return Ok(Vec::new());
        };

        let summaries = self.store.driver_summaries(&driver_key).await?;
        let mut sessions = Vec::with_capacity(limit.min(summaries.len()));
        for summary in summaries.into_iter().take(limit) {
            let mut laps = self.store.driver_session_laps(&summary.session_id, &driver_key).await?;
            laps.sort_by_key(|lap| lap.lap_number);
            sessions.push(RecentSession { summary, laps });
        }
        Ok(sessions)
    }

    /// Position after every lap for every driver in the session.
    pub async fn get_session_position_progression(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<DriverPositionTrace>> {
        let laps = self.store.session_laps(session_id).await?;

        let mut traces: BTreeMap<String, Vec<PositionPoint>> = BTreeMap::new();
        for lap in laps {
            traces
                .entry(lap.driver_key)
                .or_default()
                .push(PositionPoint { lap_number: lap.lap_number, position: lap.position });
        }

        Ok(traces
            .into_iter()
            .map(|(driver_key, mut points)| {
                points.sort_by_key(|point| point.lap_number);
                DriverPositionTrace { driver_key, points }
            })
            .collect())
    }

    /// Lap-by-lap data from the primary store, falling back to the legacy source.
    pub async fn get_session_lap_by_lap(
        &self,
        external_user_id: &str,
        session_id: &SessionId,
    ) -> LapByLapOutcome {
        match self.lap_by_lap(external_user_id, session_id).await {
            Ok(Some((source, laps))) => LapByLapOutcome::found(source, laps),
            Ok(None) => LapByLapOutcome::failed("No lap data found for this session"),
            Err(err) => {
                warn!(external_user_id, session = %session_id, error = %err, "Lap-by-lap lookup failed");
                LapByLapOutcome::failed(err.to_string())
            }
        }
    }

    async fn lap_by_lap(
        &self,
        external_user_id: &str,
        session_id: &SessionId,
    ) -> Result<Option<(DataSource, Vec<LapRecord>)>> {
        if let Some(driver_key) = self.resolve_driver(external_user_id).await? {
            let laps = self.store.driver_session_laps(session_id, &driver_key).await?;
            if !laps.is_empty() {
                return Ok(Some((DataSource::Primary, laps)));
            }
        }

        if let Some(legacy) = &self.legacy {
            let laps = legacy.session_laps(external_user_id, session_id).await?;
            if !laps.is_empty() {
                debug!(external_user_id, session = %session_id, "Serving lap-by-lap from legacy source");
                return Ok(Some((DataSource::Legacy, laps)));
            }
        }

        Ok(None)
    }

    /// Hand laps from the older per-user capture format to the legacy source,
    /// replacing whatever it held for (user, session).
    pub async fn import_legacy_laps(
        &self,
        external_user_id: &str,
        session_id: &SessionId,
        laps: Vec<LapRecord>,
    ) -> Result<usize> {
        let legacy = self
            .legacy
            .as_ref()
            .ok_or_else(|| KartwallError::persistence("import_legacy_laps", "no legacy lap source is configured"))?;
        legacy.import_laps(external_user_id, session_id, laps).await
    }

    /// Delete lap history older than the retention window. Returns the number
    /// of lap records removed.
    pub async fn cleanup_old_records(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.retention;
        let purged = self.store.purge_before(cutoff).await?;
        info!(laps = purged.laps, summaries = purged.summaries, %cutoff, "Cleaned up old lap records");
        Ok(purged.laps)
    }

    async fn resolve_driver(&self, external_user_id: &str) -> Result<Option<String>> {
        let profile = self.identity.resolve(external_user_id).await?;
        if profile.is_none() {
            debug!(external_user_id, "No linked driver for external user");
        }
        Ok(profile.map(|profile| profile.driver_name))
    }
}
