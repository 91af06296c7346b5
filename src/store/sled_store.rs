//! sled-backed durable store
//!
//! Layout, one tree per collection, values are JSON:
//!
//! | tree        | key                                   | value            |
//! |-------------|---------------------------------------|------------------|
//! | `laps`      | `session \0 driver \0 lap(10 digits)` | [`LapRecord`]    |
//! | `summaries` | `driver \0 session`                   | [`SessionSummary`] |
//! | `profiles`  | `driver`                              | [`DriverProfile`] |
//! | `external`  | `external user id`                    | driver name      |
//! | `legacy`    | `user \0 session \0 lap(10 digits)`    | [`LapRecord`]    |
//!
//! Zero-padded lap numbers make a prefix scan return laps in lap order.
//!
//! Lap writes go through one write gate. A driver upsert reads the driver's
//! stored laps, then commits laps and summary in one transaction, so two
//! writers can never interleave between the read and the commit.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    LapStore, LegacyLapSource, ProfileStore, PurgeCounts, UpsertCounts, check_driver_group, link_conflict,
    sort_recent_first,
};
use crate::types::{DriverProfile, LapRecord, SessionId, SessionSummary};
use crate::{KartwallError, Result};

const SEPARATOR: u8 = 0;

/// Durable store on a sled database.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    laps: sled::Tree,
    summaries: sled::Tree,
    profiles: sled::Tree,
    external: sled::Tree,
    legacy: sled::Tree,
    write_gate: Arc<Mutex<()>>,
}

impl SledStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened lap history store");
        Self::from_db(db)
    }

    /// Store backed by a throwaway database that is deleted on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            laps: db.open_tree("laps")?,
            summaries: db.open_tree("summaries")?,
            profiles: db.open_tree("profiles")?,
            external: db.open_tree("external")?,
            legacy: db.open_tree("legacy")?,
            write_gate: Arc::new(Mutex::new(())),
            db,
        })
    }

    /// Flush pending writes to disk.
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    pub fn lap_count(&self) -> usize {
        self.laps.len()
    }

    pub fn summary_count(&self) -> usize {
        self.summaries.len()
    }
}

fn lap_key(session_id: &SessionId, driver_key: &str, lap_number: u32) -> Vec<u8> {
    let mut key = driver_prefix(session_id, driver_key);
    key.extend_from_slice(format!("{:010}", lap_number).as_bytes());
    key
}

fn session_prefix(session_id: &SessionId) -> Vec<u8> {
    let mut key = session_id.as_str().as_bytes().to_vec();
    key.push(SEPARATOR);
    key
}

fn driver_prefix(session_id: &SessionId, driver_key: &str) -> Vec<u8> {
    let mut key = session_prefix(session_id);
    key.extend_from_slice(driver_key.as_bytes());
    key.push(SEPARATOR);
    key
}

fn summary_key(driver_key: &str, session_id: &SessionId) -> Vec<u8> {
    let mut key = driver_key.as_bytes().to_vec();
    key.push(SEPARATOR);
    key.extend_from_slice(session_id.as_str().as_bytes());
    key
}

fn legacy_prefix(external_user_id: &str, session_id: &SessionId) -> Vec<u8> {
    let mut key = external_user_id.as_bytes().to_vec();
    key.push(SEPARATOR);
    key.extend_from_slice(session_id.as_str().as_bytes());
    key.push(SEPARATOR);
    key
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn scan<T: DeserializeOwned>(iter: sled::Iter) -> Result<Vec<T>> {
    iter.map(|item| {
        let (_, value) = item?;
        decode(&value)
    })
    .collect()
}

fn transaction_failed(operation: &str, err: TransactionError<KartwallError>) -> KartwallError {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(source) => {
            KartwallError::persistence_with_source(operation, Box::new(source))
        }
    }
}

#[async_trait::async_trait]
impl LapStore for SledStore {
    async fn upsert_driver_laps(
        &self,
        session_id: &SessionId,
        driver_key: &str,
        laps: Vec<LapRecord>,
    ) -> Result<UpsertCounts> {
        check_driver_group(session_id, driver_key, &laps)?;
        let _gate = self.write_gate.lock().await;

        let stored: Vec<LapRecord> = scan(self.laps.scan_prefix(driver_prefix(session_id, driver_key)))?;
        let mut group: BTreeMap<u32, LapRecord> = stored.into_iter().map(|lap| (lap.lap_number, lap)).collect();

        let mut counts = UpsertCounts::default();
        let mut writes = Vec::new();
        for lap in laps {
            match group.get(&lap.lap_number) {
                Some(existing) if existing.same_lap(&lap) => {
                    counts.unchanged += 1;
                    continue;
                }
                Some(_) => counts.updated += 1,
                None => counts.created += 1,
            }
            writes.push((lap_key(session_id, driver_key, lap.lap_number), serde_json::to_vec(&lap)?));
            group.insert(lap.lap_number, lap);
        }

        let group: Vec<LapRecord> = group.into_values().collect();
        let summary = match SessionSummary::from_laps(&group) {
            Some(summary) => Some(serde_json::to_vec(&summary)?),
            None => None,
        };
        let summary_slot = summary_key(driver_key, session_id);

        let outcome: std::result::Result<(), TransactionError<KartwallError>> =
            (&self.laps, &self.summaries).transaction(|(laps, summaries)| {
                for (key, value) in &writes {
                    laps.insert(key.as_slice(), value.as_slice())?;
                }
                if let Some(summary) = &summary {
                    summaries.insert(summary_slot.as_slice(), summary.as_slice())?;
                }
                Ok(())
            });

        outcome.map_err(|e| transaction_failed("upsert_driver_laps", e))?;
        Ok(counts)
    }

    async fn driver_session_laps(
        &self,
        session_id: &SessionId,
        driver_key: &str,
    ) -> Result<Vec<LapRecord>> {
        scan(self.laps.scan_prefix(driver_prefix(session_id, driver_key)))
    }

    async fn session_laps(&self, session_id: &SessionId) -> Result<Vec<LapRecord>> {
        scan(self.laps.scan_prefix(session_prefix(session_id)))
    }

    async fn driver_laps(&self, driver_key: &str) -> Result<Vec<LapRecord>> {
        let laps: Vec<LapRecord> = scan(self.laps.iter())?;
        Ok(laps.into_iter().filter(|lap| lap.driver_key == driver_key).collect())
    }

    async fn driver_summaries(&self, driver_key: &str) -> Result<Vec<SessionSummary>> {
        let mut prefix = driver_key.as_bytes().to_vec();
        prefix.push(SEPARATOR);
        let mut summaries: Vec<SessionSummary> = scan(self.summaries.scan_prefix(prefix))?;
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts> {
        let _gate = self.write_gate.lock().await;

        // Lap keys and newest lap per (driver, session) group
        let mut groups: BTreeMap<(String, SessionId), (DateTime<Utc>, Vec<sled::IVec>)> = BTreeMap::new();
        for item in self.laps.iter() {
            let (key, value) = item?;
            let lap: LapRecord = decode(&value)?;
            let group = groups
                .entry((lap.driver_key, lap.session_id))
                .or_insert_with(|| (lap.recorded_at, Vec::new()));
            group.0 = group.0.max(lap.recorded_at);
            group.1.push(key);
        }

        let mut summary_keys = Vec::new();
        for item in self.summaries.iter() {
            let (key, value) = item?;
            let summary: SessionSummary = decode(&value)?;
            let newest = groups
                .get(&(summary.driver_key, summary.session_id))
                .map_or(summary.recorded_at, |(newest, _)| *newest);
            if newest < cutoff {
                summary_keys.push(key);
            }
        }

        let lap_keys: Vec<sled::IVec> = groups
            .into_values()
            .filter(|(newest, _)| *newest < cutoff)
            .flat_map(|(_, keys)| keys)
            .collect();

        let outcome: std::result::Result<PurgeCounts, TransactionError<KartwallError>> =
            (&self.laps, &self.summaries).transaction(|(laps, summaries)| {
                let mut counts = PurgeCounts::default();
                for key in &lap_keys {
                    if laps.remove(key)?.is_some() {
                        counts.laps += 1;
                    }
                }
                for key in &summary_keys {
                    if summaries.remove(key)?.is_some() {
                        counts.summaries += 1;
                    }
                }
                Ok(counts)
            });

        let counts = outcome.map_err(|e| transaction_failed("purge", e))?;
        if counts.laps > 0 || counts.summaries > 0 {
            self.db.flush_async().await?;
        }
        debug!(laps = counts.laps, summaries = counts.summaries, %cutoff, "Purged sled store");
        Ok(counts)
    }
}

#[async_trait::async_trait]
impl ProfileStore for SledStore {
    async fn profile(&self, driver_name: &str) -> Result<Option<DriverProfile>> {
        self.profiles.get(driver_name.as_bytes())?.map(|value| decode(&value)).transpose()
    }

    async fn profile_by_external_id(
        &self,
        external_user_id: &str,
    ) -> Result<Option<DriverProfile>> {
        let Some(name) = self.external.get(external_user_id.as_bytes())? else {
            return Ok(None);
        };
        self.profiles.get(name)?.map(|value| decode(&value)).transpose()
    }

    async fn profiles(&self) -> Result<Vec<DriverProfile>> {
        scan(self.profiles.iter())
    }

    async fn insert_profile_if_absent(&self, profile: DriverProfile) -> Result<bool> {
        let value = serde_json::to_vec(&profile)?;
        let swapped = self.profiles.compare_and_swap(
            profile.driver_name.as_bytes(),
            None as Option<&[u8]>,
            Some(value),
        )?;
        if swapped.is_err() {
            return Ok(false);
        }
        if let Some(external) = &profile.external_user_id {
            self.external.insert(external.as_bytes(), profile.driver_name.as_bytes())?;
        }
        Ok(true)
    }

    async fn put_profile(&self, profile: DriverProfile) -> Result<()> {
        let name = profile.driver_name.as_bytes().to_vec();
        let value = serde_json::to_vec(&profile)?;
        let external = profile.external_user_id.clone();

        let outcome: std::result::Result<(), TransactionError<KartwallError>> =
            (&self.profiles, &self.external).transaction(|(profiles, index)| {
                if let Some(external) = &external {
                    if let Some(holder) = index.get(external.as_bytes())? {
                        let holder = String::from_utf8_lossy(&holder);
                        if let Some(conflict) = link_conflict(&profile, &holder) {
                            return Err(ConflictableTransactionError::Abort(conflict));
                        }
                    }
                }
                if let Some(previous) = profiles.get(&name)? {
                    let previous: DriverProfile = serde_json::from_slice(&previous)
                        .map_err(|e| ConflictableTransactionError::Abort(KartwallError::from(e)))?;
                    if let Some(old) = previous.external_user_id {
                        if external.as_ref() != Some(&old) {
                            index.remove(old.as_bytes())?;
                        }
                    }
                }
                if let Some(external) = &external {
                    index.insert(external.as_bytes(), name.as_slice())?;
                }
                profiles.insert(name.as_slice(), value.as_slice())?;
                Ok(())
            });

        outcome.map_err(|e| transaction_failed("put_profile", e))
    }
}

#[async_trait::async_trait]
impl LegacyLapSource for SledStore {
    async fn session_laps(&self, external_user_id: &str, session_id: &SessionId) -> Result<Vec<LapRecord>> {
        scan(self.legacy.scan_prefix(legacy_prefix(external_user_id, session_id)))
    }

    async fn import_laps(
        &self,
        external_user_id: &str,
        session_id: &SessionId,
        laps: Vec<LapRecord>,
    ) -> Result<usize> {
        let prefix = legacy_prefix(external_user_id, session_id);
        let mut batch = sled::Batch::default();
        for item in self.legacy.scan_prefix(&prefix).keys() {
            batch.remove(item?);
        }

        let mut imported = BTreeMap::new();
        for lap in laps {
            let mut key = prefix.clone();
            key.extend_from_slice(format!("{:010}", lap.lap_number).as_bytes());
            imported.insert(key, serde_json::to_vec(&lap)?);
        }
        let count = imported.len();
        for (key, value) in imported {
            batch.insert(key, value);
        }

        self.legacy.apply_batch(batch)?;
        info!(external_user_id, session = %session_id, laps = count, "Imported legacy laps");
        Ok(count)
    }
}
