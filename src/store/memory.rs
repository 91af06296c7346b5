//! In-memory store for tests and embedding

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    LapStore, LegacyLapSource, ProfileStore, PurgeCounts, UpsertCounts, check_driver_group, link_conflict,
    sort_recent_first,
};
use crate::Result;
use crate::types::{DriverProfile, LapKey, LapRecord, SessionId, SessionSummary};

/// Every collection behind one lock, so a purge is a single atomic step.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    laps: BTreeMap<LapKey, LapRecord>,
    /// Keyed by (driver, session)
    summaries: BTreeMap<(String, SessionId), SessionSummary>,
    profiles: BTreeMap<String, DriverProfile>,
    /// external user id -> driver name
    external: HashMap<String, String>,
    /// Keyed by (external user id, session)
    legacy: HashMap<(String, SessionId), Vec<LapRecord>>,
}

impl MemoryState {
    fn merge_laps(&mut self, laps: Vec<LapRecord>) -> UpsertCounts {
        let mut counts = UpsertCounts::default();
        for lap in laps {
            match self.laps.get_mut(&lap.key()) {
                Some(existing) if existing.same_lap(&lap) => counts.unchanged += 1,
                Some(existing) => {
                    *existing = lap;
                    counts.updated += 1;
                }
                None => {
                    self.laps.insert(lap.key(), lap);
                    counts.created += 1;
                }
            }
        }
        counts
    }

    fn group_laps(&self, session_id: &SessionId, driver_key: &str) -> Vec<LapRecord> {
        self.laps
            .values()
            .filter(|lap| &lap.session_id == session_id && lap.driver_key == driver_key)
            .cloned()
            .collect()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored lap records.
    pub async fn lap_count(&self) -> usize {
        self.state.read().await.laps.len()
    }

    /// Number of stored session summaries.
    pub async fn summary_count(&self) -> usize {
        self.state.read().await.summaries.len()
    }
}

#[async_trait::async_trait]
impl LapStore for MemoryStore {
    async fn upsert_driver_laps(
        &self,
        session_id: &SessionId,
        driver_key: &str,
        laps: Vec<LapRecord>,
    ) -> Result<UpsertCounts> {
        check_driver_group(session_id, driver_key, &laps)?;
        let mut state = self.state.write().await;
        let counts = state.merge_laps(laps);
        if let Some(summary) = SessionSummary::from_laps(&state.group_laps(session_id, driver_key)) {
            state.summaries.insert((driver_key.to_string(), session_id.clone()), summary);
        }
        Ok(counts)
    }

    async fn driver_session_laps(
        &self,
        session_id: &SessionId,
        driver_key: &str,
    ) -> Result<Vec<LapRecord>> {
        Ok(self.state.read().await.group_laps(session_id, driver_key))
    }

    async fn session_laps(&self, session_id: &SessionId) -> Result<Vec<LapRecord>> {
        let state = self.state.read().await;
        Ok(state.laps.values().filter(|lap| &lap.session_id == session_id).cloned().collect())
    }

    async fn driver_laps(&self, driver_key: &str) -> Result<Vec<LapRecord>> {
        let state = self.state.read().await;
        Ok(state.laps.values().filter(|lap| lap.driver_key == driver_key).cloned().collect())
    }

    async fn driver_summaries(&self, driver_key: &str) -> Result<Vec<SessionSummary>> {
        let state = self.state.read().await;
        let mut summaries: Vec<SessionSummary> = state
            .summaries
            .values()
            .filter(|summary| summary.driver_key == driver_key)
            .cloned()
            .collect();
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeCounts> {
        let mut state = self.state.write().await;

        // Newest lap per (driver, session) group
        let mut newest: HashMap<(String, SessionId), DateTime<Utc>> = HashMap::new();
        for lap in state.laps.values() {
            let at = newest.entry((lap.driver_key.clone(), lap.session_id.clone())).or_insert(lap.recorded_at);
            *at = (*at).max(lap.recorded_at);
        }

        let laps_before = state.laps.len();
        state.laps.retain(|_, lap| {
            newest
                .get(&(lap.driver_key.clone(), lap.session_id.clone()))
                .is_some_and(|at| *at >= cutoff)
        });
        let summaries_before = state.summaries.len();
        state.summaries.retain(|key, summary| newest.get(key).copied().unwrap_or(summary.recorded_at) >= cutoff);

        let counts = PurgeCounts {
            laps: laps_before - state.laps.len(),
            summaries: summaries_before - state.summaries.len(),
        };
        debug!(laps = counts.laps, summaries = counts.summaries, %cutoff, "Purged memory store");
        Ok(counts)
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryStore {
    async fn profile(&self, driver_name: &str) -> Result<Option<DriverProfile>> {
        Ok(self.state.read().await.profiles.get(driver_name).cloned())
    }

    async fn profile_by_external_id(
        &self,
        external_user_id: &str,
    ) -> Result<Option<DriverProfile>> {
        let state = self.state.read().await;
        Ok(state.external.get(external_user_id).and_then(|name| state.profiles.get(name)).cloned())
    }

    async fn profiles(&self) -> Result<Vec<DriverProfile>> {
        Ok(self.state.read().await.profiles.values().cloned().collect())
    }

    async fn insert_profile_if_absent(&self, profile: DriverProfile) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.profiles.contains_key(&profile.driver_name) {
            return Ok(false);
        }
        if let Some(external) = &profile.external_user_id {
            state.external.insert(external.clone(), profile.driver_name.clone());
        }
        state.profiles.insert(profile.driver_name.clone(), profile);
        Ok(true)
    }

    async fn put_profile(&self, profile: DriverProfile) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let holder = profile.external_user_id.as_ref().and_then(|external| state.external.get(external));
        if let Some(conflict) = holder.and_then(|holder| link_conflict(&profile, holder)) {
            return Err(conflict);
        }

        let previous = state
            .profiles
            .get(&profile.driver_name)
            .and_then(|existing| existing.external_user_id.clone());
        if let Some(previous) = previous {
            if profile.external_user_id.as_ref() != Some(&previous) {
                state.external.remove(&previous);
            }
        }
        if let Some(external) = &profile.external_user_id {
            state.external.insert(external.clone(), profile.driver_name.clone());
        }
        state.profiles.insert(profile.driver_name.clone(), profile);
        Ok(())
    }
}

#[async_trait::async_trait]
impl LegacyLapSource for MemoryStore {
    async fn session_laps(&self, external_user_id: &str, session_id: &SessionId) -> Result<Vec<LapRecord>> {
        let state = self.state.read().await;
        Ok(state
            .legacy
            .get(&(external_user_id.to_string(), session_id.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn import_laps(
        &self,
        external_user_id: &str,
        session_id: &SessionId,
        laps: Vec<LapRecord>,
    ) -> Result<usize> {
        let by_lap: BTreeMap<u32, LapRecord> = laps.into_iter().map(|lap| (lap.lap_number, lap)).collect();
        let laps: Vec<LapRecord> = by_lap.into_values().collect();
        let count = laps.len();
        let mut state = self.state.write().await;
        state.legacy.insert((external_user_id.to_string(), session_id.clone()), laps);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn upsert_is_idempotent() {
        contract::upsert_is_idempotent(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn queries_are_scoped() {
        contract::queries_are_scoped(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn summaries_are_recent_first() {
        contract::summaries_are_recent_first(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn purge_removes_only_old_records() {
        let store = MemoryStore::new();
        contract::purge_removes_only_old_records(&store).await;
        assert_eq!(store.lap_count().await, 1);
        assert_eq!(store.summary_count().await, 1);
    }

    #[tokio::test]
    async fn driver_upsert_rebuilds_the_summary() {
        contract::driver_upsert_rebuilds_the_summary(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn concurrent_driver_upserts_keep_every_lap_in_the_summary() {
        contract::concurrent_driver_upserts_keep_every_lap_in_the_summary(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn purge_keeps_a_corrected_group_whole() {
        let store = MemoryStore::new();
        contract::purge_keeps_a_corrected_group_whole(&store).await;
        assert_eq!(store.lap_count().await, 0);
    }

    #[tokio::test]
    async fn profiles_keep_external_index() {
        contract::profiles_keep_external_index(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn taken_external_id_is_refused() {
        contract::taken_external_id_is_refused(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn legacy_laps_are_kept_per_user() {
        contract::legacy_laps_are_kept_per_user(&MemoryStore::new()).await;
    }
}
