//! Driver identity: profiles, external-user linking and cross-session stats
//!
//! The timing system only knows drivers by the name typed at the track. The
//! [`DriverIdentityAggregator`] owns the [`DriverProfile`] collection, links a
//! profile to an external user id and rolls up [`DriverStats`] from the lap
//! history. It only reads lap data; capture owns the lap collections.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::store::{LapStore, ProfileStore};
use crate::types::{DriverProfile, DriverStats, DriverSummary, LinkingStatus, Lookup};
use crate::{KartwallError, Result};

mod stats;

pub use stats::compute_stats;

/// Maps an external user identity to the driver the timing system knows.
///
/// Consumed by the capture service; implemented by [`DriverIdentityAggregator`].
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    /// The profile linked to this external user, if any.
    async fn resolve(&self, external_user_id: &str) -> Result<Option<DriverProfile>>;

    /// Make sure every name has a profile. Returns how many were created.
    async fn register_drivers(&self, driver_names: &[String]) -> Result<usize>;
}

/// Manual linking request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    pub driver_name: String,
    pub external_user_id: String,
    #[serde(default = "LinkRequest::default_status")]
    pub linking_status: LinkingStatus,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl LinkRequest {
    pub fn new(driver_name: impl Into<String>, external_user_id: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            external_user_id: external_user_id.into(),
            linking_status: LinkingStatus::Linked,
            first_name: None,
            last_name: None,
            alias: None,
        }
    }

    fn default_status() -> LinkingStatus {
        LinkingStatus::Linked
    }
}

pub struct DriverIdentityAggregator {
    profiles: Arc<dyn ProfileStore>,
    laps: Arc<dyn LapStore>,
    clock: Arc<dyn Clock>,
}

impl DriverIdentityAggregator {
    pub fn new(profiles: Arc<dyn ProfileStore>, laps: Arc<dyn LapStore>) -> Self {
        Self { profiles, laps, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Profile, chronological session list and stats for an external user.
    ///
    /// A profile with a pending link is found too; its status tells the caller.
    pub async fn get_driver_by_external_id(
        &self,
        external_user_id: &str,
    ) -> Result<Lookup<DriverSummary>> {
        match self.profiles.profile_by_external_id(external_user_id).await? {
            Some(profile) => Ok(Lookup::Found(self.summarize(profile).await?)),
            None => {
                debug!(external_user_id, "No driver linked to external user");
                Ok(Lookup::NotFound)
            }
        }
    }

    /// All profiles ordered by driver name.
    pub async fn list_all_drivers(&self) -> Result<Vec<DriverProfile>> {
        let mut profiles = self.profiles.profiles().await?;
        profiles.sort_by(|a, b| a.driver_name.cmp(&b.driver_name));
        Ok(profiles)
    }

    /// Create unlinked profiles for names not seen before.
    pub async fn register_drivers(&self, driver_names: &[String]) -> Result<usize> {
        let now = self.clock.now();
        let mut created = 0;
        for name in driver_names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if self.profiles.insert_profile_if_absent(DriverProfile::unlinked(name, now)).await? {
                debug!(driver = name, "Registered new driver");
                created += 1;
            }
        }
        Ok(created)
    }

    /// Associate an external user with a driver.
    ///
    /// Fails with [`KartwallError::IdentityConflict`] when the external id is
    /// already linked to a different driver; the profile store checks this in
    /// the same write that stores the link. Linking with status `unlinked`
    /// removes the association.
    pub async fn link_identity(&self, request: LinkRequest) -> Result<DriverProfile> {
        let driver_name = request.driver_name.trim();
        let external_user_id = request.external_user_id.trim();
        if driver_name.is_empty() {
            return Err(KartwallError::missing("driverName"));
        }
        if external_user_id.is_empty() {
            return Err(KartwallError::missing("externalUserId"));
        }

        let now = self.clock.now();
        let mut profile = self
            .profiles
            .profile(driver_name)
            .await?
            .unwrap_or_else(|| DriverProfile::unlinked(driver_name, now));

        profile.linking_status = request.linking_status;
        profile.external_user_id = match request.linking_status {
            LinkingStatus::Unlinked => None,
            LinkingStatus::Pending | LinkingStatus::Linked => Some(external_user_id.to_string()),
        };
        if request.first_name.is_some() {
            profile.first_name = request.first_name;
        }
        if request.last_name.is_some() {
            profile.last_name = request.last_name;
        }
        if request.alias.is_some() {
            profile.alias = request.alias;
        }
        profile.updated_at = now;

        self.profiles.put_profile(profile.clone()).await?;
        info!(
            driver = %profile.driver_name,
            external_user_id,
            status = ?profile.linking_status,
            "Driver identity updated"
        );
        Ok(profile)
    }

    /// Stats for one driver, recomputed from the lap history.
    pub async fn driver_stats(&self, driver_name: &str) -> Result<DriverStats> {
        let summaries = self.laps.driver_summaries(driver_name).await?;
        let laps = self.laps.driver_laps(driver_name).await?;
        Ok(compute_stats(&summaries, &laps))
    }

    async fn summarize(&self, profile: DriverProfile) -> Result<DriverSummary> {
        let mut sessions = self.laps.driver_summaries(&profile.driver_name).await?;
        let laps = self.laps.driver_laps(&profile.driver_name).await?;
        let stats = compute_stats(&sessions, &laps);

        // Stored most recent first; the summary lists sessions oldest first.
        sessions.reverse();
        Ok(DriverSummary { profile, sessions, stats })
    }
}

#[async_trait::async_trait]
impl IdentityResolver for DriverIdentityAggregator {
    /// Only a confirmed link resolves; pending links do not expose lap data.
    async fn resolve(&self, external_user_id: &str) -> Result<Option<DriverProfile>> {
        let profile = self.profiles.profile_by_external_id(external_user_id).await?;
        Ok(profile.filter(DriverProfile::is_linked))
    }

    async fn register_drivers(&self, driver_names: &[String]) -> Result<usize> {
        DriverIdentityAggregator::register_drivers(self, driver_names).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::{LapRecord, SessionId};
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        identity: DriverIdentityAggregator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap()));
        let identity = DriverIdentityAggregator::new(store.clone(), store.clone()).with_clock(clock.clone());
        Fixture { store, clock, identity }
    }

    async fn seed_session(store: &MemoryStore, session: &str, driver: &str, position: u32, day: u32) {
        let recorded_at = Utc.with_ymd_and_hms(2026, 10, day, 12, 0, 0).unwrap();
        let laps: Vec<LapRecord> = (1..=2)
            .map(|n| LapRecord {
                session_id: SessionId::new(session),
                session_name: session.into(),
                driver_key: driver.into(),
                lap_number: n,
                lap_time_ms: 45_000 + n as u64 * 100,
                position,
                kart_number: 7,
                recorded_at,
            })
            .collect();
        store.upsert_driver_laps(&SessionId::new(session), driver, laps).await.unwrap();
    }

    #[tokio::test]
    async fn register_creates_each_name_once() {
        let f = fixture();
        let names = vec!["Max".to_string(), "Charles".to_string(), " ".to_string()];

        assert_eq!(f.identity.register_drivers(&names).await.unwrap(), 2);
        f.clock.advance(Duration::hours(1));
        assert_eq!(f.identity.register_drivers(&names).await.unwrap(), 0);

        let drivers = f.identity.list_all_drivers().await.unwrap();
        let listed: Vec<_> = drivers.iter().map(|p| p.driver_name.as_str()).collect();
        assert_eq!(listed, vec!["Charles", "Max"]);
        assert!(drivers.iter().all(|p| p.linking_status == LinkingStatus::Unlinked));
    }

    #[tokio::test]
    async fn unknown_external_user_is_not_found() {
        let f = fixture();
        assert_eq!(f.identity.get_driver_by_external_id("nobody").await.unwrap(), Lookup::NotFound);
        assert!(f.identity.resolve("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn linked_driver_summary_has_sessions_and_stats() {
        let f = fixture();
        seed_session(&f.store, "s2", "Max", 3, 2).await;
        seed_session(&f.store, "s1", "Max", 1, 1).await;
        seed_session(&f.store, "s1", "Charles", 2, 1).await;
        f.identity.register_drivers(&["Max".to_string()]).await.unwrap();

        let mut request = LinkRequest::new("Max", "user-1");
        request.first_name = Some("Max".into());
        let profile = f.identity.link_identity(request).await.unwrap();
        assert!(profile.is_linked());

        let summary = f.identity.get_driver_by_external_id("user-1").await.unwrap().found().unwrap();
        assert_eq!(summary.profile.first_name.as_deref(), Some("Max"));
        let order: Vec<_> = summary.sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(order, vec!["s1", "s2"]);
        assert_eq!(summary.stats.total_sessions, 2);
        assert_eq!(summary.stats.total_laps, 4);
        assert_eq!(summary.stats.wins, 1);
        assert_eq!(summary.stats.podiums, 2);

        assert_eq!(f.identity.driver_stats("Max").await.unwrap(), summary.stats);
        assert_eq!(f.identity.resolve("user-1").await.unwrap().unwrap().driver_name, "Max");
    }

    #[tokio::test]
    async fn external_id_cannot_link_two_drivers() {
        let f = fixture();
        f.identity.link_identity(LinkRequest::new("Max", "user-1")).await.unwrap();

        let err = f.identity.link_identity(LinkRequest::new("Charles", "user-1")).await.unwrap_err();
        assert!(matches!(err, KartwallError::IdentityConflict { ref linked_driver, .. } if linked_driver == "Max"));
        assert!(err.is_caller_error());

        f.identity.link_identity(LinkRequest::new("Max", "user-1")).await.unwrap();
    }

    #[tokio::test]
    async fn racing_links_for_one_external_id_admit_one_driver() {
        let f = fixture();
        let (max, charles) = tokio::join!(
            f.identity.link_identity(LinkRequest::new("Max", "user-1")),
            f.identity.link_identity(LinkRequest::new("Charles", "user-1")),
        );
        assert_eq!(max.is_ok() as u8 + charles.is_ok() as u8, 1);
        let err = max.err().or(charles.err()).unwrap();
        assert!(matches!(err, KartwallError::IdentityConflict { .. }));

        let linked: Vec<_> = f
            .identity
            .list_all_drivers()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.external_user_id.as_deref() == Some("user-1"))
            .collect();
        assert_eq!(linked.len(), 1);
    }

    #[tokio::test]
    async fn pending_links_are_visible_but_do_not_resolve() {
        let f = fixture();
        let mut request = LinkRequest::new("Max", "user-1");
        request.linking_status = LinkingStatus::Pending;
        f.identity.link_identity(request).await.unwrap();

        let summary = f.identity.get_driver_by_external_id("user-1").await.unwrap().found().unwrap();
        assert_eq!(summary.profile.linking_status, LinkingStatus::Pending);
        assert!(f.identity.resolve("user-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unlinking_frees_the_external_id() {
        let f = fixture();
        f.identity.link_identity(LinkRequest::new("Max", "user-1")).await.unwrap();

        let mut unlink = LinkRequest::new("Max", "user-1");
        unlink.linking_status = LinkingStatus::Unlinked;
        let profile = f.identity.link_identity(unlink).await.unwrap();
        assert_eq!(profile.external_user_id, None);

        f.identity.link_identity(LinkRequest::new("Charles", "user-1")).await.unwrap();
        assert_eq!(f.identity.resolve("user-1").await.unwrap().unwrap().driver_name, "Charles");
    }

    #[tokio::test]
    async fn link_requires_both_ids() {
        let f = fixture();
        let err = f.identity.link_identity(LinkRequest::new(" ", "user-1")).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid driverName: is required");
        let err = f.identity.link_identity(LinkRequest::new("Max", "")).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid externalUserId: is required");
    }
}
