//! Driver identity and cross-session statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionSummary;

/// Whether a driver profile is associated with an external user identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkingStatus {
    #[default]
    Unlinked,
    Pending,
    Linked,
}

/// A driver as known to the timing system, optionally linked to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverProfile {
    /// Name exactly as the timing system reports it; the driver key of lap records
    pub driver_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub alias: Option<String>,
    pub external_user_id: Option<String>,
    pub linking_status: LinkingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DriverProfile {
    /// A freshly seen driver with no external identity.
    pub fn unlinked(driver_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            driver_name: driver_name.into(),
            first_name: None,
            last_name: None,
            alias: None,
            external_user_id: None,
            linking_status: LinkingStatus::Unlinked,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linking_status == LinkingStatus::Linked && self.external_user_id.is_some()
    }
}

/// Aggregates across all of a driver's sessions.
///
/// Always recomputed from lap records and session summaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverStats {
    pub total_sessions: u32,
    pub total_laps: u32,
    pub best_lap_ms: Option<u64>,
    pub average_lap_ms: Option<f64>,
    pub average_best_lap_ms: Option<f64>,
    pub best_position: Option<u32>,
    pub average_position: Option<f64>,
    pub wins: u32,
    pub podiums: u32,
    pub favorite_kart: Option<u32>,
    pub first_session_at: Option<DateTime<Utc>>,
    pub last_session_at: Option<DateTime<Utc>>,
}

/// Profile, chronological session list and stats for one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSummary {
    pub profile: DriverProfile,
    pub sessions: Vec<SessionSummary>,
    pub stats: DriverStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linking_status_uses_lowercase_names() {
        assert_eq!(serde_json::to_string(&LinkingStatus::Pending).unwrap(), "\"pending\"");
        let status: LinkingStatus = serde_json::from_str("\"linked\"").unwrap();
        assert_eq!(status, LinkingStatus::Linked);
    }

    #[test]
    fn new_profiles_start_unlinked() {
        let profile = DriverProfile::unlinked("Max V", Utc::now());
        assert_eq!(profile.linking_status, LinkingStatus::Unlinked);
        assert!(!profile.is_linked());
        assert_eq!(profile.created_at, profile.updated_at);
    }
}
