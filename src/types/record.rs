//! Persisted lap history: lap records, session summaries and query shapes

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one heat occurrence.
///
/// Derived from the capture day and the heat name so that a resubmitted
/// payload maps onto the same records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive `YYYYMMDD-<slug>` from a capture date and heat name.
    pub fn derive(name: &str, date: NaiveDate) -> Self {
        let mut slug = String::with_capacity(name.len());
        let mut pending_dash = false;
        for ch in name.chars() {
            if ch.is_alphanumeric() {
                if pending_dash && !slug.is_empty() {
                    slug.push('-');
                }
                pending_dash = false;
                slug.extend(ch.to_lowercase());
            } else {
                pending_dash = true;
            }
        }
        if slug.is_empty() {
            slug.push_str("session");
        }
        Self(format!("{}-{}", date.format("%Y%m%d"), slug))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Uniqueness key of a [`LapRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LapKey {
    pub session_id: SessionId,
    pub driver_key: String,
    pub lap_number: u32,
}

/// One lap driven by one driver in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapRecord {
    pub session_id: SessionId,
    pub session_name: String,
    pub driver_key: String,
    pub lap_number: u32,
    pub lap_time_ms: u64,
    pub position: u32,
    pub kart_number: u32,
    pub recorded_at: DateTime<Utc>,
}

impl LapRecord {
    pub fn key(&self) -> LapKey {
        LapKey {
            session_id: self.session_id.clone(),
            driver_key: self.driver_key.clone(),
            lap_number: self.lap_number,
        }
    }

    /// Same lap content, ignoring when it was written.
    pub fn same_lap(&self, other: &LapRecord) -> bool {
        self.key() == other.key()
            && self.lap_time_ms == other.lap_time_ms
            && self.position == other.position
            && self.kart_number == other.kart_number
    }
}

/// Per-driver result of one session, derived from its lap records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub session_name: String,
    pub driver_key: String,
    pub best_lap_ms: u64,
    pub final_position: u32,
    pub total_laps: u32,
    pub kart_number: u32,
    pub recorded_at: DateTime<Utc>,
}

impl SessionSummary {
    /// Summarize the laps of a single (session, driver) pair.
    ///
    /// The final position and kart come from the highest lap number. Returns
    /// `None` for an empty slice.
    pub fn from_laps(laps: &[LapRecord]) -> Option<Self> {
        let last = laps.iter().max_by_key(|lap| lap.lap_number)?;
        let best_lap_ms = laps.iter().map(|lap| lap.lap_time_ms).min()?;
        let recorded_at = laps.iter().map(|lap| lap.recorded_at).max()?;

        Some(Self {
            session_id: last.session_id.clone(),
            session_name: last.session_name.clone(),
            driver_key: last.driver_key.clone(),
            best_lap_ms,
            final_position: last.position,
            total_laps: laps.len() as u32,
            kart_number: last.kart_number,
            recorded_at,
        })
    }
}

/// A driver's session with its laps, as returned by recent-session queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentSession {
    pub summary: SessionSummary,
    pub laps: Vec<LapRecord>,
}

/// Position held by a driver at the end of one lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionPoint {
    pub lap_number: u32,
    pub position: u32,
}

/// Lap-by-lap race order of one driver within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverPositionTrace {
    pub driver_key: String,
    pub points: Vec<PositionPoint>,
}

/// Result of a lookup where absence is a normal answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Lookup::Found(value),
            None => Lookup::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lap(number: u32, time: u64, position: u32, kart: u32, minute: u32) -> LapRecord {
        LapRecord {
            session_id: SessionId::new("20261018-heat-3"),
            session_name: "Heat 3".into(),
            driver_key: "A".into(),
            lap_number: number,
            lap_time_ms: time,
            position,
            kart_number: kart,
            recorded_at: Utc.with_ymd_and_hms(2026, 10, 18, 12, minute, 0).unwrap(),
        }
    }

    #[test]
    fn session_id_slugs_the_heat_name() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(SessionId::derive("Heat 3", date).as_str(), "20261018-heat-3");
        assert_eq!(SessionId::derive("  Grand  Prix / Final! ", date).as_str(), "20261018-grand-prix-final");
        assert_eq!(SessionId::derive("***", date).as_str(), "20261018-session");
    }

    #[test]
    fn summary_takes_final_lap_and_best_time() {
        let laps = vec![lap(2, 44_890, 2, 7, 2), lap(1, 45_231, 3, 7, 1), lap(3, 45_002, 1, 8, 3)];
        let summary = SessionSummary::from_laps(&laps).unwrap();

        assert_eq!(summary.best_lap_ms, 44_890);
        assert_eq!(summary.final_position, 1);
        assert_eq!(summary.kart_number, 8);
        assert_eq!(summary.total_laps, 3);
        assert_eq!(summary.recorded_at, laps[2].recorded_at);
    }

    #[test]
    fn summary_of_nothing_is_none() {
        assert!(SessionSummary::from_laps(&[]).is_none());
    }

    #[test]
    fn same_lap_ignores_write_time() {
        let a = lap(1, 45_231, 1, 7, 1);
        let mut b = a.clone();
        b.recorded_at = Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap();
        assert!(a.same_lap(&b));
        b.position = 2;
        assert!(!a.same_lap(&b));
    }

    #[test]
    fn lookup_converts_from_option() {
        assert!(Lookup::from(Some(3)).is_found());
        assert_eq!(Lookup::<u8>::from(None), Lookup::NotFound);
        assert_eq!(Lookup::Found(5).found(), Some(5));
    }
}
