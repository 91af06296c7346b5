//! Live standings decoded from the timing feed

use serde::{Deserialize, Serialize};

/// Current standings as reported by the most recent feed frame.
///
/// A snapshot is replaced wholesale on every decoded frame. It is never merged
/// with a previous one, so a driver missing from a frame is no longer active.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceSnapshot {
    /// Heat name when the frame carries one
    pub session_name: Option<String>,
    /// Active drivers, ordered by position
    pub drivers: Vec<SnapshotDriver>,
    /// Number of active drivers in the frame
    pub active_drivers: usize,
}

/// One driver row in a [`RaceSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDriver {
    pub name: String,
    pub position: u32,
    pub kart_number: Option<u32>,
    pub last_lap_ms: Option<u64>,
    pub best_lap_ms: Option<u64>,
    pub lap_count: Option<u32>,
}

impl RaceSnapshot {
    /// Build a snapshot from decoded rows, ordering them by position.
    pub fn new(session_name: Option<String>, mut drivers: Vec<SnapshotDriver>) -> Self {
        drivers.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
        let active_drivers = drivers.len();
        Self { session_name, drivers, active_drivers }
    }

    /// The driver currently in first place.
    pub fn leader(&self) -> Option<&SnapshotDriver> {
        self.drivers.first()
    }

    /// Look up a driver row by name.
    pub fn driver(&self, name: &str) -> Option<&SnapshotDriver> {
        self.drivers.iter().find(|d| d.name == name)
    }

    /// Fastest best lap across the field.
    pub fn fastest_lap_ms(&self) -> Option<u64> {
        self.drivers.iter().filter_map(|d| d.best_lap_ms).min()
    }
}
