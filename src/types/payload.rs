//! Finalized session payloads submitted for capture
//!
//! Payloads arrive driver-centric: every driver carries its own lap list.
//! [`RawSessionPayload`] mirrors the wire shape with every field optional so
//! that a missing name or driver list is reported as a validation error rather
//! than a deserialization failure deep inside storage code.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{KartwallError, Result};

/// Unvalidated payload exactly as submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSessionPayload {
    pub name: Option<String>,
    pub drivers: Option<Vec<RawDriverLaps>>,
    /// Day the session ran, as `YYYY-MM-DD`. Defaults to the UTC capture day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_date: Option<NaiveDate>,
}

/// Unvalidated driver entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDriverLaps {
    pub driver_key: Option<String>,
    #[serde(default)]
    pub laps: Vec<LapEntry>,
}

/// One lap as submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapEntry {
    pub lap_number: u32,
    pub lap_time_ms: u64,
    pub position: u32,
    pub kart_number: u32,
}

/// A payload that passed ingress validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub name: String,
    pub drivers: Vec<DriverLaps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_date: Option<NaiveDate>,
}

/// A validated driver entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLaps {
    pub driver_key: String,
    pub laps: Vec<LapEntry>,
}

impl SessionPayload {
    /// Validate a raw payload.
    ///
    /// Rejects a missing or blank session name, a missing or empty driver list,
    /// a blank driver key and lap number zero. Names and keys are trimmed.
    pub fn validate(raw: RawSessionPayload) -> Result<Self> {
        let name = match raw.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(KartwallError::missing("name")),
        };

        let raw_drivers = match raw.drivers {
            Some(drivers) if !drivers.is_empty() => drivers,
            Some(_) => return Err(KartwallError::validation("drivers", "must not be empty")),
            None => return Err(KartwallError::missing("drivers")),
        };

        let mut drivers = Vec::with_capacity(raw_drivers.len());
        for (index, entry) in raw_drivers.into_iter().enumerate() {
            let driver_key = match entry.driver_key.as_deref().map(str::trim) {
                Some(key) if !key.is_empty() => key.to_string(),
                _ => return Err(KartwallError::missing(format!("drivers[{index}].driverKey"))),
            };

            if let Some(lap) = entry.laps.iter().find(|lap| lap.lap_number == 0) {
                return Err(KartwallError::validation(
                    format!("drivers[{index}].laps"),
                    format!("lap number must start at 1 (lap time {} ms)", lap.lap_time_ms),
                ));
            }

            drivers.push(DriverLaps { driver_key, laps: entry.laps });
        }

        Ok(Self { name, drivers, session_date: raw.session_date })
    }

    /// Parse and validate a JSON payload.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawSessionPayload = serde_json::from_str(json)
            .map_err(|e| KartwallError::validation("sessionData", e.to_string()))?;
        Self::validate(raw)
    }

    /// Total laps across all drivers.
    pub fn lap_count(&self) -> usize {
        self.drivers.iter().map(|d| d.laps.len()).sum()
    }
}

impl TryFrom<RawSessionPayload> for SessionPayload {
    type Error = KartwallError;

    fn try_from(raw: RawSessionPayload) -> Result<Self> {
        Self::validate(raw)
    }
}
