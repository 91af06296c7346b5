//! # Timing Protocol Decoding
//!
//! Turns one raw frame from the live timing feed into a [`RaceSnapshot`].
//!
//! ## Guarantees
//!
//! - **Pure**: [`decode`] has no side effects and the same input always gives the same output
//! - **Never panics**: malformed input yields a [`ParseFailure`], never a fault
//! - **Forward compatible**: unknown keys and odd field types are skipped
//! - **Partial rows**: a driver row without a name or position is dropped, the rest of the frame survives
//!
//! ## Pipeline
//!
//! ```text
//! raw text ──► preprocess ──► JSON value ──► driver rows ──► RaceSnapshot
//!                  │               │               │
//!                  ▼               ▼               ▼
//!               Empty           NotJson     MissingDriverList
//! ```
//!
//! [`FrameDecoder`] wraps [`decode`] for stream consumers and keeps the
//! last-known-good snapshot when a frame is rejected.

use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::types::{RaceSnapshot, SnapshotDriver};

mod preprocess;
pub mod wire;

pub use preprocess::preprocess_frame;
use wire::{WireDriver, WireScalar};

/// Why a frame produced no snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("frame is empty")]
    Empty,

    #[error("frame is not JSON: {details}")]
    NotJson { details: String },

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame carries no driver list")]
    MissingDriverList,
}

/// Decode one raw feed frame.
///
/// # Example
///
/// ```rust
/// use kartwall::protocol::{decode, ParseFailure};
///
/// let snapshot = decode(r#"{"N":"Heat 3","D":[{"N":"Max","P":1,"K":7,"T":45231}]}"#).unwrap();
/// assert_eq!(snapshot.active_drivers, 1);
/// assert_eq!(snapshot.drivers[0].last_lap_ms, Some(45231));
///
/// assert_eq!(decode("PING").unwrap_err().to_string(), "frame is not JSON: expected value at line 1 column 1");
/// assert_eq!(decode(r#"{"T":120}"#), Err(ParseFailure::MissingDriverList));
/// ```
pub fn decode(raw: &str) -> Result<RaceSnapshot, ParseFailure> {
    let cleaned = preprocess_frame(raw)?;

    let value: serde_json::Value = serde_json::from_str(&cleaned)
        .map_err(|e| ParseFailure::NotJson { details: e.to_string() })?;

    let serde_json::Value::Object(mut object) = value else {
        return Err(ParseFailure::NotAnObject);
    };

    let Some(serde_json::Value::Array(rows)) = object.remove("D") else {
        return Err(ParseFailure::MissingDriverList);
    };

    let session_name = object
        .remove("N")
        .and_then(|n| serde_json::from_value::<WireScalar>(n).ok())
        .and_then(|n| n.text());

    let total_rows = rows.len();
    let drivers: Vec<SnapshotDriver> = rows.into_iter().filter_map(decode_row).collect();

    if drivers.len() < total_rows {
        trace!(kept = drivers.len(), total = total_rows, "Dropped incomplete driver rows");
    }

    Ok(RaceSnapshot::new(session_name, drivers))
}

fn decode_row(row: serde_json::Value) -> Option<SnapshotDriver> {
    let row: WireDriver = serde_json::from_value(row).ok()?;

    let name = row.name.as_ref().and_then(WireScalar::text)?;
    let position = row.position.as_ref().and_then(WireScalar::count).filter(|p| *p > 0)?;

    Some(SnapshotDriver {
        name,
        position,
        kart_number: row.kart.as_ref().and_then(WireScalar::count),
        last_lap_ms: row.last_lap.as_ref().and_then(WireScalar::lap_millis),
        best_lap_ms: row.best_lap.as_ref().and_then(WireScalar::lap_millis),
        lap_count: row.laps.as_ref().and_then(WireScalar::count),
    })
}

/// Stateful decoder that remembers the last good snapshot.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    last_good: Option<Arc<RaceSnapshot>>,
    accepted: u64,
    rejected: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a frame, replacing the last good snapshot on success.
    ///
    /// On failure the previous snapshot stays current.
    pub fn ingest(&mut self, raw: &str) -> Result<Arc<RaceSnapshot>, ParseFailure> {
        match decode(raw) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.last_good = Some(Arc::clone(&snapshot));
                self.accepted += 1;
                Ok(snapshot)
            }
            Err(failure) => {
                self.rejected += 1;
                Err(failure)
            }
        }
    }

    /// Most recent successfully decoded snapshot.
    pub fn last_good(&self) -> Option<Arc<RaceSnapshot>> {
        self.last_good.clone()
    }

    /// Frames decoded successfully.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Frames rejected.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FRAME: &str = r#"{"N":"Heat 3","C":99,"D":[
        {"N":"Lewis","P":2,"K":"12","T":"45.500","B":45100,"L":4},
        {"N":"Max","P":1,"K":7,"T":45231,"B":44890,"L":4,"G":"-"}
    ]}"#;

    #[test]
    fn decodes_a_full_frame() {
        let snapshot = decode(FRAME).unwrap();

        assert_eq!(snapshot.session_name.as_deref(), Some("Heat 3"));
        assert_eq!(snapshot.active_drivers, 2);

        let leader = snapshot.leader().unwrap();
        assert_eq!(leader.name, "Max");
        assert_eq!(leader.kart_number, Some(7));
        assert_eq!(leader.last_lap_ms, Some(45_231));
        assert_eq!(leader.best_lap_ms, Some(44_890));
        assert_eq!(leader.lap_count, Some(4));

        let second = snapshot.driver("Lewis").unwrap();
        assert_eq!(second.kart_number, Some(12));
        assert_eq!(second.last_lap_ms, Some(45_500));
    }

    #[test]
    fn incomplete_rows_are_skipped() {
        let snapshot = decode(
            r#"{"D":[{"N":"Max","P":1},{"P":2,"K":5},{"N":"Nameless position"},"junk",{"N":"Zero","P":0}]}"#,
        )
        .unwrap();

        assert_eq!(snapshot.active_drivers, 1);
        assert_eq!(snapshot.drivers[0].name, "Max");
        assert_eq!(snapshot.drivers[0].kart_number, None);
        assert!(snapshot.session_name.is_none());
    }

    #[test]
    fn unknown_frames_fail() {
        assert_eq!(decode(""), Err(ParseFailure::Empty));
        assert!(matches!(decode("PING"), Err(ParseFailure::NotJson { .. })));
        assert_eq!(decode("[1,2,3]"), Err(ParseFailure::NotAnObject));
        assert_eq!(decode(r#"{"D":"nope"}"#), Err(ParseFailure::MissingDriverList));
        assert!(matches!(decode(r#"{"D":[{"N":"Max""#), Err(ParseFailure::NotJson { .. })));
    }

    #[test]
    fn empty_driver_list_is_a_valid_empty_grid() {
        let snapshot = decode(r#"{"N":"Warmup","D":[]}"#).unwrap();
        assert_eq!(snapshot.active_drivers, 0);
    }

    #[test]
    fn jsonp_frames_decode() {
        let snapshot = decode(r#"({"D":[{"N":"Max","P":1}]});"#).unwrap();
        assert_eq!(snapshot.active_drivers, 1);
    }

    #[test]
    fn frame_decoder_keeps_last_good_snapshot() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.last_good().is_none());

        let first = decoder.ingest(FRAME).unwrap();
        assert!(decoder.ingest("garbage").is_err());

        let kept = decoder.last_good().unwrap();
        assert!(Arc::ptr_eq(&first, &kept));
        assert_eq!(decoder.accepted(), 1);
        assert_eq!(decoder.rejected(), 1);

        let replaced = decoder.ingest(r#"{"D":[]}"#).unwrap();
        assert_eq!(replaced.active_drivers, 0);
        assert_eq!(decoder.last_good().unwrap().active_drivers, 0);
    }

    prop_compose! {
        fn arb_row()(
            name in "[A-Za-z]{1,10}",
            position in 1u32..40,
            kart in 1u32..60,
            lap in 30_000u64..90_000,
        ) -> (String, u32, u32, u64) {
            (name, position, kart, lap)
        }
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(raw in ".*") {
            let _ = decode(&raw);
        }

        #[test]
        fn prop_decode_never_panics_on_json_like_noise(raw in r#"[{}\[\]":,NDPKTBL0-9a-z ]{0,80}"#) {
            let _ = decode(&raw);
        }

        #[test]
        fn prop_decode_is_deterministic(raw in ".{0,60}") {
            prop_assert_eq!(decode(&raw), decode(&raw));
        }

        #[test]
        fn prop_well_formed_rows_all_survive(rows in prop::collection::vec(arb_row(), 0..12)) {
            let body: Vec<serde_json::Value> = rows
                .iter()
                .map(|(name, position, kart, lap)| serde_json::json!({
                    "N": name, "P": position, "K": kart, "T": lap, "extra": {"nested": [1, 2]}
                }))
                .collect();
            let frame = serde_json::json!({ "N": "Heat", "D": body }).to_string();

            let snapshot = decode(&frame).unwrap();
            prop_assert_eq!(snapshot.active_drivers, rows.len());
            prop_assert!(snapshot.drivers.windows(2).all(|w| w[0].position <= w[1].position));
        }
    }
}
