//! Vendor timing frame shapes
//!
//! The timing console publishes compact JSON with single-letter keys:
//!
//! ```text
//! {"N":"Heat 3","D":[{"N":"Max","P":1,"K":"7","T":45231,"B":44890,"L":12}]}
//! ```
//!
//! | key | meaning             | accepted forms                         |
//! |-----|---------------------|----------------------------------------|
//! | `N` | session / driver name | string, number                        |
//! | `D` | driver rows         | array                                  |
//! | `P` | position            | integer, numeric string                |
//! | `K` | kart number         | integer, numeric string (`"07"`)       |
//! | `T` | last lap time       | integer ms, decimal seconds, `m:ss.fff`|
//! | `B` | best lap time       | as `T`                                 |
//! | `L` | laps completed      | integer, numeric string                |
//!
//! Every field is optional on the wire and unknown keys are ignored.

use serde::Deserialize;

/// One driver row as published by the console.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WireDriver {
    #[serde(rename = "N")]
    pub name: Option<WireScalar>,
    #[serde(rename = "P")]
    pub position: Option<WireScalar>,
    #[serde(rename = "K")]
    pub kart: Option<WireScalar>,
    #[serde(rename = "T")]
    pub last_lap: Option<WireScalar>,
    #[serde(rename = "B")]
    pub best_lap: Option<WireScalar>,
    #[serde(rename = "L")]
    pub laps: Option<WireScalar>,
}

/// A loosely typed leaf value.
///
/// `Other` absorbs anything unexpected (booleans, nested objects) so a single
/// odd field never invalidates the whole row.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireScalar {
    Integer(i64),
    Float(f64),
    Text(String),
    Other(serde_json::Value),
}

impl WireScalar {
    /// Non-empty text, or a number rendered as text.
    pub fn text(&self) -> Option<String> {
        match self {
            WireScalar::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            WireScalar::Integer(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Non-negative whole number.
    pub fn count(&self) -> Option<u32> {
        match self {
            WireScalar::Integer(n) => u32::try_from(*n).ok(),
            WireScalar::Float(f) if f.fract() == 0.0 && *f >= 0.0 && *f <= u32::MAX as f64 => {
                Some(*f as u32)
            }
            WireScalar::Text(s) => s.trim().parse::<u32>().ok(),
            _ => None,
        }
    }

    /// Lap time in milliseconds.
    ///
    /// Integers are milliseconds, decimals are seconds and strings may use
    /// `m:ss.fff`. Zero or negative times mean "no lap yet" and yield `None`.
    pub fn lap_millis(&self) -> Option<u64> {
        let millis = match self {
            WireScalar::Integer(n) => *n as f64,
            WireScalar::Float(f) => f * 1000.0,
            WireScalar::Text(s) => parse_clock(s.trim())?,
            WireScalar::Other(_) => return None,
        };

        (millis.is_finite() && millis >= 1.0 && millis < u64::MAX as f64)
            .then(|| millis.round() as u64)
    }
}

/// Parse `45231`, `45.231` or `1:05.120` into milliseconds.
fn parse_clock(text: &str) -> Option<f64> {
    if text.is_empty() {
        return None;
    }
    if !text.contains([':', '.']) {
        return text.parse::<u64>().ok().map(|ms| ms as f64);
    }

    let mut total_seconds = 0.0;
    let mut parts = text.rsplit(':');
    let seconds: f64 = parts.next()?.parse().ok()?;
    if !(0.0..60.0).contains(&seconds) && text.contains(':') {
        return None;
    }
    total_seconds += seconds;

    let mut scale = 60.0;
    for part in parts {
        let unit: u32 = part.parse().ok()?;
        total_seconds += unit as f64 * scale;
        scale *= 60.0;
    }

    Some(total_seconds * 1000.0)
}
