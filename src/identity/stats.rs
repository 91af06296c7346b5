//! Cross-session driver statistics
//!
//! Pure functions over lap records and session summaries; the same records
//! always produce the same stats.

use std::collections::BTreeMap;

use crate::types::{DriverStats, LapRecord, SessionSummary};

/// Averages are reported to this many decimals.
const AVERAGE_DECIMALS: i32 = 2;

/// Roll up a driver's stats.
///
/// `summaries` and `laps` may be in any order.
pub fn compute_stats(summaries: &[SessionSummary], laps: &[LapRecord]) -> DriverStats {
    let lap_times: Vec<f64> = laps.iter().map(|lap| lap.lap_time_ms as f64).collect();
    let best_laps: Vec<f64> = summaries.iter().map(|s| s.best_lap_ms as f64).collect();
    let positions: Vec<f64> = summaries.iter().map(|s| s.final_position as f64).collect();

    let best_lap_ms = laps
        .iter()
        .map(|lap| lap.lap_time_ms)
        .min()
        .or_else(|| summaries.iter().map(|s| s.best_lap_ms).min());

    DriverStats {
        total_sessions: summaries.len() as u32,
        total_laps: laps.len() as u32,
        best_lap_ms,
        average_lap_ms: mean(&lap_times),
        average_best_lap_ms: mean(&best_laps),
        best_position: summaries.iter().map(|s| s.final_position).min(),
        average_position: mean(&positions),
        wins: summaries.iter().filter(|s| s.final_position == 1).count() as u32,
        podiums: summaries.iter().filter(|s| (1..=3).contains(&s.final_position)).count() as u32,
        favorite_kart: favorite_kart(summaries, laps),
        first_session_at: summaries.iter().map(|s| s.recorded_at).min(),
        last_session_at: summaries.iter().map(|s| s.recorded_at).max(),
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    Some(round_to(sum / values.len() as f64, AVERAGE_DECIMALS))
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let multiplier = 10f64.powi(decimals);
    (value * multiplier).round() / multiplier
}

/// Kart driven most often, counted per lap. Ties go to the lower kart number.
fn favorite_kart(summaries: &[SessionSummary], laps: &[LapRecord]) -> Option<u32> {
    let mut usage: BTreeMap<u32, usize> = BTreeMap::new();
    if laps.is_empty() {
        for summary in summaries {
            *usage.entry(summary.kart_number).or_default() += 1;
        }
    } else {
        for lap in laps {
            *usage.entry(lap.kart_number).or_default() += 1;
        }
    }

    usage
        .into_iter()
        .max_by(|(kart_a, count_a), (kart_b, count_b)| count_a.cmp(count_b).then(kart_b.cmp(kart_a)))
        .map(|(kart, _)| kart)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn lap(session: &str, number: u32, time: u64, kart: u32) -> LapRecord {
        LapRecord {
            session_id: SessionId::new(session),
            session_name: session.to_string(),
            driver_key: "Max".into(),
            lap_number: number,
            lap_time_ms: time,
            position: 1,
            kart_number: kart,
            recorded_at: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap(),
        }
    }

    fn summary(session: &str, best: u64, position: u32, day: u32) -> SessionSummary {
        SessionSummary {
            session_id: SessionId::new(session),
            session_name: session.to_string(),
            driver_key: "Max".into(),
            best_lap_ms: best,
            final_position: position,
            total_laps: 2,
            kart_number: 7,
            recorded_at: Utc.with_ymd_and_hms(2026, 10, day, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn stats_roll_up_sessions_and_laps() {
        let summaries = vec![summary("s1", 45_000, 1, 1), summary("s2", 44_500, 4, 3), summary("s3", 44_800, 2, 2)];
        let laps = vec![
            lap("s1", 1, 45_000, 7),
            lap("s1", 2, 45_500, 7),
            lap("s2", 1, 44_500, 12),
            lap("s3", 1, 44_800, 12),
            lap("s3", 2, 46_000, 3),
        ];

        let stats = compute_stats(&summaries, &laps);
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.total_laps, 5);
        assert_eq!(stats.best_lap_ms, Some(44_500));
        assert_eq!(stats.average_lap_ms, Some(45_160.0));
        assert_eq!(stats.average_best_lap_ms, Some(44_766.67));
        assert_eq!(stats.best_position, Some(1));
        assert_eq!(stats.average_position, Some(2.33));
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.podiums, 2);
        assert_eq!(stats.favorite_kart, Some(7));
        assert_eq!(stats.first_session_at, Some(summaries[0].recorded_at));
        assert_eq!(stats.last_session_at, Some(summaries[1].recorded_at));
    }

    #[test]
    fn no_records_means_empty_stats() {
        assert_eq!(compute_stats(&[], &[]), DriverStats::default());
    }

    proptest! {
        #[test]
        fn prop_stats_ignore_input_order(
            times in prop::collection::vec((30_000u64..90_000, 1u32..20), 1..30),
            seed in any::<u64>(),
        ) {
            let laps: Vec<LapRecord> = times
                .iter()
                .enumerate()
                .map(|(i, (time, kart))| lap("s", i as u32 + 1, *time, *kart))
                .collect();
            let mut shuffled = laps.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();

            prop_assert_eq!(compute_stats(&[], &laps), compute_stats(&[], &shuffled));
        }
    }
}
