//! Next-poll prediction from a source's publishing history.
//!
//! Sources tend to publish at similar times of day and on similar weekdays.
//! The prediction aims to poll just before the next likely post: the day comes
//! from a weekday histogram, the time from the circular mean and spread of past
//! posting times.

mod stats;

pub use stats::{circular_time_stats, mean_std, TimeStats, SECONDS_PER_DAY};

use chrono::{DateTime, Datelike, Duration, Utc};

/// How many recent entries feed the prediction.
pub const HISTORY_SIZE: i64 = 50;

/// Time of day assumed for a source with no history: noon, give or take an hour.
const DEFAULT_TIME: TimeStats = TimeStats {
    mean: 12.0 * 3600.0,
    std_dev: 3600.0,
};

/// No prediction lands sooner than this after `now`.
const MIN_DELAY_SECS: i64 = 3600;

/// With less history than this every day counts as a candidate.
const MIN_HISTORY_SECS: i64 = 7 * SECONDS_PER_DAY;

/// Predict when a source should next be polled.
///
/// `created` holds the creation times (Unix seconds) of the source's most
/// recent entries, in any order. Returns a Unix timestamp at least an hour
/// after `now`.
pub fn predict_due(created: &[i64], now: DateTime<Utc>) -> i64 {
    let time = circular_time_stats(
        &created
            .iter()
            .map(|t| t.rem_euclid(SECONDS_PER_DAY))
            .collect::<Vec<_>>(),
    )
    .unwrap_or(DEFAULT_TIME);

    let day = predict_day(created, now);
    let now_ts = now.timestamp();
    let today = now_ts - now_ts.rem_euclid(SECONDS_PER_DAY);
    let tomorrow = today + SECONDS_PER_DAY;
    let now_of_day = (now_ts - today) as f64;

    let window_start = time.mean - time.std_dev;
    let window_end = time.mean + time.std_dev;
    // The window may run past either midnight
    let day_secs = SECONDS_PER_DAY as f64;
    let in_window = [now_of_day - day_secs, now_of_day, now_of_day + day_secs]
        .iter()
        .any(|t| (window_start..=window_end).contains(t));

    let due = if day > 1 {
        tomorrow + (window_end.round() as i64)
    } else if day == 0 && in_window {
        now_ts + MIN_DELAY_SECS
    } else if day == 0 && now_of_day < window_start {
        today + (window_start.round() as i64)
    } else {
        tomorrow + (window_start.round() as i64)
    };

    due.max(now_ts + MIN_DELAY_SECS)
}

/// Days from today until the next weekday the source usually posts on.
///
/// Short histories say nothing about weekdays, so they predict today.
fn predict_day(created: &[i64], now: DateTime<Utc>) -> i64 {
    let Some(&oldest) = created.iter().min() else {
        return 0;
    };
    if now.timestamp() - oldest < MIN_HISTORY_SECS {
        return 0;
    }

    let mut histogram = [0usize; 7];
    for &timestamp in created {
        if let Some(at) = DateTime::<Utc>::from_timestamp(timestamp, 0) {
            histogram[at.weekday().num_days_from_monday() as usize] += 1;
        }
    }

    let today = now.weekday().num_days_from_monday() as usize;
    (0..7)
        .find(|i| histogram[(today + i) % 7] > 0)
        .map_or(1, |i| i as i64)
}

/// Poll time after a cycle that did not reach the server successfully.
pub fn penalty_due(now: DateTime<Utc>, interval_minutes: i64) -> i64 {
    (now + Duration::minutes(interval_minutes)).timestamp()
}
