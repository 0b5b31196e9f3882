//! Mean and standard deviation of times of day.

/// Seconds in a day; times of day live in `0..SECONDS_PER_DAY`.
pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeStats {
    /// Seconds since midnight, in `[0, SECONDS_PER_DAY)`
    pub mean: f64,
    pub std_dev: f64,
}

/// Population mean and standard deviation.
pub fn mean_std(values: &[f64]) -> Option<TimeStats> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(TimeStats {
        mean,
        std_dev: variance.sqrt(),
    })
}

/// Mean time of day that copes with midnight.
///
/// Posts at 23:50 and 00:10 average to 12:00 on a straight line. The
/// wrapped variant sorts the values and moves the earlier half to the next
/// day before averaging; whichever variant has the smaller spread wins.
pub fn circular_time_stats(seconds_of_day: &[i64]) -> Option<TimeStats> {
    let mut sorted: Vec<f64> = seconds_of_day.iter().map(|&s| s as f64).collect();
    let plain = mean_std(&sorted)?;

    sorted.sort_by(f64::total_cmp);
    let half = sorted.len() / 2;
    for value in &mut sorted[..half] {
        *value += SECONDS_PER_DAY as f64;
    }
    let wrapped = mean_std(&sorted)?;

    let chosen = if wrapped.std_dev < plain.std_dev {
        wrapped
    } else {
        plain
    };
    Some(TimeStats {
        mean: chosen.mean.rem_euclid(SECONDS_PER_DAY as f64),
        std_dev: chosen.std_dev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mean_std_basic() {
        let stats = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.std_dev, 2.0);
        assert!(mean_std(&[]).is_none());
    }

    #[test]
    fn test_wraps_around_midnight() {
        // 23:50 and 00:10
        let stats = circular_time_stats(&[85_800, 600]).unwrap();
        let distance = stats.mean.min(SECONDS_PER_DAY as f64 - stats.mean);
        assert!(distance < 1.0, "mean was {}", stats.mean);
        assert!((stats.std_dev - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_daytime_values_use_plain_mean() {
        // 10:00, 12:00, 14:00
        let stats = circular_time_stats(&[36_000, 43_200, 50_400]).unwrap();
        assert!((stats.mean - 43_200.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_value() {
        let stats = circular_time_stats(&[3_600]).unwrap();
        assert_eq!(stats.mean, 3_600.0);
        assert_eq!(stats.std_dev, 0.0);
    }

    #[test]
    fn test_empty() {
        assert!(circular_time_stats(&[]).is_none());
    }

    proptest! {
        #[test]
        fn mean_stays_within_a_day(values in prop::collection::vec(0i64..SECONDS_PER_DAY, 1..60)) {
            let stats = circular_time_stats(&values).unwrap();
            prop_assert!(stats.mean >= 0.0);
            prop_assert!(stats.mean < SECONDS_PER_DAY as f64);
        }

        #[test]
        fn spread_never_exceeds_plain(values in prop::collection::vec(0i64..SECONDS_PER_DAY, 1..60)) {
            let floats: Vec<f64> = values.iter().map(|&v| v as f64).collect();
            let plain = mean_std(&floats).unwrap();
            let stats = circular_time_stats(&values).unwrap();
            prop_assert!(stats.std_dev <= plain.std_dev);
        }
    }
}
