use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 3600;

/// Estimate the remaining transfer time from the current throughput, rounded
/// to a granularity that matches the magnitude of the estimate. An unknown
/// throughput (zero) yields a zero estimate.
pub fn estimate(bytes_remaining: u64, speed: u64) -> Duration {
    if speed == 0 {
        return Duration::ZERO;
    }
    let raw = bytes_remaining / speed;
    let granularity = match raw {
        secs if secs > 8 * HOUR => HOUR,
        secs if secs > 4 * HOUR => 30 * MINUTE,
        secs if secs > 2 * HOUR => 15 * MINUTE,
        secs if secs > HOUR => 5 * MINUTE,
        secs if secs > 30 * MINUTE => MINUTE,
        secs if secs > 15 * MINUTE => 30,
        secs if secs > 5 * MINUTE => 15,
        secs if secs > MINUTE => 5,
        _ => 1,
    };
    Duration::from_secs(round_to(raw, granularity))
}

fn round_to(secs: u64, granularity: u64) -> u64 {
    (secs + granularity / 2) / granularity * granularity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_speed_yields_zero() {
        assert_eq!(Duration::ZERO, estimate(100, 0));
        assert_eq!(Duration::ZERO, estimate(0, 0));
    }

    #[test]
    fn test_exact_seconds_below_one_minute() {
        assert_eq!(Duration::from_secs(30), estimate(30, 1));
        assert_eq!(Duration::from_secs(60), estimate(600, 10));
    }

    #[test]
    fn test_rounding_per_bracket() {
        // just above a minute, nearest 5s
        assert_eq!(Duration::from_secs(60), estimate(62, 1));
        // above 5 min, nearest 15s
        assert_eq!(Duration::from_secs(405), estimate(400, 1));
        // above 15 min, nearest 30s
        assert_eq!(Duration::from_secs(990), estimate(1000, 1));
        // above 30 min, nearest minute
        assert_eq!(Duration::from_secs(1980), estimate(2000, 1));
        // above 1 h, nearest 5 min
        assert_eq!(Duration::from_secs(3900), estimate(4000, 1));
        // above 2 h, nearest 15 min
        assert_eq!(Duration::from_secs(8100), estimate(8000, 1));
        // above 4 h, nearest 30 min
        assert_eq!(Duration::from_secs(14400), estimate(15000, 1));
        // above 8 h, nearest hour
        assert_eq!(Duration::from_secs(28800), estimate(30000, 1));
    }

    #[test]
    fn test_one_hour_falls_into_minute_bracket() {
        // 3600s is not above the 1h boundary, so it rounds to the nearest
        // minute and stays exactly one hour
        assert_eq!(Duration::from_secs(3600), estimate(36000, 10));
    }
}
