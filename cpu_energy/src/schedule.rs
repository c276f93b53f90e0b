use std::time::Duration;

/// The counters must be read often enough so that they cannot wrap more than
/// once between two reads, otherwise the wraparound correction undercounts.
/// The sampling period is therefore bounded, whatever interval the host asks
/// for.
pub const MAX_SAMPLING_INTERVAL: Duration = Duration::from_secs(60);

/// Returns the interval to schedule the sampling with: the requested
/// interval, bounded by [`MAX_SAMPLING_INTERVAL`].
pub fn bounded_interval(requested: Duration) -> Duration {
    if requested > MAX_SAMPLING_INTERVAL {
        log::info!(
            "requested interval of {}s is too long to catch every counter wraparound, \
             sampling every {}s instead",
            requested.as_secs_f64(),
            MAX_SAMPLING_INTERVAL.as_secs_f64()
        );
        MAX_SAMPLING_INTERVAL
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{bounded_interval, MAX_SAMPLING_INTERVAL};

    #[test]
    fn short_intervals_are_kept() {
        let ten_s = Duration::from_secs(10);
        assert_eq!(bounded_interval(ten_s), ten_s);
        assert_eq!(bounded_interval(MAX_SAMPLING_INTERVAL), MAX_SAMPLING_INTERVAL);
    }

    #[test]
    fn long_intervals_are_bounded() {
        let five_min = Duration::from_secs(300);
        assert_eq!(bounded_interval(five_min), MAX_SAMPLING_INTERVAL);
    }
}
