use chrono::{DateTime, Timelike, Utc};
use std::time::Duration;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Time remaining from `now` until the next boundary that is a whole multiple
/// of `interval` since midnight UTC.
///
/// Instances that compute their wake-up with this function wake at the same
/// wall-clock instants without talking to each other. Landing exactly on a
/// boundary yields a full `interval`, never zero. A zero interval yields zero.
pub fn calculate(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_nanos = interval.as_nanos();
    if interval_nanos == 0 {
        return Duration::ZERO;
    }

    // chrono reports leap seconds as nanosecond >= 1e9
    let sub_second = u128::from(now.nanosecond()).min(NANOS_PER_SECOND - 1);
    let time_of_day =
        u128::from(now.num_seconds_from_midnight()) * NANOS_PER_SECOND + sub_second;

    let remaining = interval_nanos - time_of_day % interval_nanos;
    Duration::from_nanos(remaining as u64)
}
