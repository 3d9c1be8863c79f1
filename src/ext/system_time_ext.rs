use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;

/// Converts filesystem timestamps into the millisecond clock used by tree nodes.
pub trait SystemTimeExt {
    fn to_millis(&self) -> i64;
}

impl SystemTimeExt for SystemTime {
    fn to_millis(&self) -> i64 {
        match self.duration_since(UNIX_EPOCH) {
            Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
            Err(before) => i64::try_from(before.duration().as_millis())
                .map(|millis| -millis)
                .unwrap_or(i64::MIN),
        }
    }
}

pub fn file_time_from_millis(millis: i64) -> FileTime {
    let seconds = millis.div_euclid(1000);
    let nanos = (millis.rem_euclid(1000) * 1_000_000) as u32;
    FileTime::from_unix_time(seconds, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::time::Duration;

    #[rstest]
    #[case(0)]
    #[case(1_500)]
    #[case(1_700_000_000_123)]
    fn test_millis_survive_system_time(#[case] millis: u64) {
        let time = UNIX_EPOCH + Duration::from_millis(millis);
        assert_eq!(time.to_millis(), millis as i64);
    }

    #[test]
    fn test_times_before_epoch_are_negative() {
        let time = UNIX_EPOCH - Duration::from_millis(2_500);
        assert_eq!(time.to_millis(), -2_500);
    }

    #[rstest]
    #[case(1_234, 1, 234_000_000)]
    #[case(-1, -1, 999_000_000)]
    #[case(0, 0, 0)]
    fn test_file_time_from_millis(#[case] millis: i64, #[case] seconds: i64, #[case] nanos: u32) {
        let file_time = file_time_from_millis(millis);
        assert_eq!(file_time.unix_seconds(), seconds);
        assert_eq!(file_time.nanoseconds(), nanos);
    }
}
