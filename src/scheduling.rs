use chrono::{DateTime, Duration, Utc};

use crate::error::ApiError;

/// Canonical appointment time window. `end_at` is exclusive; two windows
/// collide when `a.start_at < b.end_at && a.end_at > b.start_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration_min: i32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("start_at is required")]
    MissingStart,
    #[error("end_at must be after start_at")]
    EndNotAfterStart,
    #[error("either duration_min or end_at is required")]
    MissingEndOrDuration,
}

impl From<RangeError> for ApiError {
    fn from(e: RangeError) -> Self {
        ApiError::validation(e.to_string())
    }
}

/// Reconciles (start, end, duration) into a canonical window.
///
/// A positive `duration_min` wins over `end_at`; otherwise the duration is
/// derived from `end_at`, rounded up to whole minutes with a floor of 1.
pub fn normalize_range(
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    duration_min: Option<i32>,
) -> Result<TimeRange, RangeError> {
    let start_at = start_at.ok_or(RangeError::MissingStart)?;

    if let Some(d) = duration_min {
        if d > 0 {
            return Ok(TimeRange {
                start_at,
                end_at: start_at + Duration::minutes(d as i64),
                duration_min: d,
            });
        }
    }

    if let Some(end_at) = end_at {
        if end_at <= start_at {
            return Err(RangeError::EndNotAfterStart);
        }
        let secs = (end_at - start_at).num_seconds();
        let duration_min = ((secs + 59) / 60).max(1) as i32;
        return Ok(TimeRange {
            start_at,
            end_at,
            duration_min,
        });
    }

    Err(RangeError::MissingEndOrDuration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn duration_wins_over_end() {
        let r = normalize_range(Some(at(9, 0)), Some(at(11, 0)), Some(30)).unwrap();
        assert_eq!(r.start_at, at(9, 0));
        assert_eq!(r.end_at, at(9, 30));
        assert_eq!(r.duration_min, 30);
    }

    #[test]
    fn end_only_derives_duration() {
        let r = normalize_range(Some(at(9, 0)), Some(at(9, 45)), None).unwrap();
        assert_eq!(r.end_at, at(9, 45));
        assert_eq!(r.duration_min, 45);
    }

    #[test]
    fn non_positive_duration_falls_back_to_end() {
        let r = normalize_range(Some(at(9, 0)), Some(at(10, 0)), Some(0)).unwrap();
        assert_eq!(r.end_at, at(10, 0));
        assert_eq!(r.duration_min, 60);
    }

    #[test]
    fn sub_minute_window_rounds_up_to_one() {
        let end = at(9, 0) + Duration::seconds(20);
        let r = normalize_range(Some(at(9, 0)), Some(end), None).unwrap();
        assert_eq!(r.duration_min, 1);
    }

    #[test]
    fn partial_minutes_round_up() {
        let end = at(9, 0) + Duration::seconds(61);
        let r = normalize_range(Some(at(9, 0)), Some(end), None).unwrap();
        assert_eq!(r.duration_min, 2);
    }

    #[test]
    fn missing_start_rejected() {
        assert_eq!(
            normalize_range(None, Some(at(9, 30)), Some(30)),
            Err(RangeError::MissingStart)
        );
    }

    #[test]
    fn end_before_start_rejected() {
        assert_eq!(
            normalize_range(Some(at(10, 0)), Some(at(9, 0)), None),
            Err(RangeError::EndNotAfterStart)
        );
        assert_eq!(
            normalize_range(Some(at(10, 0)), Some(at(10, 0)), None),
            Err(RangeError::EndNotAfterStart)
        );
    }

    #[test]
    fn neither_end_nor_duration_rejected() {
        assert_eq!(
            normalize_range(Some(at(9, 0)), None, None),
            Err(RangeError::MissingEndOrDuration)
        );
    }

    #[test]
    fn duration_path_keeps_end_consistent() {
        for d in [1, 15, 30, 90] {
            let r = normalize_range(Some(at(8, 0)), None, Some(d)).unwrap();
            assert_eq!(r.end_at, r.start_at + Duration::minutes(d as i64));
            assert!(r.duration_min >= 1);
        }
    }

    #[test]
    fn booking_scenario_windows_overlap() {
        // First booking 09:00 + 30min, candidate 09:15 + 30min: the half-open
        // predicate must report a collision (09:15 < 09:30 and 09:45 > 09:00).
        let a = normalize_range(Some(at(9, 0)), None, Some(30)).unwrap();
        let b = normalize_range(Some(at(9, 15)), None, Some(30)).unwrap();
        assert!(a.start_at < b.end_at && a.end_at > b.start_at);

        // Back-to-back windows do not collide.
        let c = normalize_range(Some(at(9, 30)), None, Some(30)).unwrap();
        assert!(!(a.start_at < c.end_at && a.end_at > c.start_at));
    }
}
