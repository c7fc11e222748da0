// backend/src/status.rs
//
// Pure status derivation. Every writer (ingestion, web punches, admin
// edits, recomputation, regularisation) funnels through compute_status so
// the rules never drift between paths.

use chrono::{DateTime, FixedOffset, NaiveTime, Timelike, Utc};
use uuid::Uuid;

use crate::models::{AttendanceStatus, CriteriaMode};

/// Shift parameters as resolved for one staff member on one date.
/// Carried by value so a snapshot can be persisted alongside the record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedShift {
    /// None for the legacy-string and hard-coded default fallbacks.
    pub shift_id: Option<Uuid>,
    pub name: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub grace_minutes: i32,
    pub no_break: bool,
    pub legacy_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusOutcome {
    pub status: AttendanceStatus,
    /// Present only when both punches exist.
    pub work_hours: Option<f64>,
    pub late: bool,
}

const HALF_DAY_THRESHOLD: f64 = 4.0;
const FULL_DAY_THRESHOLD: f64 = 7.75;
const FULL_DAY_THRESHOLD_NO_BREAK: f64 = 7.0;

/// Minute-of-day of a UTC instant in the staff's operating timezone.
fn local_minutes(ts: DateTime<Utc>, tz: FixedOffset) -> i64 {
    let t = ts.with_timezone(&tz).time();
    (t.hour() * 60 + t.minute()) as i64
}

/// A check-in is late once it exceeds shift start + grace, compared at
/// minute resolution in the staff's operating timezone.
pub fn is_late(shift_start: NaiveTime, grace_minutes: i32, check_in: DateTime<Utc>, tz: FixedOffset) -> bool {
    let shift_mins = (shift_start.hour() * 60 + shift_start.minute()) as i64;
    local_minutes(check_in, tz) > shift_mins + grace_minutes as i64
}

/// Derives a day status from the resolved shift, the criteria mode, and
/// the punches seen so far. `historical` marks a bucket day strictly before
/// the current local day: a missing check-out then stops being provisional.
pub fn compute_status(
    shift: &ResolvedShift,
    mode: CriteriaMode,
    check_in: DateTime<Utc>,
    check_out: Option<DateTime<Utc>>,
    historical: bool,
    tz: FixedOffset,
) -> StatusOutcome {
    let late = is_late(shift.start_time, shift.grace_minutes, check_in, tz);

    let full_day = if shift.no_break {
        FULL_DAY_THRESHOLD_NO_BREAK
    } else {
        FULL_DAY_THRESHOLD
    };

    // Single punch (or a device double-read of the same punch).
    let check_out = match check_out {
        Some(out) if out != check_in => out,
        _ => {
            let status = if historical {
                match mode {
                    CriteriaMode::Hours8 => AttendanceStatus::Absent,
                    CriteriaMode::GraceTime => AttendanceStatus::HalfDay,
                }
            } else {
                match mode {
                    // Might still check out today.
                    CriteriaMode::Hours8 => AttendanceStatus::Present,
                    CriteriaMode::GraceTime => {
                        if late {
                            AttendanceStatus::HalfDay
                        } else {
                            AttendanceStatus::Present
                        }
                    }
                }
            };
            return StatusOutcome { status, work_hours: None, late };
        }
    };

    let work_hours = (check_out - check_in).num_seconds() as f64 / 3600.0;

    let status = match mode {
        CriteriaMode::Hours8 => {
            if work_hours >= 8.0 {
                AttendanceStatus::Present
            } else if work_hours >= HALF_DAY_THRESHOLD {
                AttendanceStatus::HalfDay
            } else {
                AttendanceStatus::Absent
            }
        }
        CriteriaMode::GraceTime => {
            // Lateness caps the day regardless of hours worked.
            if late {
                AttendanceStatus::HalfDay
            } else if work_hours < HALF_DAY_THRESHOLD {
                AttendanceStatus::Absent
            } else if work_hours < full_day {
                AttendanceStatus::HalfDay
            } else {
                AttendanceStatus::Present
            }
        }
    };

    StatusOutcome { status, work_hours: Some(work_hours), late }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const IST: i32 = 330 * 60;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(IST).unwrap()
    }

    fn shift(start: (u32, u32), end: (u32, u32), grace: i32, no_break: bool) -> ResolvedShift {
        ResolvedShift {
            shift_id: None,
            name: "Day".into(),
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            grace_minutes: grace,
            no_break,
            legacy_fallback: false,
        }
    }

    /// Local wall-clock instant on 2025-03-10 in the test timezone.
    fn at(h: u32, m: u32) -> DateTime<Utc> {
        tz()
            .with_ymd_and_hms(2025, 3, 10, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn grace_boundary_nine_fourteen_vs_nine_sixteen() {
        let s = shift((9, 0), (18, 0), 15, false);
        assert!(!is_late(s.start_time, s.grace_minutes, at(9, 14), tz()));
        assert!(!is_late(s.start_time, s.grace_minutes, at(9, 15), tz()));
        assert!(is_late(s.start_time, s.grace_minutes, at(9, 16), tz()));
    }

    #[test]
    fn lateness_caps_grace_time_day_despite_full_hours() {
        let s = shift((9, 0), (18, 0), 15, false);
        let out = compute_status(&s, CriteriaMode::GraceTime, at(9, 30), Some(at(17, 30)), true, tz());
        assert_eq!(out.status, AttendanceStatus::HalfDay);
        assert!(out.late);
        assert_eq!(out.work_hours, Some(8.0));
    }

    #[test]
    fn grace_time_full_day_thresholds() {
        let s = shift((9, 0), (18, 0), 15, false);
        // 7h30m on time -> below 7.75h -> half day
        let out = compute_status(&s, CriteriaMode::GraceTime, at(9, 0), Some(at(16, 30)), true, tz());
        assert_eq!(out.status, AttendanceStatus::HalfDay);
        // 8h on time -> present
        let out = compute_status(&s, CriteriaMode::GraceTime, at(9, 0), Some(at(17, 0)), true, tz());
        assert_eq!(out.status, AttendanceStatus::Present);
        // 3h -> absent
        let out = compute_status(&s, CriteriaMode::GraceTime, at(9, 0), Some(at(12, 0)), true, tz());
        assert_eq!(out.status, AttendanceStatus::Absent);
    }

    #[test]
    fn no_break_shift_lowers_full_day_threshold() {
        let s = shift((9, 0), (17, 0), 15, true);
        // 7h12m >= 7.0h -> present on a no-break shift
        let out = compute_status(&s, CriteriaMode::GraceTime, at(9, 0), Some(at(16, 12)), true, tz());
        assert_eq!(out.status, AttendanceStatus::Present);
    }

    #[test]
    fn hours8_ignores_lateness_entirely() {
        // Shift 10:00-19:00 grace 15, in 10:20 out 18:10 on a past day:
        // 7h50m -> HALF_DAY despite the late check-in.
        let s = shift((10, 0), (19, 0), 15, false);
        let out = compute_status(&s, CriteriaMode::Hours8, at(10, 20), Some(at(18, 10)), true, tz());
        assert_eq!(out.status, AttendanceStatus::HalfDay);
        assert!(out.late);

        // The same late check-in with 8h+ worked is a full day under HOURS_8.
        let out = compute_status(&s, CriteriaMode::Hours8, at(10, 20), Some(at(18, 30)), true, tz());
        assert_eq!(out.status, AttendanceStatus::Present);
        let out = compute_status(&s, CriteriaMode::Hours8, at(10, 20), Some(at(13, 0)), true, tz());
        assert_eq!(out.status, AttendanceStatus::Absent);
    }

    #[test]
    fn hours8_two_punch_bands() {
        let s = shift((9, 0), (18, 0), 15, false);
        let present = compute_status(&s, CriteriaMode::Hours8, at(9, 0), Some(at(17, 0)), true, tz());
        assert_eq!(present.status, AttendanceStatus::Present);
        let half = compute_status(&s, CriteriaMode::Hours8, at(9, 0), Some(at(13, 30)), true, tz());
        assert_eq!(half.status, AttendanceStatus::HalfDay);
        let absent = compute_status(&s, CriteriaMode::Hours8, at(9, 0), Some(at(12, 30)), true, tz());
        assert_eq!(absent.status, AttendanceStatus::Absent);
    }

    #[test]
    fn single_punch_current_day_is_provisional() {
        let s = shift((9, 0), (18, 0), 15, false);
        let out = compute_status(&s, CriteriaMode::Hours8, at(11, 0), None, false, tz());
        assert_eq!(out.status, AttendanceStatus::Present);
        let out = compute_status(&s, CriteriaMode::GraceTime, at(9, 10), None, false, tz());
        assert_eq!(out.status, AttendanceStatus::Present);
        let out = compute_status(&s, CriteriaMode::GraceTime, at(9, 40), None, false, tz());
        assert_eq!(out.status, AttendanceStatus::HalfDay);
    }

    #[test]
    fn single_punch_historical_day() {
        let s = shift((9, 0), (18, 0), 15, false);
        let out = compute_status(&s, CriteriaMode::Hours8, at(9, 0), None, true, tz());
        assert_eq!(out.status, AttendanceStatus::Absent);
        let out = compute_status(&s, CriteriaMode::GraceTime, at(9, 0), None, true, tz());
        assert_eq!(out.status, AttendanceStatus::HalfDay);
        // A checkout equal to the check-in counts as a single punch.
        let out = compute_status(&s, CriteriaMode::GraceTime, at(9, 0), Some(at(9, 0)), true, tz());
        assert_eq!(out.status, AttendanceStatus::HalfDay);
        assert_eq!(out.work_hours, None);
    }
}
