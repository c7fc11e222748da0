// backend/src/shifts.rs
//
// Shift catalog lookups: which shift governs a staff member on a date, and
// the overlap rule for dated assignments.

use chrono::{NaiveDate, NaiveTime};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::models::{ShiftAssignment, StaffProfile};
use crate::status::ResolvedShift;

pub const DEFAULT_START: (u32, u32) = (9, 0);
pub const DEFAULT_END: (u32, u32) = (18, 0);
pub const DEFAULT_GRACE_MINUTES: i32 = 15;

#[derive(Clone)]
pub struct ShiftResolver {
    pool: Pool<Postgres>,
}

impl ShiftResolver {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Resolves the shift governing `staff` on `date`. Never fails:
    /// assignment → legacy free-text timing → hard-coded default. Attendance
    /// must always be computable, so missing data degrades instead of
    /// erroring.
    pub async fn resolve(&self, staff: &StaffProfile, date: NaiveDate) -> ResolvedShift {
        match self.active_assignment(staff.staff_id, date).await {
            Ok(Some(row)) => return row,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("shift lookup failed for {}: {e}; falling back", staff.staff_id);
            }
        }

        if let Some(timing) = staff.legacy_shift_timing.as_deref() {
            if let Some((start, end)) = parse_legacy_timing(timing) {
                return ResolvedShift {
                    shift_id: None,
                    name: "Legacy Shift".into(),
                    start_time: start,
                    end_time: end,
                    grace_minutes: staff.legacy_grace_minutes.unwrap_or(DEFAULT_GRACE_MINUTES),
                    no_break: false,
                    legacy_fallback: true,
                };
            }
        }

        default_shift()
    }

    async fn active_assignment(
        &self,
        staff_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<ResolvedShift>, sqlx::Error> {
        let row = sqlx::query_as::<_, (Uuid, String, NaiveTime, NaiveTime, i32, bool, Option<i32>)>(
            r#"
            SELECT s.shift_id, s.name, s.start_time, s.end_time, s.grace_minutes, s.no_break,
                   a.grace_override
              FROM shift_assignments a
              JOIN shifts s ON s.shift_id = a.shift_id
             WHERE a.staff_id = $1
               AND a.is_active
               AND a.from_date <= $2
               AND (a.to_date IS NULL OR a.to_date >= $2)
             ORDER BY a.from_date DESC
             LIMIT 1
            "#,
        )
        .bind(staff_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(shift_id, name, start_time, end_time, grace, no_break, overridden)| {
            ResolvedShift {
                shift_id: Some(shift_id),
                name,
                start_time,
                end_time,
                grace_minutes: overridden.unwrap_or(grace),
                no_break,
                legacy_fallback: false,
            }
        }))
    }

    /// Returns the first active assignment whose date range intersects
    /// [from, to]. `to = None` is treated as unbounded on both sides.
    pub async fn find_overlap(
        &self,
        staff_id: Uuid,
        from: NaiveDate,
        to: Option<NaiveDate>,
    ) -> Result<Option<ShiftAssignment>, sqlx::Error> {
        let existing = sqlx::query_as::<_, ShiftAssignment>(
            r#"SELECT * FROM shift_assignments WHERE staff_id = $1 AND is_active ORDER BY from_date"#,
        )
        .bind(staff_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(existing
            .into_iter()
            .find(|a| ranges_overlap(a.from_date, a.to_date, from, to)))
    }
}

pub fn default_shift() -> ResolvedShift {
    ResolvedShift {
        shift_id: None,
        name: "Default Shift".into(),
        start_time: NaiveTime::from_hms_opt(DEFAULT_START.0, DEFAULT_START.1, 0).unwrap(),
        end_time: NaiveTime::from_hms_opt(DEFAULT_END.0, DEFAULT_END.1, 0).unwrap(),
        grace_minutes: DEFAULT_GRACE_MINUTES,
        no_break: false,
        legacy_fallback: true,
    }
}

/// Overlap test for inclusive date ranges where a missing end means +∞.
pub fn ranges_overlap(
    a_from: NaiveDate,
    a_to: Option<NaiveDate>,
    b_from: NaiveDate,
    b_to: Option<NaiveDate>,
) -> bool {
    let a_ends_before_b = matches!(a_to, Some(end) if end < b_from);
    let b_ends_before_a = matches!(b_to, Some(end) if end < a_from);
    !(a_ends_before_b || b_ends_before_a)
}

/// Parses the legacy free-text shift timing kept on old staff profiles,
/// e.g. "09:00 AM - 06:00 PM" or "09:00-18:00".
pub fn parse_legacy_timing(timing: &str) -> Option<(NaiveTime, NaiveTime)> {
    let parts: Vec<&str> = timing.split('-').map(str::trim).collect();
    if parts.len() != 2 {
        return None;
    }
    Some((parse_clock(parts[0])?, parse_clock(parts[1])?))
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    let (time_part, modifier) = match raw.split_once(' ') {
        Some((t, m)) => (t, Some(m.trim().to_ascii_uppercase())),
        None => (raw, None),
    };
    let (h, m) = time_part.split_once(':')?;
    let mut hours: u32 = h.trim().parse().ok()?;
    let minutes: u32 = m.trim().parse().ok()?;

    match modifier.as_deref() {
        Some("AM") => {
            if hours == 12 {
                hours = 0;
            }
        }
        Some("PM") => {
            if hours != 12 {
                hours += 12;
            }
        }
        Some(_) => return None,
        None => {}
    }

    NaiveTime::from_hms_opt(hours, minutes, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parses_twelve_hour_legacy_strings() {
        assert_eq!(
            parse_legacy_timing("09:00 AM - 06:00 PM"),
            Some((t(9, 0), t(18, 0)))
        );
        assert_eq!(
            parse_legacy_timing("12:00 AM - 12:00 PM"),
            Some((t(0, 0), t(12, 0)))
        );
        assert_eq!(
            parse_legacy_timing("10:30 PM - 07:00 AM"),
            Some((t(22, 30), t(7, 0)))
        );
    }

    #[test]
    fn parses_twenty_four_hour_legacy_strings() {
        assert_eq!(parse_legacy_timing("09:00-18:00"), Some((t(9, 0), t(18, 0))));
        assert_eq!(parse_legacy_timing(" 22:00 - 07:00 "), Some((t(22, 0), t(7, 0))));
    }

    #[test]
    fn rejects_garbage_timing_strings() {
        assert_eq!(parse_legacy_timing("whenever"), None);
        assert_eq!(parse_legacy_timing("09:00"), None);
        assert_eq!(parse_legacy_timing("09:xx - 18:00"), None);
    }

    #[test]
    fn overlap_rule_matches_assignment_invariant() {
        // Jan assignment vs open-ended range starting mid-Jan: overlap.
        assert!(ranges_overlap(
            d(2025, 1, 1),
            Some(d(2025, 1, 31)),
            d(2025, 1, 15),
            None
        ));
        // Open-ended range starting in Feb does not touch January.
        assert!(!ranges_overlap(
            d(2025, 1, 1),
            Some(d(2025, 1, 31)),
            d(2025, 2, 1),
            None
        ));
        // Two open-ended ranges always collide.
        assert!(ranges_overlap(d(2025, 1, 1), None, d(2030, 6, 1), None));
        // Touching endpoints count as overlap (inclusive ranges).
        assert!(ranges_overlap(
            d(2025, 1, 1),
            Some(d(2025, 1, 31)),
            d(2025, 1, 31),
            Some(d(2025, 2, 28))
        ));
    }

    #[test]
    fn default_shift_is_nine_to_six_with_fifteen_grace() {
        let s = default_shift();
        assert_eq!(s.start_time, t(9, 0));
        assert_eq!(s.end_time, t(18, 0));
        assert_eq!(s.grace_minutes, 15);
        assert!(s.legacy_fallback);
    }
}
