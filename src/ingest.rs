// backend/src/ingest.rs
//
// Turns raw punch events into upserts against daily attendance records.
// Replaying a batch any number of times must converge to the same record,
// and one bad event never aborts the batch.

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use sqlx::{Pool, Postgres};

use crate::models::{AttendanceRecord, AttendanceStatus, BatchResult, IngestMethod, StaffProfile};
use crate::shifts::ShiftResolver;
use crate::status::{self, ResolvedShift};

/// One raw punch as delivered by the device or the bridge agent.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PunchEvent {
    pub staff_number: String,
    pub timestamp: DateTime<Utc>,
}

/// Punches before this local hour may belong to the previous day's
/// overnight shift.
const OVERNIGHT_LOOKBACK_HOUR: u32 = 7;

// ───────────────────────────────────────
// Day bucketing
// ───────────────────────────────────────

/// The calendar-day keys a punch may be stored under. `preferred` is the
/// staff member's local calendar day; `legacy` is the UTC day that older
/// records were bucketed under before the timezone fix. Lookups check
/// both; new records always use `preferred`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBucket {
    pub preferred: NaiveDate,
    pub legacy: NaiveDate,
}

pub fn resolve_day_bucket(ts: DateTime<Utc>, tz: FixedOffset) -> DayBucket {
    DayBucket {
        preferred: ts.with_timezone(&tz).date_naive(),
        legacy: ts.date_naive(),
    }
}

pub fn staff_tz(staff: &StaffProfile, default_offset_min: i32) -> FixedOffset {
    let minutes = staff.tz_offset_min.unwrap_or(default_offset_min);
    FixedOffset::east_opt(minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
}

// ───────────────────────────────────────
// Merge planning (pure)
// ───────────────────────────────────────

/// The slice of an existing record the merge rules look at.
#[derive(Debug, Clone, Copy)]
pub struct PunchState {
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    pub status: AttendanceStatus,
    pub method: IngestMethod,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeOutcome {
    /// Manually corrected or regularised records are authoritative and
    /// immune to automatic re-ingestion.
    Locked,
    NoChange,
    /// Final punch values to persist; status must be recomputed.
    Apply {
        check_in: DateTime<Utc>,
        check_out: Option<DateTime<Utc>>,
    },
}

/// Decides how a punch merges into an existing record. Check-in only ever
/// moves earlier, check-out only ever moves later. A historical record
/// still showing a provisional single-punch PRESENT is re-evaluated even
/// when the punch itself changes nothing.
pub fn plan_merge(existing: &PunchState, ts: DateTime<Utc>, historical: bool) -> MergeOutcome {
    if matches!(existing.method, IngestMethod::ManualAdmin | IngestMethod::Regularisation) {
        return MergeOutcome::Locked;
    }

    let mut changed = false;

    let check_in = match existing.check_in {
        Some(ci) if ts >= ci => ci,
        _ => {
            changed = true;
            ts
        }
    };

    let mut check_out = existing.check_out;
    if ts > check_in && check_out.map_or(true, |co| ts > co) {
        check_out = Some(ts);
        changed = true;
    }

    let provisional = historical
        && existing.status == AttendanceStatus::Present
        && existing.check_out.is_none();

    if changed || provisional {
        MergeOutcome::Apply { check_in, check_out }
    } else {
        MergeOutcome::NoChange
    }
}

// ───────────────────────────────────────
// Batch processing
// ───────────────────────────────────────

/// Ingests a batch of punches. Per-event failures (unknown staff numbers,
/// storage errors) are collected and reported; the batch always runs to
/// completion.
pub async fn process_batch(
    pool: &Pool<Postgres>,
    resolver: &ShiftResolver,
    default_tz_offset_min: i32,
    events: &[PunchEvent],
    method: IngestMethod,
) -> BatchResult {
    let mut result = BatchResult {
        success_count: 0,
        failed_count: 0,
        errors: Vec::new(),
    };

    for ev in events {
        match apply_event(pool, resolver, default_tz_offset_min, ev, method).await {
            Ok(()) => result.success_count += 1,
            Err(msg) => {
                result.failed_count += 1;
                result.errors.push(msg);
            }
        }
    }

    result
}

async fn apply_event(
    pool: &Pool<Postgres>,
    resolver: &ShiftResolver,
    default_tz_offset_min: i32,
    ev: &PunchEvent,
    method: IngestMethod,
) -> Result<(), String> {
    let staff = sqlx::query_as::<_, StaffProfile>(
        r#"SELECT * FROM staff_profiles WHERE staff_number = $1"#,
    )
    .bind(&ev.staff_number)
    .fetch_optional(pool)
    .await
    .map_err(|e| format!("{}: lookup failed: {e}", ev.staff_number))?;

    let Some(staff) = staff else {
        return Err(format!("staff number {} not found", ev.staff_number));
    };

    let tz = staff_tz(&staff, default_tz_offset_min);
    let bucket = resolve_day_bucket(ev.timestamp, tz);
    let today = Utc::now().with_timezone(&tz).date_naive();

    let mut existing = find_record(pool, &staff, &bucket).await.map_err(db_err(&ev.staff_number))?;

    // Overnight shifts: an early-morning punch with no same-day record may
    // be the check-out of yesterday's still-open record. A record that
    // already ends at or after this punch also matches, so replays of the
    // same batch converge instead of opening a fresh day.
    if existing.is_none() && ev.timestamp.with_timezone(&tz).hour() < OVERNIGHT_LOOKBACK_HOUR {
        let yesterday = bucket.preferred.pred_opt().unwrap_or(bucket.preferred);
        existing = sqlx::query_as::<_, AttendanceRecord>(
            r#"
            SELECT * FROM attendance_records
             WHERE staff_id = $1 AND date = $2
               AND (check_out IS NULL OR check_out >= $3)
            "#,
        )
        .bind(staff.staff_id)
        .bind(yesterday)
        .bind(ev.timestamp)
        .fetch_optional(pool)
        .await
        .map_err(db_err(&ev.staff_number))?;
    }

    match existing {
        None => {
            let historical = bucket.preferred < today;
            let shift = resolver.resolve(&staff, bucket.preferred).await;
            let outcome = status::compute_status(
                &shift,
                staff.criteria_mode,
                ev.timestamp,
                None,
                historical,
                tz,
            );

            let inserted = insert_record(pool, &staff, bucket.preferred, ev.timestamp, &shift, outcome.status, method)
                .await
                .map_err(db_err(&ev.staff_number))?;

            if !inserted {
                // Lost the unique-key race: another writer created the day
                // first. Re-read and merge instead of failing.
                let rec = find_record(pool, &staff, &bucket)
                    .await
                    .map_err(db_err(&ev.staff_number))?
                    .ok_or_else(|| format!("{}: record vanished during upsert", ev.staff_number))?;
                merge_into(pool, resolver, &staff, rec, ev.timestamp, today, tz, method)
                    .await
                    .map_err(db_err(&ev.staff_number))?;
            }
            Ok(())
        }
        Some(rec) => merge_into(pool, resolver, &staff, rec, ev.timestamp, today, tz, method)
            .await
            .map_err(db_err(&ev.staff_number)),
    }
}

fn db_err(staff_number: &str) -> impl Fn(sqlx::Error) -> String + '_ {
    move |e| format!("{staff_number}: {e}")
}

async fn find_record(
    pool: &Pool<Postgres>,
    staff: &StaffProfile,
    bucket: &DayBucket,
) -> Result<Option<AttendanceRecord>, sqlx::Error> {
    // Both the corrected local-day key and the legacy UTC key may hold the
    // record; prefer the corrected one when both exist.
    sqlx::query_as::<_, AttendanceRecord>(
        r#"
        SELECT * FROM attendance_records
         WHERE staff_id = $1 AND (date = $2 OR date = $3)
         ORDER BY (date = $2)::int DESC
         LIMIT 1
        "#,
    )
    .bind(staff.staff_id)
    .bind(bucket.preferred)
    .bind(bucket.legacy)
    .fetch_optional(pool)
    .await
}

async fn insert_record(
    pool: &Pool<Postgres>,
    staff: &StaffProfile,
    date: NaiveDate,
    check_in: DateTime<Utc>,
    shift: &ResolvedShift,
    status: AttendanceStatus,
    method: IngestMethod,
) -> Result<bool, sqlx::Error> {
    let res = sqlx::query(
        r#"
        INSERT INTO attendance_records
            (staff_id, date, check_in, status,
             shift_id, shift_start, shift_end, grace_minutes_applied,
             criteria_mode, method)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
        ON CONFLICT (staff_id, date) DO NOTHING
        "#,
    )
    .bind(staff.staff_id)
    .bind(date)
    .bind(check_in)
    .bind(status)
    .bind(shift.shift_id)
    .bind(shift.start_time)
    .bind(shift.end_time)
    .bind(shift.grace_minutes)
    .bind(staff.criteria_mode)
    .bind(method)
    .execute(pool)
    .await?;

    Ok(res.rows_affected() > 0)
}

#[allow(clippy::too_many_arguments)]
async fn merge_into(
    pool: &Pool<Postgres>,
    resolver: &ShiftResolver,
    staff: &StaffProfile,
    rec: AttendanceRecord,
    ts: DateTime<Utc>,
    today: NaiveDate,
    tz: FixedOffset,
    method: IngestMethod,
) -> Result<(), sqlx::Error> {
    let historical = rec.date < today;
    let state = PunchState {
        check_in: rec.check_in,
        check_out: rec.check_out,
        status: rec.status,
        method: rec.method,
    };

    let (check_in, check_out) = match plan_merge(&state, ts, historical) {
        MergeOutcome::Locked | MergeOutcome::NoChange => return Ok(()),
        MergeOutcome::Apply { check_in, check_out } => (check_in, check_out),
    };

    let shift = resolver.resolve(staff, rec.date).await;
    let outcome =
        status::compute_status(&shift, staff.criteria_mode, check_in, check_out, historical, tz);

    sqlx::query(
        r#"
        UPDATE attendance_records SET
            check_in = $2,
            check_out = $3,
            status = $4,
            work_hours = $5,
            shift_id = $6,
            shift_start = $7,
            shift_end = $8,
            grace_minutes_applied = $9,
            criteria_mode = $10,
            method = $11,
            updated_at = now()
        WHERE record_id = $1
        "#,
    )
    .bind(rec.record_id)
    .bind(check_in)
    .bind(check_out)
    .bind(outcome.status)
    .bind(outcome.work_hours)
    .bind(shift.shift_id)
    .bind(shift.start_time)
    .bind(shift.end_time)
    .bind(shift.grace_minutes)
    .bind(staff.criteria_mode)
    .bind(method)
    .execute(pool)
    .await?;

    Ok(())
}

// ───────────────────────────────────────
// Retroactive recomputation
// ───────────────────────────────────────

/// Re-derives status and snapshot for every unlocked record of a staff
/// member in [from, to], picking up the shift rules now in force. Used
/// after assignment changes and by the admin recompute endpoint.
pub async fn recompute_range(
    pool: &Pool<Postgres>,
    resolver: &ShiftResolver,
    staff: &StaffProfile,
    from: NaiveDate,
    to: NaiveDate,
    default_tz_offset_min: i32,
) -> Result<u32, sqlx::Error> {
    let tz = staff_tz(staff, default_tz_offset_min);
    let records = sqlx::query_as::<_, AttendanceRecord>(
        r#"
        SELECT * FROM attendance_records
         WHERE staff_id = $1 AND date >= $2 AND date <= $3
         ORDER BY date
        "#,
    )
    .bind(staff.staff_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    let mut updated = 0u32;
    for rec in records {
        if matches!(rec.method, IngestMethod::ManualAdmin | IngestMethod::Regularisation) {
            continue;
        }
        let Some(check_in) = rec.check_in else { continue };

        let shift = resolver.resolve(staff, rec.date).await;
        let outcome =
            status::compute_status(&shift, staff.criteria_mode, check_in, rec.check_out, true, tz);

        sqlx::query(
            r#"
            UPDATE attendance_records SET
                status = $2,
                work_hours = $3,
                shift_id = $4,
                shift_start = $5,
                shift_end = $6,
                grace_minutes_applied = $7,
                criteria_mode = $8,
                updated_at = now()
            WHERE record_id = $1
            "#,
        )
        .bind(rec.record_id)
        .bind(outcome.status)
        .bind(outcome.work_hours.or(rec.work_hours))
        .bind(shift.shift_id)
        .bind(shift.start_time)
        .bind(shift.end_time)
        .bind(shift.grace_minutes)
        .bind(staff.criteria_mode)
        .execute(pool)
        .await?;
        updated += 1;
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CriteriaMode;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(330 * 60).unwrap()
    }

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        tz()
            .with_ymd_and_hms(2025, 3, d, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn day_shift() -> ResolvedShift {
        ResolvedShift {
            shift_id: None,
            name: "Day".into(),
            start_time: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            grace_minutes: 15,
            no_break: false,
            legacy_fallback: false,
        }
    }

    /// Replays a batch against an in-memory store the way apply_event
    /// drives the database: bucket, merge-plan, recompute.
    fn replay(store: &mut HashMap<NaiveDate, PunchState>, batch: &[DateTime<Utc>], today: NaiveDate) {
        for &ts in batch {
            let bucket = resolve_day_bucket(ts, tz());
            let historical = bucket.preferred < today;
            match store.get(&bucket.preferred).copied() {
                None => {
                    let out = status::compute_status(
                        &day_shift(),
                        CriteriaMode::GraceTime,
                        ts,
                        None,
                        historical,
                        tz(),
                    );
                    store.insert(
                        bucket.preferred,
                        PunchState {
                            check_in: Some(ts),
                            check_out: None,
                            status: out.status,
                            method: IngestMethod::Biometric,
                        },
                    );
                }
                Some(state) => match plan_merge(&state, ts, historical) {
                    MergeOutcome::Locked | MergeOutcome::NoChange => {}
                    MergeOutcome::Apply { check_in, check_out } => {
                        let out = status::compute_status(
                            &day_shift(),
                            CriteriaMode::GraceTime,
                            check_in,
                            check_out,
                            historical,
                            tz(),
                        );
                        store.insert(
                            bucket.preferred,
                            PunchState {
                                check_in: Some(check_in),
                                check_out,
                                status: out.status,
                                method: IngestMethod::Biometric,
                            },
                        );
                    }
                },
            }
        }
    }

    #[test]
    fn day_bucket_uses_local_calendar_day() {
        // 01:30 IST on the 10th is 20:00 UTC on the 9th.
        let ts = at(10, 1, 30);
        let bucket = resolve_day_bucket(ts, tz());
        assert_eq!(bucket.preferred, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        assert_eq!(bucket.legacy, NaiveDate::from_ymd_opt(2025, 3, 9).unwrap());
    }

    #[test]
    fn replaying_a_batch_is_idempotent() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 20).unwrap();
        // Shuffled, duplicated delivery of one day's punches.
        let batch = vec![at(10, 18, 5), at(10, 9, 3), at(10, 13, 0), at(10, 9, 3), at(10, 18, 5)];

        let mut once = HashMap::new();
        replay(&mut once, &batch, today);

        let mut thrice = HashMap::new();
        for _ in 0..3 {
            replay(&mut thrice, &batch, today);
        }

        let d = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let a = once.get(&d).unwrap();
        let b = thrice.get(&d).unwrap();
        assert_eq!(a.check_in, b.check_in);
        assert_eq!(a.check_out, b.check_out);
        assert_eq!(a.status, b.status);
        assert_eq!(a.check_in, Some(at(10, 9, 3)));
        assert_eq!(a.check_out, Some(at(10, 18, 5)));
    }

    #[test]
    fn merge_is_monotonic() {
        let state = PunchState {
            check_in: Some(at(10, 9, 30)),
            check_out: Some(at(10, 17, 0)),
            status: AttendanceStatus::Present,
            method: IngestMethod::Biometric,
        };

        // Earlier punch lowers check-in, keeps check-out.
        match plan_merge(&state, at(10, 9, 0), true) {
            MergeOutcome::Apply { check_in, check_out } => {
                assert_eq!(check_in, at(10, 9, 0));
                assert_eq!(check_out, Some(at(10, 17, 0)));
            }
            other => panic!("expected Apply, got {other:?}"),
        }

        // Later punch raises check-out, keeps check-in.
        match plan_merge(&state, at(10, 18, 30), true) {
            MergeOutcome::Apply { check_in, check_out } => {
                assert_eq!(check_in, at(10, 9, 30));
                assert_eq!(check_out, Some(at(10, 18, 30)));
            }
            other => panic!("expected Apply, got {other:?}"),
        }

        // A punch inside the current span moves nothing backward.
        assert_eq!(plan_merge(&state, at(10, 12, 0), false), MergeOutcome::NoChange);
    }

    #[test]
    fn manual_admin_records_are_locked() {
        let state = PunchState {
            check_in: Some(at(10, 10, 0)),
            check_out: Some(at(10, 16, 0)),
            status: AttendanceStatus::Present,
            method: IngestMethod::ManualAdmin,
        };
        assert_eq!(plan_merge(&state, at(10, 8, 0), true), MergeOutcome::Locked);
        assert_eq!(plan_merge(&state, at(10, 20, 0), true), MergeOutcome::Locked);

        let regularised = PunchState {
            method: IngestMethod::Regularisation,
            ..state
        };
        assert_eq!(plan_merge(&regularised, at(10, 20, 0), true), MergeOutcome::Locked);
    }

    #[test]
    fn provisional_present_forces_reevaluation_on_past_days() {
        let state = PunchState {
            check_in: Some(at(10, 9, 0)),
            check_out: None,
            status: AttendanceStatus::Present,
            method: IngestMethod::Biometric,
        };
        // Same punch again on a historical day: no field change, but the
        // provisional PRESENT must be re-derived.
        match plan_merge(&state, at(10, 9, 0), true) {
            MergeOutcome::Apply { check_in, check_out } => {
                assert_eq!(check_in, at(10, 9, 0));
                assert_eq!(check_out, None);
            }
            other => panic!("expected Apply, got {other:?}"),
        }
        // Same situation on the current day stays untouched.
        assert_eq!(plan_merge(&state, at(10, 9, 0), false), MergeOutcome::NoChange);
    }
}
