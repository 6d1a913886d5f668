//! Billing-cycle arithmetic anchored at the provider's canonical original
//! purchase timestamp. Monthly cycles roll forward by calendar months with
//! day-of-month clamping for short months; weekly cycles are exact 7-day
//! strides from the anchor.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

use super::PlanType;

/// `[start, next_reset)` bounds of the cycle containing `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBounds {
    pub start: DateTime<Utc>,
    pub next_reset: DateTime<Utc>,
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    match next {
        Some(d) => d.pred_opt().map(|p| p.day()).unwrap_or(28),
        None => 28,
    }
}

/// Anchor shifted forward by `months` calendar months, clamping the
/// day-of-month (Jan 31 + 1 month = Feb 29 in a leap year, Feb 28 otherwise).
pub fn add_months_clamped(anchor: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let date = anchor.date_naive();
    let total = date.month0() + months;
    let year = date.year() + (total / 12) as i32;
    let month = total % 12 + 1;
    let day = date.day().min(days_in_month(year, month));
    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or(date)
        .and_time(anchor.time());
    Utc.from_utc_datetime(&naive)
}

/// Cycle bounds for `now`, derived from the canonical anchor rather than a
/// wall-clock "30 days from now" guess.
pub fn cycle_bounds(plan: PlanType, anchor: DateTime<Utc>, now: DateTime<Utc>) -> CycleBounds {
    match plan {
        PlanType::Weekly => {
            let elapsed = now.signed_duration_since(anchor);
            let strides = if elapsed < Duration::zero() {
                0
            } else {
                elapsed.num_days() / 7
            };
            let start = anchor + Duration::days(strides * 7);
            CycleBounds {
                start,
                next_reset: start + Duration::days(7),
            }
        }
        PlanType::Monthly | PlanType::Free => {
            // Free accounts have no renewal event; they still reset on the
            // monthly stride from first use.
            let mut months = 0u32;
            while add_months_clamped(anchor, months + 1) <= now {
                months += 1;
            }
            CycleBounds {
                start: add_months_clamped(anchor, months),
                next_reset: add_months_clamped(anchor, months + 1),
            }
        }
    }
}
