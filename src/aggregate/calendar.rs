//! Local calendar days in the report timezone, expressed as UTC epoch bounds.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Local calendar day of an epoch-seconds timestamp.
pub fn local_date(tz: &Tz, timestamp: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).map(|utc| utc.with_timezone(tz).date_naive())
}

pub fn today(tz: &Tz) -> NaiveDate {
    Utc::now().with_timezone(tz).date_naive()
}

/// Epoch seconds of the first instant of `date` in `tz`, using the offset in
/// force on that date.
pub fn day_start(tz: &Tz, date: NaiveDate) -> i64 {
    let midnight = date.and_time(NaiveTime::MIN);
    let mut candidate = midnight;
    // Midnight may not exist locally (DST gap); walk forward to the first valid time.
    while candidate.date() == date {
        if let Some(start) = tz.from_local_datetime(&candidate).earliest() {
            return start.timestamp();
        }
        candidate += Duration::minutes(15);
    }
    midnight.and_utc().timestamp()
}

/// Half-open `[start, end)` UTC bounds of a local day.
pub fn day_bounds(tz: &Tz, date: NaiveDate) -> (i64, i64) {
    let start = day_start(tz, date);
    let end = date
        .succ_opt()
        .map(|next| day_start(tz, next))
        .unwrap_or(i64::MAX);
    (start, end)
}

/// Every date of the closed range `[from, to]`; empty when `from > to`.
pub fn dates(from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    from.iter_days().take_while(move |d| *d <= to)
}
