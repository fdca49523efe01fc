use chrono::NaiveDate;

/// First date an aggregation pass has to recompute.
///
/// Without messages there is nothing to aggregate and the result is `None`.
/// A resume restarts at the latest stored date, since that day may have been
/// partial when it was written; a reset (or a scope with no stored rows)
/// starts at the day of the earliest message.
pub fn anchor_date(
    existing_max_date: Option<NaiveDate>,
    earliest_message_date: Option<NaiveDate>,
    reset: bool,
) -> Option<NaiveDate> {
    let earliest = earliest_message_date?;
    if reset {
        return Some(earliest);
    }
    Some(existing_max_date.unwrap_or(earliest))
}
