//! Daily and cumulative message counts per channel and per (user, channel).
//!
//! A pass for one scope works like this:
//! 1. pick the anchor date with [`anchor_date`]
//! 2. seed the running total from the row stored just before the anchor
//! 3. bucket messages from the anchor through today into local days
//! 4. validate the series and write it back in batches
//!
//! Everything from the anchor forward is owned by the pass and rewritten, so
//! re-running is idempotent and an interrupted pass simply resumes.

use crate::config::Config;
use crate::db::{CountClear, CountRow, CountScope, Database};
use chrono::NaiveDate;
use chrono_tz::Tz;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod anchor;
pub mod calendar;
mod pass;

pub use anchor::anchor_date;
pub use pass::{targets_from_config, ChannelTarget, PassSummary};

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    #[error("invariant violated for {scope} on {date}: {detail}")]
    InvariantViolation {
        scope: CountScope,
        date: NaiveDate,
        detail: String,
    },
}

#[derive(Debug, Clone)]
pub struct AggregationSettings {
    pub timezone: Tz,
    /// Rows per write transaction.
    pub batch_size: usize,
}

impl AggregationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timezone: config.timezone,
            batch_size: config.write_batch_size,
        }
    }
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::UTC,
            batch_size: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationOutcome {
    /// No messages in scope, or the anchor lies after today; nothing written.
    Skipped,
    Computed {
        anchor: NaiveDate,
        days: usize,
        rows_written: usize,
        /// Cumulative count at the end of the range.
        total: i64,
    },
}

impl AggregationOutcome {
    pub fn rows_written(&self) -> usize {
        match self {
            AggregationOutcome::Skipped => 0,
            AggregationOutcome::Computed { rows_written, .. } => *rows_written,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel_id: u64,
    pub outcome: AggregationOutcome,
    pub users: usize,
    pub user_rows: usize,
}

pub struct AggregationEngine {
    db: Database,
    settings: AggregationSettings,
    today: Option<NaiveDate>,
}

impl AggregationEngine {
    pub fn new(db: Database, settings: AggregationSettings) -> Self {
        Self {
            db,
            settings,
            today: None,
        }
    }

    /// Pins the last aggregated day instead of reading the clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today
            .unwrap_or_else(|| calendar::today(&self.settings.timezone))
    }

    pub fn compute_channel_counts(
        &self,
        channel_id: u64,
        reset: bool,
    ) -> Result<AggregationOutcome, AggregationError> {
        self.compute(CountScope::Channel(channel_id), reset)
    }

    pub fn compute_user_counts(
        &self,
        channel_id: u64,
        author_id: u64,
        reset: bool,
    ) -> Result<AggregationOutcome, AggregationError> {
        self.compute(
            CountScope::User {
                channel_id,
                author_id,
            },
            reset,
        )
    }

    /// Channel series first, then one series per author seen in the channel.
    pub fn compute_channel(
        &self,
        channel_id: u64,
        reset: bool,
    ) -> Result<ChannelReport, AggregationError> {
        let outcome = self.compute_channel_counts(channel_id, reset)?;
        if outcome == AggregationOutcome::Skipped {
            return Ok(ChannelReport {
                channel_id,
                outcome,
                users: 0,
                user_rows: 0,
            });
        }

        if reset {
            self.db.delete_user_counts_for_channel(channel_id)?;
        }

        let authors = self.db.channel_authors(channel_id)?;
        let mut user_rows = 0usize;
        for author_id in &authors {
            user_rows += self
                .compute_user_counts(channel_id, *author_id, reset)?
                .rows_written();
        }
        debug!(
            "Aggregated {} users ({} rows) in channel {}",
            authors.len(),
            user_rows,
            channel_id
        );

        Ok(ChannelReport {
            channel_id,
            outcome,
            users: authors.len(),
            user_rows,
        })
    }

    fn compute(
        &self,
        scope: CountScope,
        reset: bool,
    ) -> Result<AggregationOutcome, AggregationError> {
        let tz = &self.settings.timezone;
        let channel_id = scope.channel_id();
        let author_id = match scope {
            CountScope::Channel(_) => None,
            CountScope::User { author_id, .. } => Some(author_id),
        };

        let earliest = match self.db.earliest_message_timestamp(channel_id, author_id)? {
            Some(ts) => Some(calendar::local_date(tz, ts).ok_or_else(|| {
                anyhow::anyhow!("message timestamp {} out of range in {}", ts, scope)
            })?),
            None => None,
        };
        let existing = if reset {
            None
        } else {
            self.db.latest_count(scope)?
        };

        let Some(anchor) = anchor_date(existing.map(|r| r.date), earliest, reset) else {
            debug!("Skipping {}: no messages", scope);
            return Ok(AggregationOutcome::Skipped);
        };
        let today = self.today();
        if anchor > today {
            warn!(
                "Skipping {}: anchor {} is after today {} in {}",
                scope, anchor, today, tz
            );
            return Ok(AggregationOutcome::Skipped);
        }

        let seed = if reset {
            0
        } else {
            self.db
                .count_before(scope, anchor)?
                .map_or(0, |r| r.cumulative_count)
        };
        if let Some(stored) = existing.filter(|r| r.date == anchor) {
            check_link(scope, seed, &stored)?;
        }

        let (since, _) = calendar::day_bounds(tz, anchor);
        let timestamps = self
            .db
            .message_timestamps_since(channel_id, author_id, since)?;
        let daily = bucket_by_day(tz, anchor, today, &timestamps);
        let days = daily.len();

        // Users get rows only on days they posted; channels get every day.
        let zero_fill = matches!(scope, CountScope::Channel(_));
        let rows = accumulate(seed, &daily, zero_fill);
        validate_series(scope, seed, &rows)?;

        let clear = if reset {
            CountClear::All
        } else {
            CountClear::From(anchor)
        };
        let mut rows_written = 0usize;
        if rows.is_empty() {
            self.db.write_counts(scope, &[], clear)?;
        }
        for (i, batch) in rows.chunks(self.settings.batch_size.max(1)).enumerate() {
            let clear = if i == 0 { clear } else { CountClear::Keep };
            rows_written += self.db.write_counts(scope, batch, clear)?;
        }

        let total = seed + daily.iter().map(|(_, count)| count).sum::<i64>();
        info!(
            "Aggregated {} from {} ({} days, {} rows, total {})",
            scope, anchor, days, rows_written, total
        );

        Ok(AggregationOutcome::Computed {
            anchor,
            days,
            rows_written,
            total,
        })
    }
}

/// Message counts for every day of `[from, to]`. `timestamps` must be sorted.
fn bucket_by_day(tz: &Tz, from: NaiveDate, to: NaiveDate, timestamps: &[i64]) -> Vec<(NaiveDate, i64)> {
    let mut idx = 0usize;
    calendar::dates(from, to)
        .map(|date| {
            let (start, end) = calendar::day_bounds(tz, date);
            while idx < timestamps.len() && timestamps[idx] < start {
                idx += 1;
            }
            let first = idx;
            while idx < timestamps.len() && timestamps[idx] < end {
                idx += 1;
            }
            (date, (idx - first) as i64)
        })
        .collect()
}

fn accumulate(seed: i64, daily: &[(NaiveDate, i64)], zero_fill: bool) -> Vec<CountRow> {
    let mut running = seed;
    daily
        .iter()
        .filter_map(|&(date, count)| {
            running += count;
            (zero_fill || count > 0).then_some(CountRow {
                date,
                count,
                cumulative_count: running,
            })
        })
        .collect()
}

fn check_link(scope: CountScope, previous: i64, row: &CountRow) -> Result<(), AggregationError> {
    if row.count < 0 {
        return Err(AggregationError::InvariantViolation {
            scope,
            date: row.date,
            detail: format!("negative count {}", row.count),
        });
    }
    if row.cumulative_count != previous + row.count {
        return Err(AggregationError::InvariantViolation {
            scope,
            date: row.date,
            detail: format!(
                "cumulative {} != previous {} + count {}",
                row.cumulative_count, previous, row.count
            ),
        });
    }
    Ok(())
}

fn validate_series(scope: CountScope, seed: i64, rows: &[CountRow]) -> Result<(), AggregationError> {
    let mut previous = seed;
    let mut previous_date: Option<NaiveDate> = None;
    for row in rows {
        if previous_date.is_some_and(|d| d >= row.date) {
            return Err(AggregationError::InvariantViolation {
                scope,
                date: row.date,
                detail: "dates out of order".to_string(),
            });
        }
        check_link(scope, previous, row)?;
        previous = row.cumulative_count;
        previous_date = Some(row.date);
    }
    Ok(())
}
