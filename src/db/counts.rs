//! Count tables. Only the aggregation engine writes here; everything else reads.

use super::models::{
    format_date, parse_date, CountClear, CountRow, CountScope, DailyChannelCount,
    DailyUserChannelCount,
};
use super::Database;
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row, ToSql};

fn count_row(row: &Row<'_>) -> rusqlite::Result<CountRow> {
    let date: String = row.get(0)?;
    Ok(CountRow {
        date: parse_date(&date)?,
        count: row.get(1)?,
        cumulative_count: row.get(2)?,
    })
}

/// `(table, key predicate, key params)` for a scope.
fn scope_sql(scope: &CountScope) -> (&'static str, &'static str, Vec<u64>) {
    match *scope {
        CountScope::Channel(channel_id) => (
            "daily_channel_count",
            "channel_id = ?1",
            vec![channel_id],
        ),
        CountScope::User {
            channel_id,
            author_id,
        } => (
            "daily_user_channel_count",
            "channel_id = ?1 AND author_id = ?2",
            vec![channel_id, author_id],
        ),
    }
}

impl Database {
    /// Most recent stored row for the scope.
    pub fn latest_count(&self, scope: CountScope) -> anyhow::Result<Option<CountRow>> {
        let (table, key, key_params) = scope_sql(&scope);
        let sql = format!(
            "SELECT date, count, cumulative_count FROM {table} WHERE {key}
             ORDER BY date DESC LIMIT 1"
        );
        let conn = self.lock()?;
        let row = conn
            .query_row(&sql, rusqlite::params_from_iter(key_params), count_row)
            .optional()?;
        Ok(row)
    }

    /// Latest stored row strictly before `date`.
    pub fn count_before(
        &self,
        scope: CountScope,
        date: NaiveDate,
    ) -> anyhow::Result<Option<CountRow>> {
        let (table, key, key_params) = scope_sql(&scope);
        let date_param = key_params.len() + 1;
        let sql = format!(
            "SELECT date, count, cumulative_count FROM {table} WHERE {key} AND date < ?{date_param}
             ORDER BY date DESC LIMIT 1"
        );
        let date = format_date(date);
        let mut bound: Vec<&dyn ToSql> = key_params.iter().map(|p| p as &dyn ToSql).collect();
        bound.push(&date);

        let conn = self.lock()?;
        let row = conn.query_row(&sql, &bound[..], count_row).optional()?;
        Ok(row)
    }

    pub fn count_series(&self, scope: CountScope) -> anyhow::Result<Vec<CountRow>> {
        let (table, key, key_params) = scope_sql(&scope);
        let sql = format!(
            "SELECT date, count, cumulative_count FROM {table} WHERE {key} ORDER BY date"
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(key_params), count_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Insert-or-replace `rows` for `scope` in one transaction. Rows selected by
    /// `clear` are deleted first, inside the same transaction.
    pub fn write_counts(
        &self,
        scope: CountScope,
        rows: &[CountRow],
        clear: CountClear,
    ) -> anyhow::Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let (table, key, key_params) = scope_sql(&scope);
        match clear {
            CountClear::Keep => {}
            CountClear::All => {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE {key}"),
                    rusqlite::params_from_iter(key_params),
                )?;
            }
            CountClear::From(date) => {
                let date_param = key_params.len() + 1;
                let date = format_date(date);
                let mut bound: Vec<&dyn ToSql> =
                    key_params.iter().map(|p| p as &dyn ToSql).collect();
                bound.push(&date);
                tx.execute(
                    &format!("DELETE FROM {table} WHERE {key} AND date >= ?{date_param}"),
                    &bound[..],
                )?;
            }
        }
        let mut written = 0usize;
        {
            match scope {
                CountScope::Channel(channel_id) => {
                    let mut stmt = tx.prepare_cached(
                        "INSERT OR REPLACE INTO daily_channel_count
                         (channel_id, date, count, cumulative_count) VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for row in rows {
                        written += stmt.execute(params![
                            channel_id,
                            format_date(row.date),
                            row.count,
                            row.cumulative_count
                        ])?;
                    }
                }
                CountScope::User {
                    channel_id,
                    author_id,
                } => {
                    let mut stmt = tx.prepare_cached(
                        "INSERT OR REPLACE INTO daily_user_channel_count
                         (author_id, channel_id, date, count, cumulative_count)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for row in rows {
                        written += stmt.execute(params![
                            author_id,
                            channel_id,
                            format_date(row.date),
                            row.count,
                            row.cumulative_count
                        ])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Drops every per-user row of a channel, for authors that may no longer exist.
    pub fn delete_user_counts_for_channel(&self, channel_id: u64) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM daily_user_channel_count WHERE channel_id = ?1",
            [channel_id],
        )?;
        Ok(deleted)
    }

    // --- Reads for reporting ---

    pub fn channel_counts(&self, channel_id: u64) -> anyhow::Result<Vec<DailyChannelCount>> {
        Ok(self
            .count_series(CountScope::Channel(channel_id))?
            .into_iter()
            .map(|row| DailyChannelCount {
                channel_id,
                date: row.date,
                count: row.count,
                cumulative_count: row.cumulative_count,
            })
            .collect())
    }

    pub fn user_counts(
        &self,
        channel_id: u64,
        author_id: u64,
    ) -> anyhow::Result<Vec<DailyUserChannelCount>> {
        Ok(self
            .count_series(CountScope::User {
                channel_id,
                author_id,
            })?
            .into_iter()
            .map(|row| DailyUserChannelCount {
                author_id,
                channel_id,
                date: row.date,
                count: row.count,
                cumulative_count: row.cumulative_count,
            })
            .collect())
    }

    /// Sum of channel counts per date across a guild. Dates with no rows are absent.
    pub fn guild_daily_totals(&self, guild_id: u64) -> anyhow::Result<Vec<(NaiveDate, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT d.date, SUM(d.count) FROM daily_channel_count d
             JOIN channel c ON c.id = d.channel_id
             WHERE c.guild_id = ?1
             GROUP BY d.date ORDER BY d.date",
        )?;
        let rows = stmt.query_map([guild_id], |row| {
            let date: String = row.get(0)?;
            Ok((parse_date(&date)?, row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Per-user rows of a channel on `date`, count descending, zero counts excluded.
    pub fn user_counts_on(
        &self,
        channel_id: u64,
        date: NaiveDate,
        limit: usize,
    ) -> anyhow::Result<Vec<DailyUserChannelCount>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT author_id, count, cumulative_count FROM daily_user_channel_count
             WHERE channel_id = ?1 AND date = ?2 AND count > 0
             ORDER BY count DESC, author_id
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![channel_id, format_date(date), limit as i64], |row| {
            Ok(DailyUserChannelCount {
                author_id: row.get(0)?,
                channel_id,
                date,
                count: row.get(1)?,
                cumulative_count: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Latest cumulative count per author in a channel, highest first.
    pub fn user_totals(&self, channel_id: u64, limit: usize) -> anyhow::Result<Vec<(u64, i64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT u.author_id, u.cumulative_count FROM daily_user_channel_count u
             WHERE u.channel_id = ?1 AND u.date = (
                 SELECT MAX(date) FROM daily_user_channel_count
                 WHERE channel_id = u.channel_id AND author_id = u.author_id
             )
             ORDER BY u.cumulative_count DESC, u.author_id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![channel_id, limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every per-user row of a member across all channels, with the owning guild
    /// when the channel is known.
    pub fn member_count_rows(
        &self,
        member_id: u64,
    ) -> anyhow::Result<Vec<(Option<u64>, DailyUserChannelCount)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.guild_id, u.channel_id, u.date, u.count, u.cumulative_count
             FROM daily_user_channel_count u
             LEFT JOIN channel c ON c.id = u.channel_id
             WHERE u.author_id = ?1
             ORDER BY u.channel_id, u.date",
        )?;
        let rows = stmt.query_map([member_id], |row| {
            let date: String = row.get(2)?;
            Ok((
                row.get(0)?,
                DailyUserChannelCount {
                    author_id: member_id,
                    channel_id: row.get(1)?,
                    date: parse_date(&date)?,
                    count: row.get(3)?,
                    cumulative_count: row.get(4)?,
                },
            ))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every author with at least one per-user count row.
    pub fn counted_members(&self) -> anyhow::Result<Vec<u64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT author_id FROM daily_user_channel_count ORDER BY author_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<u64>>>()?)
    }
}
