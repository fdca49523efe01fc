//! Read-only views over the count tables for pages and notifications.

use crate::db::{ChannelRecord, DailyChannelCount, Database, GuildRecord};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatedCount {
    pub date: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthCount {
    /// `YYYY-MM` of the local calendar day.
    pub month: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub member_id: u64,
    pub name: String,
    pub discriminator: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberTotal {
    pub member_id: u64,
    pub name: String,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelActivity {
    pub channel_id: u64,
    pub channel_name: Option<String>,
    pub guild_id: Option<u64>,
    pub total: i64,
    pub daily: Vec<DatedCount>,
    pub monthly: Vec<MonthCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberActivity {
    pub member_id: u64,
    pub name: Option<String>,
    pub guilds: Vec<u64>,
    pub channels: Vec<ChannelActivity>,
}

#[derive(Clone)]
pub struct Reporter {
    db: Database,
}

impl Reporter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn guilds(&self) -> anyhow::Result<Vec<GuildRecord>> {
        self.db.list_guilds()
    }

    pub fn channels(&self, guild_id: u64) -> anyhow::Result<Vec<ChannelRecord>> {
        self.db.channels_for_guild(guild_id)
    }

    /// Members that have any per-channel counts.
    pub fn members(&self) -> anyhow::Result<Vec<u64>> {
        self.db.counted_members()
    }

    /// Per-date sum over the guild's channels.
    pub fn guild_daily_totals(&self, guild_id: u64) -> anyhow::Result<Vec<DatedCount>> {
        Ok(self
            .db
            .guild_daily_totals(guild_id)?
            .into_iter()
            .map(|(date, count)| DatedCount { date, count })
            .collect())
    }

    pub fn channel_daily_series(&self, channel_id: u64) -> anyhow::Result<Vec<DailyChannelCount>> {
        self.db.channel_counts(channel_id)
    }

    /// Nickname in `guild_id` if any, else the account name, else a placeholder.
    pub fn display_name(
        &self,
        member_id: u64,
        guild_id: Option<u64>,
    ) -> anyhow::Result<(String, Option<String>)> {
        let nick = match guild_id {
            Some(guild_id) => self.db.get_nick(member_id, guild_id)?,
            None => None,
        };
        let member = self.db.get_member(member_id)?;
        let discriminator = member.as_ref().and_then(|m| m.discriminator.clone());
        let name = nick
            .or_else(|| member.map(|m| m.name))
            .unwrap_or_else(|| format!("UNKNOWN ({})", member_id));
        Ok((name, discriminator))
    }

    /// Top `limit` posters of a channel on `date`.
    pub fn leaderboard(
        &self,
        channel_id: u64,
        date: NaiveDate,
        limit: usize,
    ) -> anyhow::Result<Vec<LeaderboardEntry>> {
        let guild_id = self.db.get_channel(channel_id)?.map(|c| c.guild_id);
        self.db
            .user_counts_on(channel_id, date, limit)?
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let (name, discriminator) = self.display_name(row.author_id, guild_id)?;
                Ok(LeaderboardEntry {
                    rank: i + 1,
                    member_id: row.author_id,
                    name,
                    discriminator,
                    count: row.count,
                })
            })
            .collect()
    }

    /// Members ranked by their all-time count in a channel.
    pub fn top_members(&self, channel_id: u64, limit: usize) -> anyhow::Result<Vec<MemberTotal>> {
        let guild_id = self.db.get_channel(channel_id)?.map(|c| c.guild_id);
        self.db
            .user_totals(channel_id, limit)?
            .into_iter()
            .map(|(member_id, total)| {
                let (name, _) = self.display_name(member_id, guild_id)?;
                Ok(MemberTotal {
                    member_id,
                    name,
                    total,
                })
            })
            .collect()
    }

    /// Every channel and guild a member has counts in, with their series.
    pub fn member_activity(&self, member_id: u64) -> anyhow::Result<MemberActivity> {
        let mut guilds = BTreeSet::new();
        let mut per_channel: BTreeMap<u64, (Option<u64>, Vec<DatedCount>)> = BTreeMap::new();

        for (guild_id, row) in self.db.member_count_rows(member_id)? {
            if let Some(guild_id) = guild_id {
                guilds.insert(guild_id);
            }
            per_channel
                .entry(row.channel_id)
                .or_insert_with(|| (guild_id, Vec::new()))
                .1
                .push(DatedCount {
                    date: row.date,
                    count: row.count,
                });
        }

        let mut channels = Vec::with_capacity(per_channel.len());
        for (channel_id, (guild_id, daily)) in per_channel {
            let channel_name = self.db.get_channel(channel_id)?.map(|c| c.name);
            channels.push(ChannelActivity {
                channel_id,
                channel_name,
                guild_id,
                total: daily.iter().map(|d| d.count).sum(),
                monthly: monthly_rollup(&daily),
                daily,
            });
        }

        Ok(MemberActivity {
            member_id,
            name: self.db.get_member(member_id)?.map(|m| m.name),
            guilds: guilds.into_iter().collect(),
            channels,
        })
    }
}

/// Groups daily counts by calendar month. The dates are already local days,
/// so the month buckets inherit the report timezone.
pub fn monthly_rollup(daily: &[DatedCount]) -> Vec<MonthCount> {
    let mut months: BTreeMap<String, i64> = BTreeMap::new();
    for day in daily {
        *months.entry(day.date.format("%Y-%m").to_string()).or_default() += day.count;
    }
    months
        .into_iter()
        .map(|(month, count)| MonthCount { month, count })
        .collect()
}

/// Highest count; ties go to the earliest date.
pub fn busiest_day(daily: &[DatedCount]) -> Option<&DatedCount> {
    daily
        .iter()
        .max_by(|a, b| a.count.cmp(&b.count).then(b.date.cmp(&a.date)))
}

/// Highest count; ties go to the earliest month.
pub fn busiest_month(months: &[MonthCount]) -> Option<&MonthCount> {
    months
        .iter()
        .max_by(|a, b| a.count.cmp(&b.count).then(b.month.cmp(&a.month)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        ChannelRecord, CountClear, CountRow, CountScope, GuildRecord, MemberRecord, NickRecord,
    };

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn dated(date: NaiveDate, count: i64) -> DatedCount {
        DatedCount { date, count }
    }

    fn write_series(db: &Database, scope: CountScope, days: &[(NaiveDate, i64)]) {
        let mut running = 0;
        let rows: Vec<_> = days
            .iter()
            .map(|&(date, count)| {
                running += count;
                CountRow {
                    date,
                    count,
                    cumulative_count: running,
                }
            })
            .collect();
        db.write_counts(scope, &rows, CountClear::All).unwrap();
    }

    fn seeded() -> Reporter {
        let db = Database::open_in_memory().unwrap();
        db.execute_init().unwrap();
        for (id, name) in [(1, "One"), (2, "Two")] {
            db.upsert_guild(&GuildRecord {
                id,
                name: name.to_string(),
            })
            .unwrap();
        }
        db.upsert_channels(
            &[
                ChannelRecord {
                    id: 10,
                    name: "general".to_string(),
                    guild_id: 1,
                },
                ChannelRecord {
                    id: 11,
                    name: "random".to_string(),
                    guild_id: 1,
                },
                ChannelRecord {
                    id: 20,
                    name: "lobby".to_string(),
                    guild_id: 2,
                },
            ],
            300,
        )
        .unwrap();
        db.upsert_members(
            &[
                MemberRecord {
                    id: 100,
                    name: "alice".to_string(),
                    discriminator: Some("0001".to_string()),
                },
                MemberRecord {
                    id: 200,
                    name: "bob".to_string(),
                    discriminator: None,
                },
            ],
            300,
        )
        .unwrap();
        db.upsert_nicks(
            &[NickRecord {
                member_id: 100,
                guild_id: 1,
                nick: "Queen Alice".to_string(),
            }],
            300,
        )
        .unwrap();

        write_series(
            &db,
            CountScope::Channel(10),
            &[(ymd(2024, 1, 30), 4), (ymd(2024, 1, 31), 1), (ymd(2024, 2, 1), 2)],
        );
        write_series(&db, CountScope::Channel(11), &[(ymd(2024, 1, 31), 3)]);
        write_series(&db, CountScope::Channel(20), &[(ymd(2024, 2, 1), 9)]);

        let user = |channel_id, author_id| CountScope::User {
            channel_id,
            author_id,
        };
        write_series(&db, user(10, 100), &[(ymd(2024, 1, 30), 3), (ymd(2024, 2, 1), 1)]);
        write_series(&db, user(10, 200), &[(ymd(2024, 1, 30), 1), (ymd(2024, 2, 1), 1)]);
        write_series(&db, user(20, 100), &[(ymd(2024, 2, 1), 9)]);
        write_series(&db, user(10, 300), &[(ymd(2024, 2, 1), 5)]);

        Reporter::new(db)
    }

    #[test]
    fn test_guild_totals_tolerate_sparse_channels() {
        let reporter = seeded();
        let daily = reporter.guild_daily_totals(1).unwrap();
        assert_eq!(
            daily,
            vec![
                dated(ymd(2024, 1, 30), 4),
                dated(ymd(2024, 1, 31), 4),
                dated(ymd(2024, 2, 1), 2),
            ]
        );
        assert!(reporter.guild_daily_totals(3).unwrap().is_empty());
    }

    #[test]
    fn test_monthly_rollup_and_busiest() {
        let daily = vec![
            dated(ymd(2024, 1, 30), 4),
            dated(ymd(2024, 1, 31), 4),
            dated(ymd(2024, 2, 1), 2),
        ];
        let months = monthly_rollup(&daily);
        assert_eq!(
            months,
            vec![
                MonthCount {
                    month: "2024-01".to_string(),
                    count: 8
                },
                MonthCount {
                    month: "2024-02".to_string(),
                    count: 2
                },
            ]
        );
        // Tie between the 30th and 31st goes to the earlier day.
        assert_eq!(busiest_day(&daily), Some(&daily[0]));
        assert_eq!(busiest_month(&months).unwrap().month, "2024-01");
        assert_eq!(busiest_day(&[]), None);
        assert_eq!(busiest_month(&[]), None);
    }

    #[test]
    fn test_leaderboard_names_and_order() {
        let reporter = seeded();
        let board = reporter.leaderboard(10, ymd(2024, 2, 1), 10).unwrap();
        let summary: Vec<_> = board
            .iter()
            .map(|e| (e.rank, e.name.as_str(), e.count))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "UNKNOWN (300)", 5),
                (2, "Queen Alice", 1),
                (3, "bob", 1),
            ]
        );
        assert_eq!(board[1].discriminator.as_deref(), Some("0001"));

        let top_two = reporter.leaderboard(10, ymd(2024, 2, 1), 2).unwrap();
        assert_eq!(top_two.len(), 2);
        assert!(reporter
            .leaderboard(10, ymd(2024, 1, 31), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_top_members_by_cumulative() {
        let reporter = seeded();
        let top: Vec<_> = reporter
            .top_members(10, 10)
            .unwrap()
            .into_iter()
            .map(|m| (m.member_id, m.total))
            .collect();
        assert_eq!(top, vec![(300, 5), (100, 4), (200, 2)]);
    }

    #[test]
    fn test_member_activity_across_guilds() {
        let reporter = seeded();
        let activity = reporter.member_activity(100).unwrap();
        assert_eq!(activity.name.as_deref(), Some("alice"));
        assert_eq!(activity.guilds, vec![1, 2]);
        assert_eq!(activity.channels.len(), 2);

        let general = &activity.channels[0];
        assert_eq!(general.channel_id, 10);
        assert_eq!(general.channel_name.as_deref(), Some("general"));
        assert_eq!(general.total, 4);
        assert_eq!(general.monthly.len(), 2);

        let lobby = &activity.channels[1];
        assert_eq!(lobby.guild_id, Some(2));
        assert_eq!(lobby.daily, vec![dated(ymd(2024, 2, 1), 9)]);

        assert_eq!(reporter.members().unwrap(), vec![100, 200, 300]);

        let nobody = reporter.member_activity(999).unwrap();
        assert!(nobody.channels.is_empty());
        assert!(nobody.guilds.is_empty());
        assert_eq!(nobody.name, None);
    }
}
