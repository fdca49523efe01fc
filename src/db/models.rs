use chrono::NaiveDate;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuildRecord {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelRecord {
    pub id: u64,
    pub name: String,
    pub guild_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberRecord {
    pub id: u64,
    pub name: String,
    pub discriminator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NickRecord {
    pub member_id: u64,
    pub guild_id: u64,
    pub nick: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: u64,
    pub channel_id: u64,
    pub author_id: u64,
    /// Epoch seconds.
    pub created_at: i64,
}

/// Which count table, and which key prefix within it, an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountScope {
    Channel(u64),
    User { channel_id: u64, author_id: u64 },
}

impl CountScope {
    pub fn channel_id(&self) -> u64 {
        match self {
            CountScope::Channel(id) => *id,
            CountScope::User { channel_id, .. } => *channel_id,
        }
    }
}

impl std::fmt::Display for CountScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CountScope::Channel(id) => write!(f, "channel {}", id),
            CountScope::User {
                channel_id,
                author_id,
            } => write!(f, "user {} in channel {}", author_id, channel_id),
        }
    }
}

/// Which existing rows of a scope a count write replaces besides its own keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountClear {
    Keep,
    All,
    /// Rows dated on or after the given day.
    From(NaiveDate),
}

/// One day of a count series, independent of the table it is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountRow {
    pub date: NaiveDate,
    pub count: i64,
    pub cumulative_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyChannelCount {
    pub channel_id: u64,
    pub date: NaiveDate,
    pub count: i64,
    pub cumulative_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyUserChannelCount {
    pub author_id: u64,
    pub channel_id: u64,
    pub date: NaiveDate,
    pub count: i64,
    pub cumulative_count: i64,
}

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}
