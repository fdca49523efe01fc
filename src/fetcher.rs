//! Incremental history ingestion from Discord into the local store.

use crate::config::{Config, GuildConfig};
use crate::db::{ChannelRecord, Database, GuildRecord, MemberRecord, MessageRecord, NickRecord};
use async_trait::async_trait;
use serenity::all::{ChannelId, ChannelType, GetMessages, GuildId, Http, MessageId, UserId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Milliseconds between the Unix epoch and Discord's snowflake epoch.
pub const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;
/// Stored timestamps older than this (2015-05-13) are treated as missing.
pub const PLATFORM_LAUNCH: i64 = 1_431_468_000;
pub const MESSAGE_PAGE_SIZE: u8 = 100;
pub const MEMBER_PAGE_SIZE: u64 = 1000;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("missing access")]
    AccessDenied,
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMember {
    pub member: MemberRecord,
    pub nick: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSnapshot {
    pub guild: GuildRecord,
    /// Text and announcement channels only.
    pub channels: Vec<ChannelRecord>,
    pub members: Vec<FetchedMember>,
}

pub type FetchedMessage = MessageRecord;

/// Where guild metadata and message history come from.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// The guild and its text channels.
    async fn guild_channels(
        &self,
        guild_id: u64,
    ) -> Result<(GuildRecord, Vec<ChannelRecord>), FetchError>;

    async fn guild_members(&self, guild_id: u64) -> Result<Vec<FetchedMember>, FetchError>;

    /// Guild, channels and members. An unreadable member list only costs the
    /// member names; the guild and its channels are still returned.
    async fn guild_snapshot(&self, guild_id: u64) -> Result<GuildSnapshot, FetchError> {
        let (guild, channels) = self.guild_channels(guild_id).await?;
        let members = match self.guild_members(guild_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(
                    "Members of guild {} unavailable, continuing without names: {}",
                    guild_id, e
                );
                Vec::new()
            }
        };
        Ok(GuildSnapshot {
            guild,
            channels,
            members,
        })
    }

    /// Up to `limit` messages with an ID above `after`, or from the start of
    /// the channel when `after` is `None`.
    async fn messages_after(
        &self,
        channel_id: u64,
        after: Option<u64>,
        limit: u8,
    ) -> Result<Vec<FetchedMessage>, FetchError>;
}

/// Smallest snowflake that could have been minted at `timestamp` (seconds).
pub fn snowflake_from_timestamp(timestamp: i64) -> u64 {
    let ms = timestamp.saturating_mul(1000) - DISCORD_EPOCH_MS;
    (ms.max(0) as u64) << 22
}

/// Cursor to resume a channel from, given its newest stored message.
pub fn resume_cursor(last_timestamp: Option<i64>, backoff: Duration) -> Option<u64> {
    let last = last_timestamp.filter(|ts| *ts > PLATFORM_LAUNCH)?;
    let from = last - backoff.as_secs() as i64;
    Some(snowflake_from_timestamp(from)).filter(|id| *id > 0)
}

pub struct DiscordSource {
    http: Arc<Http>,
}

impl DiscordSource {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn classify(err: serenity::Error) -> FetchError {
    if let serenity::Error::Http(http_err) = &err {
        match http_err.status_code().map(|s| s.as_u16()) {
            Some(403) => return FetchError::AccessDenied,
            Some(404) => return FetchError::NotFound,
            _ => {}
        }
    }
    FetchError::Transport(err.into())
}

#[async_trait]
impl HistorySource for DiscordSource {
    async fn guild_channels(
        &self,
        guild_id: u64,
    ) -> Result<(GuildRecord, Vec<ChannelRecord>), FetchError> {
        let id = GuildId::new(guild_id);
        let guild = id.to_partial_guild(&self.http).await.map_err(classify)?;

        let mut channels: Vec<ChannelRecord> = id
            .channels(&self.http)
            .await
            .map_err(classify)?
            .into_values()
            .filter(|c| matches!(c.kind, ChannelType::Text | ChannelType::News))
            .map(|c| ChannelRecord {
                id: c.id.get(),
                name: c.name,
                guild_id,
            })
            .collect();
        channels.sort_by_key(|c| c.id);

        Ok((
            GuildRecord {
                id: guild_id,
                name: guild.name,
            },
            channels,
        ))
    }

    /// Pages of 1000. A failure after the first page keeps what was read.
    async fn guild_members(&self, guild_id: u64) -> Result<Vec<FetchedMember>, FetchError> {
        let id = GuildId::new(guild_id);
        let mut members: Vec<FetchedMember> = Vec::new();
        let mut after: Option<UserId> = None;
        loop {
            let page = match id
                .members(&self.http, Some(MEMBER_PAGE_SIZE), after)
                .await
            {
                Ok(page) => page,
                Err(e) if !members.is_empty() => {
                    warn!(
                        "Member list of guild {} cut short after {} members: {}",
                        guild_id,
                        members.len(),
                        e
                    );
                    break;
                }
                Err(e) => return Err(classify(e)),
            };
            let full = page.len() as u64 >= MEMBER_PAGE_SIZE;
            after = page.last().map(|m| m.user.id);
            members.extend(page.into_iter().map(|m| FetchedMember {
                member: MemberRecord {
                    id: m.user.id.get(),
                    name: m.user.name,
                    discriminator: m.user.discriminator.map(|d| format!("{:04}", d.get())),
                },
                nick: m.nick,
            }));
            if !full || after.is_none() {
                break;
            }
        }
        Ok(members)
    }

    async fn messages_after(
        &self,
        channel_id: u64,
        after: Option<u64>,
        limit: u8,
    ) -> Result<Vec<FetchedMessage>, FetchError> {
        // Snowflake 1 predates every message, so paging starts at the oldest.
        let after = MessageId::new(after.unwrap_or(1).max(1));
        let builder = GetMessages::new().after(after).limit(limit);
        let messages = ChannelId::new(channel_id)
            .messages(&self.http, builder)
            .await
            .map_err(classify)?;
        Ok(messages
            .into_iter()
            .map(|m| MessageRecord {
                id: m.id.get(),
                channel_id,
                author_id: m.author.id.get(),
                created_at: m.timestamp.unix_timestamp(),
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub backoff: Duration,
    pub batch_size: usize,
    pub page_size: u8,
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backoff: config.fetch_backoff,
            batch_size: config.write_batch_size,
            page_size: MESSAGE_PAGE_SIZE,
        }
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(10),
            batch_size: 300,
            page_size: MESSAGE_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub guilds: usize,
    pub missing_guilds: usize,
    pub channels: usize,
    pub skipped_channels: usize,
    pub messages: usize,
}

pub struct Fetcher {
    db: Database,
    source: Arc<dyn HistorySource>,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(db: Database, source: Arc<dyn HistorySource>, settings: FetchSettings) -> Self {
        Self {
            db,
            source,
            settings,
        }
    }

    /// Fetches every configured guild. Only storage failures abort the run.
    pub async fn run(&self, guilds: &[GuildConfig]) -> anyhow::Result<FetchSummary> {
        let mut summary = FetchSummary::default();

        for guild_config in guilds {
            let snapshot = match self.source.guild_snapshot(guild_config.id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Guild {} unavailable, skipping: {}", guild_config.id, e);
                    summary.missing_guilds += 1;
                    continue;
                }
            };
            info!("Fetching {} ({})", snapshot.guild.name, snapshot.guild.id);

            let selected = guild_config.select_channels(
                &snapshot.channels.iter().map(|c| c.id).collect::<Vec<_>>(),
            );
            let channels: Vec<ChannelRecord> = snapshot
                .channels
                .iter()
                .filter(|c| selected.contains(&c.id))
                .cloned()
                .collect();
            self.store_metadata(snapshot, channels.clone()).await?;
            summary.guilds += 1;

            for channel in &channels {
                match self.fetch_channel(channel.id).await {
                    Ok(stored) => {
                        let channel_id = channel.id;
                        let total = self
                            .db
                            .run_blocking(move |db| db.message_count(channel_id))
                            .await?;
                        info!(
                            "  #{} ({}): {} new, {} stored",
                            channel.name, channel.id, stored, total
                        );
                        summary.channels += 1;
                        summary.messages += stored;
                    }
                    Err(FetchError::AccessDenied) => {
                        warn!(
                            "  #{} ({}) in guild {}: no access, skipping",
                            channel.name, channel.id, channel.guild_id
                        );
                        summary.skipped_channels += 1;
                    }
                    Err(e) => {
                        warn!(
                            "  #{} ({}) in guild {} failed: {}",
                            channel.name, channel.id, channel.guild_id, e
                        );
                        summary.skipped_channels += 1;
                    }
                }
            }
        }

        info!(
            "Fetch finished: {} messages from {} channels, {} channels skipped",
            summary.messages, summary.channels, summary.skipped_channels
        );
        Ok(summary)
    }

    async fn store_metadata(
        &self,
        snapshot: GuildSnapshot,
        channels: Vec<ChannelRecord>,
    ) -> anyhow::Result<()> {
        let batch = self.settings.batch_size;
        let guild_id = snapshot.guild.id;
        let nicks: Vec<NickRecord> = snapshot
            .members
            .iter()
            .filter_map(|m| {
                m.nick.clone().map(|nick| NickRecord {
                    member_id: m.member.id,
                    guild_id,
                    nick,
                })
            })
            .collect();
        let members: Vec<MemberRecord> = snapshot.members.into_iter().map(|m| m.member).collect();
        let guild = snapshot.guild;

        self.db
            .run_blocking(move |db| {
                db.upsert_guild(&guild)?;
                db.upsert_channels(&channels, batch)?;
                let members = db.upsert_members(&members, batch)?;
                let nicks = db.upsert_nicks(&nicks, batch)?;
                debug!(
                    "Stored {} channels, {} members, {} nicknames for guild {}",
                    channels.len(),
                    members,
                    nicks,
                    guild.id
                );
                Ok(())
            })
            .await
    }

    /// Pages a channel forward from its resume cursor. Every page is stored
    /// before the cursor moves past it.
    pub async fn fetch_channel(&self, channel_id: u64) -> Result<usize, FetchError> {
        let last = self
            .db
            .run_blocking(move |db| db.last_message_timestamp(channel_id))
            .await?;
        let mut cursor = resume_cursor(last, self.settings.backoff);
        let page_size = self.settings.page_size.max(1);
        let batch = self.settings.batch_size;
        let mut stored = 0usize;

        loop {
            let mut page = self
                .source
                .messages_after(channel_id, cursor, page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            page.sort_by_key(|m| m.id);
            let full = page.len() >= page_size as usize;
            let next = page.last().map(|m| m.id);

            stored += self
                .db
                .run_blocking(move |db| db.upsert_messages(&page, batch))
                .await?;

            if next <= cursor {
                break;
            }
            cursor = next;
            if !full {
                break;
            }
            debug!("Channel {}: {} messages so far", channel_id, stored);
        }

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSource {
        guilds: HashMap<u64, GuildSnapshot>,
        messages: HashMap<u64, Vec<MessageRecord>>,
        denied: Vec<u64>,
        members_denied: bool,
        calls: Mutex<Vec<(u64, Option<u64>)>>,
    }

    impl FakeSource {
        fn guild(&self, guild_id: u64) -> Result<&GuildSnapshot, FetchError> {
            self.guilds.get(&guild_id).ok_or(FetchError::NotFound)
        }
    }

    #[async_trait]
    impl HistorySource for FakeSource {
        async fn guild_channels(
            &self,
            guild_id: u64,
        ) -> Result<(GuildRecord, Vec<ChannelRecord>), FetchError> {
            let guild = self.guild(guild_id)?;
            Ok((guild.guild.clone(), guild.channels.clone()))
        }

        async fn guild_members(&self, guild_id: u64) -> Result<Vec<FetchedMember>, FetchError> {
            if self.members_denied {
                return Err(FetchError::AccessDenied);
            }
            Ok(self.guild(guild_id)?.members.clone())
        }

        async fn messages_after(
            &self,
            channel_id: u64,
            after: Option<u64>,
            limit: u8,
        ) -> Result<Vec<FetchedMessage>, FetchError> {
            self.calls.lock().unwrap().push((channel_id, after));
            if self.denied.contains(&channel_id) {
                return Err(FetchError::AccessDenied);
            }
            // Newest first, like the API, to exercise the sort.
            let mut page: Vec<_> = self
                .messages
                .get(&channel_id)
                .into_iter()
                .flatten()
                .filter(|m| after.map_or(true, |a| m.id > a))
                .take(limit as usize)
                .copied()
                .collect();
            page.reverse();
            Ok(page)
        }
    }

    const BASE: i64 = 1_704_067_200; // 2024-01-01 00:00 UTC

    fn message(channel_id: u64, author_id: u64, created_at: i64) -> MessageRecord {
        MessageRecord {
            id: snowflake_from_timestamp(created_at) + author_id,
            channel_id,
            author_id,
            created_at,
        }
    }

    fn snapshot() -> GuildSnapshot {
        GuildSnapshot {
            guild: GuildRecord {
                id: 1,
                name: "Guild".to_string(),
            },
            channels: [(10, "general"), (11, "secret"), (12, "blocked")]
                .into_iter()
                .map(|(id, name)| ChannelRecord {
                    id,
                    name: name.to_string(),
                    guild_id: 1,
                })
                .collect(),
            members: vec![
                FetchedMember {
                    member: MemberRecord {
                        id: 5,
                        name: "alice".to_string(),
                        discriminator: None,
                    },
                    nick: Some("Al".to_string()),
                },
                FetchedMember {
                    member: MemberRecord {
                        id: 6,
                        name: "bob".to_string(),
                        discriminator: Some("0042".to_string()),
                    },
                    nick: None,
                },
            ],
        }
    }

    fn source() -> FakeSource {
        let general: Vec<_> = (0..7i64)
            .map(|i| message(10, 5 + (i as u64 % 2), BASE + i * 60))
            .collect();
        FakeSource {
            guilds: HashMap::from([(1, snapshot())]),
            messages: HashMap::from([(10, general), (12, vec![message(12, 5, BASE)])]),
            denied: vec![11],
            ..Default::default()
        }
    }

    fn guild_config() -> GuildConfig {
        GuildConfig {
            id: 1,
            all_channels: true,
            blocked_channels: vec![12],
            ..Default::default()
        }
    }

    fn fetcher(db: &Database, source: Arc<FakeSource>) -> Fetcher {
        let settings = FetchSettings {
            page_size: 3,
            ..Default::default()
        };
        Fetcher::new(db.clone(), source, settings)
    }

    fn memory_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.execute_init().unwrap();
        db
    }

    #[test]
    fn test_snowflake_conversion() {
        assert_eq!(snowflake_from_timestamp(1_420_070_400), 0);
        assert_eq!(snowflake_from_timestamp(1_420_070_401), 1000 << 22);
        assert_eq!(snowflake_from_timestamp(0), 0);
    }

    #[test]
    fn test_resume_cursor() {
        let backoff = Duration::from_secs(10);
        assert_eq!(resume_cursor(None, backoff), None);
        assert_eq!(resume_cursor(Some(PLATFORM_LAUNCH - 5), backoff), None);
        assert_eq!(
            resume_cursor(Some(BASE), backoff),
            Some(snowflake_from_timestamp(BASE - 10))
        );
    }

    #[tokio::test]
    async fn test_fetch_stores_metadata_and_pages() {
        let db = memory_db();
        let source = Arc::new(source());
        let summary = fetcher(&db, source.clone())
            .run(&[guild_config(), GuildConfig {
                id: 404,
                ..Default::default()
            }])
            .await
            .unwrap();

        assert_eq!(summary.guilds, 1);
        assert_eq!(summary.missing_guilds, 1);
        assert_eq!(summary.channels, 1);
        assert_eq!(summary.skipped_channels, 1);
        assert_eq!(summary.messages, 7);
        assert_eq!(db.message_count(10).unwrap(), 7);
        assert_eq!(db.message_count(12).unwrap(), 0);

        assert_eq!(db.get_guild(1).unwrap().unwrap().name, "Guild");
        let stored: Vec<_> = db
            .channels_for_guild(1)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(stored, vec![10, 11]);
        assert_eq!(db.get_nick(5, 1).unwrap().as_deref(), Some("Al"));
        assert_eq!(db.get_nick(6, 1).unwrap(), None);
        assert_eq!(
            db.get_member(6).unwrap().unwrap().discriminator.as_deref(),
            Some("0042")
        );

        // 7 messages in pages of 3: three requests, the first from the start.
        let calls: Vec<_> = source
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == 10)
            .map(|(_, after)| *after)
            .collect();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], None);
    }

    #[tokio::test]
    async fn test_refetch_resumes_with_backoff() {
        let db = memory_db();
        let source = Arc::new(source());
        let fetcher = fetcher(&db, source.clone());
        fetcher.run(&[guild_config()]).await.unwrap();
        source.calls.lock().unwrap().clear();

        let stored = fetcher.fetch_channel(10).await.unwrap();
        let calls = source.calls.lock().unwrap().clone();
        let last = BASE + 6 * 60;
        assert_eq!(calls[0], (10, Some(snowflake_from_timestamp(last - 10))));
        // Only the newest message falls inside the backoff window.
        assert_eq!(stored, 1);
        assert_eq!(db.message_count(10).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_member_list_denied_still_fetches_messages() {
        let db = memory_db();
        let source = Arc::new(FakeSource {
            members_denied: true,
            ..source()
        });
        let summary = fetcher(&db, source).run(&[guild_config()]).await.unwrap();

        assert_eq!(summary.guilds, 1);
        assert_eq!(summary.missing_guilds, 0);
        assert_eq!(summary.messages, 7);
        assert_eq!(db.get_guild(1).unwrap().unwrap().name, "Guild");
        assert_eq!(db.get_member(5).unwrap(), None);
    }
}
