use crate::config::{Config, GuildConfig, DISCORD_MESSAGE_LIMIT};
use crate::report::{LeaderboardEntry, Reporter};
use async_trait::async_trait;
use chrono::NaiveDate;
use serenity::all::{ChannelId, CreateAllowedMentions, CreateMessage, Http};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const EMPTY_LEADERBOARD: &str =
    "Nothing has been posted here since last time, that's pretty sad... :/";

/// Destination for rendered leaderboards.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn send(&self, channel_id: u64, content: &str) -> anyhow::Result<()>;
}

pub struct DiscordSink {
    http: Arc<Http>,
}

impl DiscordSink {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ReportSink for DiscordSink {
    async fn send(&self, channel_id: u64, content: &str) -> anyhow::Result<()> {
        let builder = CreateMessage::new()
            .content(content)
            .allowed_mentions(CreateAllowedMentions::new());
        ChannelId::new(channel_id)
            .send_message(&self.http, builder)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifySummary {
    pub sent: usize,
    pub silent_guilds: usize,
    pub failed: usize,
}

pub struct Notifier {
    reporter: Reporter,
    sink: Arc<dyn ReportSink>,
    guilds: Vec<GuildConfig>,
    leaderboard_size: usize,
}

impl Notifier {
    pub fn new(
        reporter: Reporter,
        sink: Arc<dyn ReportSink>,
        guilds: Vec<GuildConfig>,
        leaderboard_size: usize,
    ) -> Self {
        Self {
            reporter,
            sink,
            guilds,
            leaderboard_size,
        }
    }

    pub fn from_config(reporter: Reporter, sink: Arc<dyn ReportSink>, config: &Config) -> Self {
        Self::new(reporter, sink, config.guilds.clone(), config.leaderboard_size)
    }

    /// Posts the leaderboard for `date` to every destination channel.
    pub async fn notify(&self, date: NaiveDate) -> anyhow::Result<NotifySummary> {
        let mut summary = NotifySummary::default();

        for guild in &self.guilds {
            if guild.silent {
                debug!("Guild {} is silent, not reporting", guild.id);
                summary.silent_guilds += 1;
                continue;
            }

            let destinations: Vec<u64> = if guild.report_all {
                let reporter = self.reporter.clone();
                let guild_id = guild.id;
                tokio::task::spawn_blocking(move || reporter.channels(guild_id))
                    .await??
                    .into_iter()
                    .map(|c| c.id)
                    .collect()
            } else {
                guild.report.clone()
            };

            for channel_id in destinations {
                let content = match self.render(guild.id, channel_id, date).await {
                    Ok(content) => content,
                    Err(e) => {
                        warn!("Leaderboard for channel {} failed: {}", channel_id, e);
                        summary.failed += 1;
                        continue;
                    }
                };
                match self.sink.send(channel_id, &content).await {
                    Ok(()) => summary.sent += 1,
                    Err(e) => {
                        warn!(
                            "Could not post leaderboard to channel {} in guild {}: {}",
                            channel_id, guild.id, e
                        );
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            "Notifications for {}: {} sent, {} failed",
            date, summary.sent, summary.failed
        );
        Ok(summary)
    }

    async fn render(&self, guild_id: u64, channel_id: u64, date: NaiveDate) -> anyhow::Result<String> {
        let reporter = self.reporter.clone();
        let limit = self.leaderboard_size;
        tokio::task::spawn_blocking(move || {
            let db = reporter.db();
            let channel_name = db
                .get_channel(channel_id)?
                .map(|c| c.name)
                .unwrap_or_else(|| channel_id.to_string());
            let guild_name = db
                .get_guild(guild_id)?
                .map(|g| g.name)
                .unwrap_or_else(|| guild_id.to_string());
            let entries = reporter.leaderboard(channel_id, date, limit)?;
            Ok(format_leaderboard(&channel_name, &guild_name, &entries))
        })
        .await?
    }
}

pub fn format_leaderboard(channel: &str, guild: &str, entries: &[LeaderboardEntry]) -> String {
    let mut out = format!("***Leaderboards for #{} ({}):***\n", channel, guild);
    if entries.is_empty() {
        out.push_str(EMPTY_LEADERBOARD);
    }
    for entry in entries {
        out.push_str(&format!(
            "**{}**. with {} messages: **{}",
            entry.rank, entry.count, entry.name
        ));
        if let Some(discriminator) = &entry.discriminator {
            out.push('#');
            out.push_str(discriminator);
        }
        out.push_str("**\n");
    }
    truncate_chars(out.trim_end(), DISCORD_MESSAGE_LIMIT)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
