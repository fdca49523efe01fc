use super::{AggregationEngine, AggregationError, AggregationOutcome};
use crate::config::GuildConfig;
use crate::db::Database;
use tracing::{error, info, warn};

/// A stored channel selected for aggregation, with names for progress logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub guild_id: u64,
    pub guild_name: String,
    pub channel_id: u64,
    pub channel_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub computed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_written: usize,
}

/// Resolves the configured guilds against stored metadata.
pub fn targets_from_config(
    db: &Database,
    guilds: &[GuildConfig],
) -> anyhow::Result<Vec<ChannelTarget>> {
    let mut targets = Vec::new();
    for guild_config in guilds {
        let Some(guild) = db.get_guild(guild_config.id)? else {
            warn!(
                "Guild {} has no stored metadata; run a fetch first",
                guild_config.id
            );
            continue;
        };
        for channel in db.channels_for_guild(guild.id)? {
            if guild_config.tracks(channel.id) {
                targets.push(ChannelTarget {
                    guild_id: guild.id,
                    guild_name: guild.name.clone(),
                    channel_id: channel.id,
                    channel_name: channel.name,
                });
            }
        }
    }
    Ok(targets)
}

impl AggregationEngine {
    /// Sequential pass over `targets`. A failing channel is logged and the
    /// pass moves on.
    pub fn run_pass(&self, targets: &[ChannelTarget], reset: bool) -> PassSummary {
        let mut summary = PassSummary::default();
        let mut current_guild = None;

        for target in targets {
            if current_guild != Some(target.guild_id) {
                info!("Aggregating {} ({})", target.guild_name, target.guild_id);
                current_guild = Some(target.guild_id);
            }

            match self.compute_channel(target.channel_id, reset) {
                Ok(report) => match report.outcome {
                    AggregationOutcome::Skipped => {
                        info!(
                            "  #{} ({}) skipped: no messages",
                            target.channel_name, target.channel_id
                        );
                        summary.skipped += 1;
                    }
                    AggregationOutcome::Computed { rows_written, .. } => {
                        info!(
                            "  #{} ({}) done: {} channel rows, {} users",
                            target.channel_name, target.channel_id, rows_written, report.users
                        );
                        summary.computed += 1;
                        summary.rows_written += rows_written + report.user_rows;
                    }
                },
                Err(e @ AggregationError::InvariantViolation { .. }) => {
                    error!(
                        "  #{} ({}) in guild {}: {}; re-run with --reset --channel {}",
                        target.channel_name,
                        target.channel_id,
                        target.guild_id,
                        e,
                        target.channel_id
                    );
                    summary.failed += 1;
                }
                Err(e) => {
                    error!(
                        "  #{} ({}) in guild {} failed: {}",
                        target.channel_name, target.channel_id, target.guild_id, e
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Aggregation pass finished: {} computed, {} skipped, {} failed",
            summary.computed, summary.skipped, summary.failed
        );
        summary
    }
}
