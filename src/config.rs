use chrono_tz::Tz;
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("DISCORD_TOKEN must be set")]
    MissingToken,
}

/// Per-guild selection and reporting rules.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct GuildConfig {
    pub id: u64,
    /// Track every text channel of the guild instead of the `channels` allow-list.
    #[serde(default)]
    pub all_channels: bool,
    #[serde(default)]
    pub channels: Vec<u64>,
    /// Only consulted when `all_channels` is set.
    #[serde(default)]
    pub blocked_channels: Vec<u64>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub report_all: bool,
    #[serde(default)]
    pub report: Vec<u64>,
}

impl GuildConfig {
    /// Whether `channel_id` should be fetched and aggregated for this guild.
    pub fn tracks(&self, channel_id: u64) -> bool {
        if self.all_channels {
            !self.blocked_channels.contains(&channel_id)
        } else {
            self.channels.contains(&channel_id)
        }
    }

    /// Filters `known` down to the tracked channels, keeping the input order.
    pub fn select_channels(&self, known: &[u64]) -> Vec<u64> {
        let mut seen = HashSet::new();
        known
            .iter()
            .copied()
            .filter(|id| self.tracks(*id) && seen.insert(*id))
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatsFile {
    timezone: Option<String>,
    #[serde(default)]
    guilds: Vec<GuildConfig>,
}

#[derive(Clone)]
pub struct Config {
    pub discord_token: Option<String>,
    pub database_url: String,
    pub config_path: PathBuf,
    pub timezone: Tz,
    pub fetch_backoff: Duration,
    pub write_batch_size: usize,
    pub leaderboard_size: usize,
    pub pages_dir: PathBuf,
    pub guilds: Vec<GuildConfig>,
}

impl Config {
    /// Loads `.env`, then the guild file at `path` (or `DISCOLOG_CONFIG`).
    pub fn from_env(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenv().ok();
        let config_path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("DISCOLOG_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("discolog.toml"));

        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let file: StatsFile = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: config_path.clone(),
            source,
        })?;

        Ok(Self::build(file, config_path)?)
    }

    /// Builds a config from TOML text, still honoring environment overrides.
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let file: StatsFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Ok(Self::build(file, PathBuf::from("<inline>"))?)
    }

    fn build(file: StatsFile, config_path: PathBuf) -> Result<Self, ConfigError> {
        let tz_name = env::var("TIMEZONE")
            .ok()
            .or(file.timezone)
            .unwrap_or_else(|| "UTC".to_string());
        let timezone = parse_timezone(&tz_name)?;

        let fetch_backoff = match env::var("FETCH_BACKOFF") {
            Ok(raw) => humantime::parse_duration(raw.trim()).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "FETCH_BACKOFF",
                    reason: e.to_string(),
                }
            })?,
            Err(_) => Duration::from_secs(10),
        };

        let write_batch_size = positive_env("WRITE_BATCH_SIZE", 300)?;
        let leaderboard_size = positive_env("LEADERBOARD_SIZE", 10)?;

        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN").ok().filter(|t| !t.is_empty()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/discolog.db".to_string()),
            config_path,
            timezone,
            fetch_backoff,
            write_batch_size,
            leaderboard_size,
            pages_dir: env::var("PAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("public")),
            guilds: file.guilds,
        })
    }

    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.discord_token.as_deref().ok_or(ConfigError::MissingToken)
    }
}

/// A count read from `key`, falling back to `default` when unset.
fn positive_env(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    let Ok(raw) = env::var(key) else {
        return Ok(default);
    };
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key,
            reason: "must be at least 1".to_string(),
        }),
        Ok(value) => Ok(value),
        Err(e) => Err(ConfigError::InvalidValue {
            key,
            reason: format!("'{}': {}", raw, e),
        }),
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field(
                "discord_token",
                &self.discord_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("database_url", &self.database_url)
            .field("config_path", &self.config_path)
            .field("timezone", &self.timezone)
            .field("fetch_backoff", &self.fetch_backoff)
            .field("write_batch_size", &self.write_batch_size)
            .field("leaderboard_size", &self.leaderboard_size)
            .field("pages_dir", &self.pages_dir)
            .field("guilds", &self.guilds)
            .finish()
    }
}

/// Discord message limit is 2000 characters
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const SAMPLE: &str = r#"
        timezone = "Europe/Paris"

        [[guilds]]
        id = 1
        all_channels = true
        blocked_channels = [13]
        report_all = true

        [[guilds]]
        id = 2
        channels = [21, 22]
        silent = true
        report = [21]
    "#;

    // Env vars are process-global, so everything touching them lives in one test.
    #[test]
    fn test_config_logic() {
        env::remove_var("TIMEZONE");
        env::remove_var("FETCH_BACKOFF");
        env::remove_var("WRITE_BATCH_SIZE");
        env::remove_var("LEADERBOARD_SIZE");
        env::set_var("DISCORD_TOKEN", "secret_token");

        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.timezone, chrono_tz::Europe::Paris);
        assert_eq!(config.fetch_backoff, Duration::from_secs(10));
        assert_eq!(config.write_batch_size, 300);
        assert_eq!(config.leaderboard_size, 10);
        assert_eq!(config.guilds.len(), 2);
        assert_eq!(config.require_token().unwrap(), "secret_token");

        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("secret_token"));
        assert!(debug_output.contains("[REDACTED]"));

        env::set_var("TIMEZONE", "America/New_York");
        env::set_var("FETCH_BACKOFF", "5s");
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.timezone, chrono_tz::America::New_York);
        assert_eq!(config.fetch_backoff, Duration::from_secs(5));

        env::set_var("TIMEZONE", "Mars/Olympus_Mons");
        assert!(Config::from_toml_str(SAMPLE).is_err());
        env::remove_var("TIMEZONE");

        env::set_var("WRITE_BATCH_SIZE", "50");
        env::set_var("LEADERBOARD_SIZE", "3");
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.write_batch_size, 50);
        assert_eq!(config.leaderboard_size, 3);

        for (key, value) in [
            ("WRITE_BATCH_SIZE", "lots"),
            ("WRITE_BATCH_SIZE", "0"),
            ("LEADERBOARD_SIZE", "-1"),
            ("LEADERBOARD_SIZE", "0"),
        ] {
            env::set_var(key, value);
            let err = Config::from_toml_str(SAMPLE).unwrap_err();
            let err = err.downcast_ref::<ConfigError>().unwrap();
            assert!(
                matches!(err, ConfigError::InvalidValue { key: k, .. } if *k == key),
                "{}={} gave {:?}",
                key,
                value,
                err
            );
            env::remove_var(key);
        }

        env::remove_var("TIMEZONE");
        env::remove_var("FETCH_BACKOFF");
        env::remove_var("DISCORD_TOKEN");
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert!(matches!(config.require_token(), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_channel_selection() {
        let all = GuildConfig {
            id: 1,
            all_channels: true,
            blocked_channels: vec![13],
            ..Default::default()
        };
        assert_eq!(all.select_channels(&[11, 12, 13, 11]), vec![11, 12]);

        let listed = GuildConfig {
            id: 2,
            channels: vec![21, 22],
            blocked_channels: vec![21],
            ..Default::default()
        };
        // The block-list only applies to `all_channels` guilds.
        assert_eq!(listed.select_channels(&[20, 21, 22]), vec![21, 22]);
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("UTC").unwrap(), chrono_tz::UTC);
        assert!(matches!(
            parse_timezone("Nowhere/City"),
            Err(ConfigError::UnknownTimezone(_))
        ));
    }
}
