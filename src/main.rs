use anyhow::Context;
use chrono::{Days, NaiveDate};
use clap::{Parser, Subcommand};
use discolog::aggregate::{
    calendar, targets_from_config, AggregationEngine, AggregationSettings, PassSummary,
};
use discolog::config::Config;
use discolog::db::Database;
use discolog::fetcher::{DiscordSource, FetchSettings, Fetcher};
use discolog::notifier::{DiscordSink, Notifier};
use discolog::pages;
use discolog::report::Reporter;
use serenity::all::Http;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "discolog")]
#[command(about = "Archive Discord message history and report daily activity")]
#[command(version)]
struct Cli {
    /// Guild config file (defaults to DISCOLOG_CONFIG or discolog.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull new messages and metadata for the configured guilds
    Fetch,
    /// Recompute daily and cumulative counts
    Aggregate {
        /// Discard stored counts and rebuild from the first message
        #[arg(long)]
        reset: bool,
        /// Only this channel
        #[arg(long)]
        channel: Option<u64>,
    },
    /// Post leaderboards for a day
    Notify {
        /// YYYY-MM-DD, defaults to yesterday in the report timezone
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Write the static pages
    Pages {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Fetch, aggregate, write pages and notify
    Run {
        #[arg(long)]
        reset: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env(cli.config.as_deref())?;
    info!(
        "Loaded {} guilds from {} (timezone {})",
        config.guilds.len(),
        config.config_path.display(),
        config.timezone
    );

    let db = Database::new(&config).context("Failed to open database")?;
    db.execute_init()?;

    match cli.command {
        Command::Fetch => {
            fetch(&config, &db).await?;
        }
        Command::Aggregate { reset, channel } => match channel {
            Some(channel_id) => aggregate_channel(&config, &db, channel_id, reset).await?,
            None => {
                aggregate(&config, &db, reset).await?;
            }
        },
        Command::Notify { date } => {
            notify(&config, &db, date).await?;
        }
        Command::Pages { out } => {
            write_pages(&config, &db, out).await?;
        }
        Command::Run { reset } => {
            fetch(&config, &db).await?;
            let summary = aggregate(&config, &db, reset).await?;
            if summary.failed > 0 {
                error!(
                    "{} channels failed to aggregate; their counts were left untouched",
                    summary.failed
                );
            }
            write_pages(&config, &db, None).await?;
            notify(&config, &db, None).await?;
        }
    }

    Ok(())
}

fn http(config: &Config) -> anyhow::Result<Arc<Http>> {
    Ok(Arc::new(Http::new(config.require_token()?)))
}

async fn fetch(config: &Config, db: &Database) -> anyhow::Result<()> {
    let source = Arc::new(DiscordSource::new(http(config)?));
    let fetcher = Fetcher::new(db.clone(), source, FetchSettings::from_config(config));
    fetcher.run(&config.guilds).await?;
    Ok(())
}

async fn aggregate(config: &Config, db: &Database, reset: bool) -> anyhow::Result<PassSummary> {
    let engine = AggregationEngine::new(db.clone(), AggregationSettings::from_config(config));
    let guilds = config.guilds.clone();
    let db = db.clone();
    let summary = tokio::task::spawn_blocking(move || -> anyhow::Result<PassSummary> {
        let targets = targets_from_config(&db, &guilds)?;
        Ok(engine.run_pass(&targets, reset))
    })
    .await??;
    Ok(summary)
}

async fn aggregate_channel(
    config: &Config,
    db: &Database,
    channel_id: u64,
    reset: bool,
) -> anyhow::Result<()> {
    let engine = AggregationEngine::new(db.clone(), AggregationSettings::from_config(config));
    let report = tokio::task::spawn_blocking(move || engine.compute_channel(channel_id, reset))
        .await??;
    info!(
        "Channel {}: {} channel rows, {} users, {} user rows",
        channel_id,
        report.outcome.rows_written(),
        report.users,
        report.user_rows
    );
    Ok(())
}

async fn write_pages(config: &Config, db: &Database, out: Option<PathBuf>) -> anyhow::Result<()> {
    let reporter = Reporter::new(db.clone());
    let out = out.unwrap_or_else(|| config.pages_dir.clone());
    tokio::task::spawn_blocking(move || pages::write_site(&reporter, &out)).await??;
    Ok(())
}

async fn notify(config: &Config, db: &Database, date: Option<NaiveDate>) -> anyhow::Result<()> {
    let date = match date {
        Some(date) => date,
        None => calendar::today(&config.timezone)
            .checked_sub_days(Days::new(1))
            .context("no day before today")?,
    };
    let sink = Arc::new(DiscordSink::new(http(config)?));
    let notifier = Notifier::from_config(Reporter::new(db.clone()), sink, config);
    notifier.notify(date).await?;
    Ok(())
}
