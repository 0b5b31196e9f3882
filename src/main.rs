use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use feedtide::config::Config;
use feedtide::poller::{PollReport, Poller};
use feedtide::storage::Database;
use feedtide::util::validate_feed_url;

/// Get the config directory path (~/.config/feedtide/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedtide"))
}

#[derive(Parser, Debug)]
#[command(name = "feedtide", about = "Adaptive RSS/Atom/JSON feed poller")]
struct Args {
    /// Import a feed URL as a new source
    #[arg(long, value_name = "URL")]
    add: Option<String>,

    /// Name for the source imported with --add
    #[arg(long, requires = "add")]
    name: Option<String>,

    /// Poll one source by feed URL
    #[arg(long, value_name = "URL", conflicts_with_all = ["all", "watch"])]
    url: Option<String>,

    /// Poll every live source, due or not
    #[arg(long, conflicts_with = "watch")]
    all: bool,

    /// Ignore cache validators and ask for a fresh copy
    #[arg(long)]
    no_cache: bool,

    /// Keep polling due batches every SECS seconds
    #[arg(long, value_name = "SECS")]
    watch: Option<u64>,

    /// Re-enable a source that was disabled
    #[arg(long, value_name = "URL")]
    reset: Option<String>,

    /// Config file (default ~/.config/feedtide/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn print_reports(reports: &[PollReport]) {
    for report in reports {
        println!(
            "[{}] {} {} (+{} new, {})",
            report.source_id,
            report.status_code,
            report.last_result.as_deref().unwrap_or("-"),
            report.new_entries,
            if report.live { "live" } else { "disabled" },
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        println!("Created config directory: {}", config_dir.display());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from '{}'", config_path.display()))?;

    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| config_dir.join("feeds.db"));
    let db_path_str = db_path
        .to_str()
        .context("Database path contains invalid UTF-8")?;
    let db = Database::open(db_path_str)
        .await
        .with_context(|| format!("Failed to open database at '{}'", db_path.display()))?;

    if let Some(url) = &args.add {
        let url = validate_feed_url(url).with_context(|| format!("Cannot add '{url}'"))?;
        let id = db.insert_source(url.as_str(), args.name.as_deref()).await?;
        println!("Added source {id}: {url}");
        return Ok(());
    }

    if let Some(url) = &args.reset {
        if !db.reset_source(url).await? {
            bail!("No source with feed URL '{url}'");
        }
        println!("Re-enabled {url}");
        return Ok(());
    }

    let poller = Poller::new(db.clone(), &config).context("Failed to set up poller")?;

    if let Some(url) = &args.url {
        let source = db
            .get_source_by_url(url)
            .await?
            .with_context(|| format!("No source with feed URL '{url}'"))?;
        let report = poller.poll_source(source.id, args.no_cache).await?;
        print_reports(std::slice::from_ref(&report));
        return Ok(());
    }

    if args.all {
        print_reports(&poller.poll_all(args.no_cache).await?);
        return Ok(());
    }

    match args.watch {
        None => print_reports(&poller.poll_due(args.no_cache).await?),
        Some(secs) => {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
            loop {
                ticker.tick().await;
                match poller.poll_due(args.no_cache).await {
                    Ok(reports) => print_reports(&reports),
                    Err(e) => tracing::error!(error = %e, "Batch failed"),
                }
            }
        }
    }

    Ok(())
}
