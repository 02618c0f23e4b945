use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ytf_storage::connect_store;
use ytf_sync::{build_search, run_poller, FailurePolicy, IngestCycle, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "ytf")]
#[command(about = "Poll YouTube search results into a videos table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Search text (overrides YTF_QUERY).
    #[arg(long, global = true)]
    query: Option<String>,

    /// Database URL (overrides DATABASE_URL); postgres:// or sqlite:.
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Seconds between cycles (overrides YTF_POLL_INTERVAL_SECS).
    #[arg(long, global = true)]
    interval_secs: Option<u64>,

    /// `terminate` or `continue` on search failure (overrides YTF_FAILURE_POLICY).
    #[arg(long, global = true)]
    failure_policy: Option<FailurePolicy>,

    /// Serve search results from a saved search.list JSON response.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Poll forever, one cycle per interval.
    Poll,
    /// Run a single cycle now and print its report.
    Once,
    /// Create the videos table if it does not exist.
    Migrate,
}

impl Cli {
    fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(query) = &self.query {
            config.query = query.clone();
        }
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if let Some(secs) = self.interval_secs.filter(|s| *s > 0) {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = self.failure_policy {
            config.failure_policy = policy;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = cli.sync_config();
    info!(?config, fixture = ?cli.fixture, "ytf starting");

    match cli.command.unwrap_or(Commands::Poll) {
        Commands::Poll => {
            let store = connect_store(&config.database_url).await?;
            run_poller(&config, cli.fixture, store).await?;
        }
        Commands::Once => {
            let search = build_search(&config, cli.fixture).context("creating search client")?;
            let store = connect_store(&config.database_url).await?;
            let report = IngestCycle::new(search, store, config.search_query())
                .run()
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let store = connect_store(&config.database_url).await?;
            store
                .ensure_schema()
                .await
                .context("creating videos table")?;
            println!("videos table ready ({})", store.backend());
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ytf=info,ytf_sync=info,ytf_storage=info,ytf_adapters=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
