use anyhow::{Context, Result};
use clap::Parser;
use confluence_bot::api::BinanceClient;
use confluence_bot::feed::MarketDataFeed;
use confluence_bot::lifecycle::SignalLifecycleManager;
use confluence_bot::pipeline::{ConfluenceValidator, TimeframeFanout};
use confluence_bot::scheduler::CycleScheduler;
use confluence_bot::{store, Settings, TrendAnalyzer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Multi-timeframe confluence signal pipeline
#[derive(Parser, Debug)]
#[command(name = "confluence-bot", version)]
struct Args {
    /// Settings file (TOML); missing file falls back to defaults and env
    #[arg(short, long, default_value = "confluence.toml")]
    config: String,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();

    tracing::info!("🚀 Confluence bot starting");

    let settings = Settings::load(Some(&args.config))
        .with_context(|| format!("Failed to load settings from {}", args.config))?;

    tracing::info!("📊 Configuration:");
    tracing::info!("  Instruments: {}", settings.instruments.join(", "));
    tracing::info!(
        "  Horizons: {}",
        settings
            .horizons
            .iter()
            .map(|h| h.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    tracing::info!("  Cycle: every {}s", settings.schedule.cycle_period_secs);
    tracing::info!(
        "  Confluence: threshold {}%, min {} horizons",
        settings.confluence.threshold,
        settings.confluence.min_setup_horizons
    );
    tracing::info!("  Store: {:?}", settings.store.backend);

    let feed_config = settings.feed_config();
    let client = BinanceClient::new(&feed_config).context("Failed to build market data client")?;
    let feed = MarketDataFeed::new(Arc::new(client), feed_config);

    // an unreachable store is the one fatal startup condition
    let store = store::connect(&settings.store)
        .await
        .context("Failed to open signal store")?;

    let fanout = TimeframeFanout::new(
        feed,
        Arc::new(TrendAnalyzer::default()),
        settings.feed.history_limit,
    );
    let scheduler = CycleScheduler::new(
        settings.scheduler_config(),
        fanout,
        ConfluenceValidator::new(settings.confluence_config()),
        SignalLifecycleManager::new(store),
    );

    let shutdown = CancellationToken::new();

    if args.once {
        let report = scheduler.run_cycle(&shutdown).await;
        tracing::info!("👋 Single cycle done: {} published", report.published);
        return Ok(());
    }

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("⚠️  Received Ctrl+C, finishing current instrument...");
                ctrl_c.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    tracing::info!("Press Ctrl+C to stop...");
    scheduler.run(shutdown).await;

    tracing::info!("👋 Confluence bot stopped");
    Ok(())
}

fn setup_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("confluence_bot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
