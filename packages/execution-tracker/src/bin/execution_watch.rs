//! Watch a scraping execution from the terminal.
//!
//! Attaches to (or launches) an execution and prints every published view
//! until the execution reaches a terminal status or the process is interrupted.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use execution_tracker::channel::NatsTransport;
use execution_tracker::{ExecutionId, ExecutionTracker, ExecutionView, TrackerConfig, TrackerHandle};
use scrape_api_client::{ScrapeApiClient, StartExecutionInput};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "execution-watch")]
#[command(about = "Follow a remote scraping execution until it finishes")]
struct Cli {
    /// Print every view as a JSON line instead of a summary
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track an execution that already exists
    Attach { execution_id: String },

    /// Start an execution and track it
    Launch {
        actor_id: String,
        /// Actor input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        #[arg(long)]
        max_items: Option<u64>,
    },
}

/// Process-level settings, separate from tracker tuning.
struct AppConfig {
    nats_url: String,
    scrape_api_url: Option<String>,
    scrape_api_token: String,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            nats_url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            scrape_api_url: env::var("SCRAPE_API_URL").ok(),
            scrape_api_token: env::var("SCRAPE_API_TOKEN").context("SCRAPE_API_TOKEN must be set")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,execution_tracker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let app = AppConfig::from_env()?;
    let config = TrackerConfig::from_env().context("Failed to load tracker configuration")?;

    let client = match &app.scrape_api_url {
        Some(url) => ScrapeApiClient::with_base_url(url.as_str(), app.scrape_api_token.clone()),
        None => ScrapeApiClient::new(app.scrape_api_token.clone()),
    };
    let transport = NatsTransport::connect(&app.nats_url)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", app.nats_url))?;

    let tracker = ExecutionTracker::new(config, Arc::new(transport), Arc::new(client.clone()))
        .context("Invalid tracker configuration")?;

    let handle = match cli.command {
        Commands::Attach { execution_id } => tracker.attach(ExecutionId::new(execution_id)).await,
        Commands::Launch {
            actor_id,
            input,
            max_items,
        } => {
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let mut request = StartExecutionInput::new(actor_id, input);
            if let Some(max_items) = max_items {
                request = request.with_max_items(max_items);
            }
            tracker.launch(&client, &request).await?
        }
    };

    tracing::info!(execution_id = %handle.execution_id(), "watching execution");
    let finished = watch(&handle, cli.json).await?;
    handle.shutdown().await;

    if let Some(view) = finished {
        if let Some(reason) = &view.failure_reason {
            anyhow::bail!("execution {} failed: {}", view.execution_id, reason);
        }
    }
    Ok(())
}

/// Print views until the execution is terminal and settled, or Ctrl-C.
///
/// Waiting for `settled` lets the final snapshot add documents the channel
/// missed before the tracker shuts down. Returns the final view.
async fn watch(handle: &TrackerHandle, json: bool) -> Result<Option<Arc<ExecutionView>>> {
    let mut views = handle.subscribe();
    let current = handle.current();
    print_view(&current, json)?;
    if is_final(&current) {
        return Ok(Some(current));
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                return Ok(None);
            }
            view = views.next() => match view {
                Some(view) => {
                    print_view(&view, json)?;
                    if is_final(&view) {
                        return Ok(Some(view));
                    }
                }
                None => return Ok(None),
            },
        }
    }
}

fn is_final(view: &ExecutionView) -> bool {
    view.is_terminal() && view.settled
}

fn print_view(view: &ExecutionView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(view)?);
        return Ok(());
    }

    let counters = &view.progress.counters;
    let total = counters
        .items_total
        .map(|t| t.to_string())
        .unwrap_or_else(|| "?".to_string());
    println!(
        "[{}] {} {}/{} processed, {} failed, {} documents ({})",
        view.execution_id,
        view.status,
        counters.items_processed,
        total,
        counters.items_failed,
        view.documents.len(),
        view.connection_state,
    );
    if let Some(line) = view.log_lines.back() {
        println!("    {}", line.line);
    }
    Ok(())
}
