use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::info;
use usage_protocol::{Report, DEFAULT_USER_ID};

use browser_collector::{
    buffer::{DurableStore, JsonFileStore, LocalBuffer, MemoryStore},
    clock::SystemClock,
    events::LineEventSource,
    runner,
    sync::{log_outcome, HttpClient, NetworkClient, SyncEngine, Tracking},
};

#[derive(Parser, Debug)]
#[command(name = "browser_collector", version)]
struct Args {
    /// Server base URL, e.g. http://127.0.0.1:3000
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server_url: String,

    /// Identity reported to the server.
    #[arg(long, default_value = DEFAULT_USER_ID)]
    user_id: String,

    /// File holding seconds not yet accepted by the server.
    #[arg(long, default_value = "./data/local-buffer.json")]
    buffer: PathBuf,

    /// Keep the buffer in memory only (lost on exit).
    #[arg(long, default_value_t = false)]
    ephemeral: bool,

    /// Sync interval (seconds).
    #[arg(long, default_value_t = 5 * 60)]
    sync_interval_seconds: u64,

    /// Per-request timeout (seconds). A timed-out sync is retried later.
    #[arg(long, default_value_t = 30)]
    request_timeout_seconds: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Track tab/focus events read as JSON lines from stdin (default).
    Run,
    /// Upload the buffer once and exit.
    Sync,
    /// Upload the buffer, then print the server's usage report.
    Report {
        /// Print the raw JSON report.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the seconds waiting in the buffer.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "browser_collector=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.ephemeral {
        execute(&args, MemoryStore::default()).await
    } else {
        let store = JsonFileStore::open(&args.buffer)?;
        info!("Buffer: {}", store.path().display());
        execute(&args, store).await
    }
}

async fn execute<S: DurableStore>(args: &Args, store: S) -> anyhow::Result<()> {
    let client = HttpClient::new(
        &args.server_url,
        Duration::from_secs(args.request_timeout_seconds.max(1)),
    )?;
    let engine = Arc::new(SyncEngine::new(
        Tracking::new(LocalBuffer::new(store)),
        client,
        Arc::new(SystemClock),
        &args.user_id,
    ));

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("Collector posting to {}", args.server_url);
            let source = LineEventSource::new(tokio::io::stdin());
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            runner::run(
                engine,
                source,
                Duration::from_secs(args.sync_interval_seconds.max(1)),
                shutdown,
            )
            .await
        }
        Command::Sync => {
            let result = engine.sync_queued().await;
            log_outcome("manual", &result);
            result.map(|_| ())
        }
        Command::Report { json } => {
            // Like the popup: push what we have first, show the report even
            // if that push failed.
            let result = engine.sync_queued().await;
            log_outcome("report", &result);
            let report = engine.client().get_report(engine.user_id()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_report(&report));
            }
            Ok(())
        }
        Command::Status => {
            let pending = engine.pending().await?;
            println!("{}", serde_json::to_string_pretty(&pending)?);
            Ok(())
        }
    }
}

const TOP_SITES: usize = 3;
const TOP_SITE_MIN_SECONDS: u64 = 60;

fn render_report(report: &Report) -> String {
    let mut out = String::new();
    out.push_str(&format!("Productive    {}\n", fmt_duration(report.productive)));
    out.push_str(&format!("Unproductive  {}\n", fmt_duration(report.unproductive)));
    out.push_str(&format!("Neutral       {}\n", fmt_duration(report.neutral)));
    out.push_str(&format!("Total         {}\n", fmt_duration(report.total())));
    out.push_str("\nMost used:\n");
    let top = report.top_domains(TOP_SITES, TOP_SITE_MIN_SECONDS);
    if top.is_empty() {
        out.push_str("  No data yet\n");
    }
    for (i, (domain, seconds)) in top.iter().enumerate() {
        out.push_str(&format!("  {}. {} {}\n", i + 1, domain, fmt_duration(*seconds)));
    }
    out
}

fn fmt_duration(seconds: u64) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    if h > 0 {
        format!("{h}h {m}m")
    } else {
        format!("{m}m")
    }
}
