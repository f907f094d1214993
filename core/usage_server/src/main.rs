use axum::http::Method;
use anyhow::Context;
use clap::Parser;
use rusqlite::Connection;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

mod api;
mod report;
mod store;

const DEFAULT_PORT: u16 = 3000;

#[derive(Parser, Debug)]
#[command(name = "usage_server", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:3000
    /// - ip (implies port 3000), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: String,

    /// Overrides the port of --listen.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// SQLite database path.
    #[arg(long, default_value = "./data/usage-server.db")]
    db: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "usage_server=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(&args.db)?;
    store::init_db(&conn)?;

    let state = api::AppState {
        conn: Arc::new(Mutex::new(conn)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = api::router(state).layer(cors);

    let mut addr = parse_listen(&args.listen)?;
    if let Some(port) = args.port {
        addr.set_port(port);
    }
    info!("Server listening on http://{addr}");
    info!("DB: {}", args.db.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received, draining connections");
        })
        .await?;
    Ok(())
}

/// `ip:port`, a bare `ip`, `localhost` or `localhost:port`. Without a port
/// the server uses [`DEFAULT_PORT`].
fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    // A second ':' in the host part means a bare IPv6 address, not a port.
    let (host, port) = match input.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (input, None),
    };
    let ip = match host {
        "localhost" => IpAddr::from([127, 0, 0, 1]),
        other => other
            .parse::<IpAddr>()
            .with_context(|| format!("invalid --listen '{input}': unknown host '{other}'"))?,
    };
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .with_context(|| format!("invalid --listen '{input}': bad port '{port}'"))?,
        None => DEFAULT_PORT,
    };
    Ok(SocketAddr::new(ip, port))
}
