use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use timetable_core::{
    api::{router, AppState},
    clock::{Clock, SystemClock},
    store::{KeyValueStore, RemoteStore, SqliteStore},
    AlertBoard, RuntimeConfig, Session, TimetableService,
};
use tracing::info;

const DEFAULT_PORT: u16 = 17700;

#[derive(Parser, Debug)]
#[command(name = "timetable_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17700
    /// - ip (implies port 17700), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:17700")]
    listen: String,

    /// SQLite database path (local-device persistence).
    #[arg(long, default_value = "./data/timetable.db")]
    db: PathBuf,

    /// Base URL of a PostgREST-compatible backend (e.g. a Supabase project).
    ///
    /// When set together with --remote-key, timetables are stored in the
    /// `timetable_kv` table there instead of the local SQLite file.
    #[arg(long, env = "TIMETABLE_REMOTE_URL")]
    remote_url: Option<String>,

    /// API key for --remote-url.
    #[arg(long, env = "TIMETABLE_REMOTE_KEY", hide_env_values = true)]
    remote_key: Option<String>,

    /// Reminder check interval (seconds).
    #[arg(long, default_value_t = 15)]
    check_seconds: u64,

    /// Repeat interval of an active alert (milliseconds).
    #[arg(long, default_value_t = 2_400)]
    alert_repeat_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timetable_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = RuntimeConfig {
        check_interval: Duration::from_secs(args.check_seconds.max(1)),
        alert_repeat: Duration::from_millis(args.alert_repeat_ms.max(100)),
    };

    let store: Box<dyn KeyValueStore> = match (&args.remote_url, &args.remote_key) {
        (Some(url), Some(key)) => {
            info!("Storage: remote {url}");
            Box::new(RemoteStore::connect(url, key).await?)
        }
        (Some(_), None) | (None, Some(_)) => {
            anyhow::bail!("--remote-url and --remote-key must be given together");
        }
        (None, None) => {
            if let Some(parent) = args.db.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!("Storage: {}", args.db.display());
            Box::new(SqliteStore::open(&args.db)?)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let board = Arc::new(AlertBoard::new());
    let session = Session::open(store, clock.now());
    info!("Active user: {}", session.identity().username);

    let service = TimetableService::start(session, clock, board.clone(), config).await;
    let app = router(AppState { service, board });

    let addr = parse_listen(&args.listen)?;
    info!("Timetable listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listen_accepts_documented_forms() {
        assert_eq!(
            parse_listen("0.0.0.0:9000").unwrap(),
            "0.0.0.0:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(parse_listen("127.0.0.1").unwrap().port(), DEFAULT_PORT);
        assert_eq!(parse_listen("localhost:8080").unwrap().port(), 8080);
        assert_eq!(parse_listen("localhost").unwrap().port(), DEFAULT_PORT);
        assert!(parse_listen("localhost:http").is_err());
        assert!(parse_listen("example.com:80").is_err());
    }
}
