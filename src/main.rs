use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use slotdesk::engine::Engine;
use slotdesk::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use slotdesk::wire;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Most connections the server will hold open. The drain waits for all
/// permits in one `acquire_many`, which counts in `u32`.
const MAX_CONNECTIONS_LIMIT: usize = 1 << 20;

/// Server settings, all from `SLOTDESK_*` environment variables.
struct Config {
    bind: String,
    port: u16,
    data_dir: PathBuf,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    slot_capacity: u32,
    metrics_port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparseable {name}={raw}");
            None
        }
    }
}

/// The configured connection cap, kept within `1..=MAX_CONNECTIONS_LIMIT`.
fn connection_limit(requested: Option<usize>) -> usize {
    match requested {
        None => DEFAULT_MAX_CONNECTIONS,
        Some(n) if (1..=MAX_CONNECTIONS_LIMIT).contains(&n) => n,
        Some(n) => {
            let clamped = n.clamp(1, MAX_CONNECTIONS_LIMIT);
            warn!("SLOTDESK_MAX_CONNECTIONS={n} out of range, using {clamped}");
            clamped
        }
    }
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: env_var("SLOTDESK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: env_parse("SLOTDESK_PORT").unwrap_or(5433),
            data_dir: env_var("SLOTDESK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: env_var("SLOTDESK_PASSWORD").unwrap_or_else(|| "slotdesk".into()),
            max_connections: connection_limit(env_parse("SLOTDESK_MAX_CONNECTIONS")),
            compact_threshold: env_parse("SLOTDESK_COMPACT_THRESHOLD").unwrap_or(1000),
            slot_capacity: env_parse("SLOTDESK_SLOT_CAPACITY").unwrap_or(5),
            metrics_port: env_parse("SLOTDESK_METRICS_PORT"),
            tls_cert: env_var("SLOTDESK_TLS_CERT"),
            tls_key: env_var("SLOTDESK_TLS_KEY"),
        }
    }

    fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotdesk.wal")
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotdesk::observability::init(config.metrics_port);
    let tls = slotdesk::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(config.wal_path(), config.compact_threshold)?);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "slotdesk listening on {addr} (data_dir {}, max_connections {}, slot_capacity {}, tls {})",
        config.data_dir.display(),
        config.max_connections,
        config.slot_capacity,
        if tls.is_some() { "on" } else { "off" }
    );

    let permits = Arc::new(Semaphore::new(config.max_connections));
    serve(listener, &engine, &config, tls, &permits, shutdown_signal()?).await;
    drain(&permits, config.max_connections).await;

    if let Err(e) = engine.compact_wal() {
        warn!("final WAL compaction failed: {e}");
    }
    info!("slotdesk stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
    })
}

/// Accept connections until `shutdown` fires. Connections beyond the
/// permit count are closed immediately.
async fn serve(
    listener: TcpListener,
    engine: &Arc<Engine>,
    config: &Config,
    tls: Option<TlsAcceptor>,
    permits: &Arc<Semaphore>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        let (socket, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, no longer accepting");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept failed: {e}");
                    continue;
                }
            },
        };

        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!("at {} connections, refusing {peer}", config.max_connections);
            metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        info!("client connected from {peer}");
        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);

        let engine = engine.clone();
        let password = config.password.clone();
        let capacity = config.slot_capacity;
        let tls = tls.clone();
        tokio::spawn(async move {
            let result = wire::process_connection(socket, engine, password, capacity, tls).await;
            if let Err(e) = result {
                error!("connection from {peer} ended with error: {e}");
            }
            metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
            drop(permit);
        });
    }
}

/// Wait for every permit to come back, giving up after `DRAIN_TIMEOUT`.
async fn drain(permits: &Semaphore, max_connections: usize) {
    let in_flight = || max_connections - permits.available_permits();
    if in_flight() == 0 {
        return;
    }
    info!("waiting for {} open connections", in_flight());

    let Ok(all) = u32::try_from(max_connections) else {
        warn!("cannot wait on {max_connections} permits, not draining");
        return;
    };
    let all_back = async {
        let _ = permits.acquire_many(all).await;
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, all_back).await {
        Ok(()) => info!("all connections closed"),
        Err(_) => warn!("gave up waiting, {} connections still open", in_flight()),
    }
}
