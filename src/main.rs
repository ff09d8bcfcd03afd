//! Entrypoint: set up tracing, load configuration and exporter settings,
//! build the metric registry, and serve the scrape endpoint.
//!
//! This application uses a strongly-typed configuration (`Settings`) defined in `config.rs`,
//! which provides:
//!  - `server_bind`          – HTTP bind address for the scrape & health endpoints
//!  - `harperdb_url`         – HarperDB operations API
//!  - `aggregate_period`     – HarperDB analytics aggregation period
//!  - `settings_path`        – Where authorization & custom metric settings are kept

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use harperdb_exporter::client::OperationsClient;
use harperdb_exporter::collector::{Collector, Sources};
use harperdb_exporter::config::Settings;
use harperdb_exporter::metrics;
use harperdb_exporter::server::{self, AppState};
use harperdb_exporter::store::SettingsStore;

/// Application entrypoint for the HarperDB exporter.
///
/// **Workflow**:
/// 1. Initialise tracing/logging from `RUST_LOG` (or default to `info`).
/// 2. Load `Config.toml` (and apply any `APP__…` env-var overrides).
/// 3. Open (or initialise) the exporter settings file.
/// 4. Declare every series and wire the collector to the operations API.
/// 5. Serve `/metrics`, `/healthz` and `/settings` until Ctrl-C.
///
/// `SIGHUP` re-reads the exporter settings file without a restart.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ───────────────────────────────────────────────────────────────
    // 1. Initialise tracing / logging
    // ───────────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
    info!("Starting HarperDB exporter…");

    // ───────────────────────────────────────────────────────────────
    // 2. Load configuration
    // ───────────────────────────────────────────────────────────────
    let settings = Settings::new().context("loading configuration")?;
    info!(?settings, "Loaded configuration");

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid `server_bind` {:?}", settings.server_bind))?;

    // ───────────────────────────────────────────────────────────────
    // 3. Exporter settings (authorization, custom metrics)
    // ───────────────────────────────────────────────────────────────
    let store = Arc::new(SettingsStore::open(&settings.settings_path)?);
    info!(
        path = %store.path().display(),
        custom_metrics = store.snapshot().custom_metrics.len(),
        "Exporter settings ready"
    );
    #[cfg(unix)]
    spawn_reload_on_hangup(Arc::clone(&store));

    // ───────────────────────────────────────────────────────────────
    // 4. Registry, collaborators & collector
    // ───────────────────────────────────────────────────────────────
    let (mut registry, exporter) = metrics::build_registry()?;
    metrics::register_process_metrics(&mut registry)?;

    let client = Arc::new(OperationsClient::new(&settings)?);
    let collector = Collector::new(
        registry,
        exporter,
        Sources::from_one(client.clone()),
        store,
        settings.aggregate_period,
        settings.cluster_ping_timeout,
    );
    info!(
        url = %settings.harperdb_url,
        window_s = settings.aggregate_period.as_secs_f64() * 1.5,
        "Collector ready"
    );

    // ───────────────────────────────────────────────────────────────
    // 5. HTTP server
    // ───────────────────────────────────────────────────────────────
    let state = AppState {
        collector: Arc::new(collector),
        identity: client,
    };
    server::serve(addr, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await?;

    Ok(())
}

/// Re-read the settings file on every `SIGHUP`.
#[cfg(unix)]
fn spawn_reload_on_hangup(store: Arc<SettingsStore>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "SIGHUP handler unavailable; settings reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match store.reload() {
                Ok(()) => info!(
                    custom_metrics = store.snapshot().custom_metrics.len(),
                    "Reloaded exporter settings"
                ),
                Err(e) => error!(error = %e, "Failed to reload exporter settings; keeping the previous ones"),
            }
        }
    });
}
