//! Correlation engine process entrypoint: load config and rules, open
//! incident persistence, and run the ingestor's poll loop until shutdown.
//! Exit codes: 0 normal, 2 config error, 4 storage corruption, 5
//! graceful-shutdown timeout.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use telemetry_config::EngineConfig;
use telemetry_engine::{
    CorrelationEngine, DecayParams, HttpLogSource, Ingestor, PersistenceStore, RuleRegistry,
    WindowConfig,
};

const SCAN_LIMIT: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DECAY_TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "telemetry-engined", about = "Telemetry fabric correlation engine")]
struct Args {
    /// Path to the engine's TOML configuration file.
    #[arg(long, env = "TELEMETRY_ENGINE_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    telemetry_observability::init_tracing();

    let config = match EngineConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load engine configuration");
            std::process::exit(2);
        }
    };

    let rules = match RuleRegistry::load(&config.rules_path) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "failed to load rule registry");
            std::process::exit(2);
        }
    };

    let persistence = match PersistenceStore::connect(&config.incident_db_path).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "failed to open incident store, storage unrecoverable");
            std::process::exit(4);
        }
    };

    let engine = CorrelationEngine::new(
        WindowConfig {
            horizon_ns: (config.window_seconds as i64) * 1_000_000_000,
            max_events: config.max_events_in_window,
        },
        rules,
        DecayParams {
            start_ns: (config.decay.start_seconds as i64) * 1_000_000_000,
            full_ns: (config.decay.full_seconds as i64) * 1_000_000_000,
        },
        persistence,
    );

    let source = HttpLogSource::new(config.broker_addr.clone());
    let ingestor = Ingestor::new(source, &config.cursor_path, engine, SCAN_LIMIT);

    tracing::info!(broker = %config.broker_addr, "telemetry-engined running");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to wait on shutdown signal");
        }
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let mut poll_interval = tokio::time::interval(POLL_INTERVAL);
    let mut decay_interval = tokio::time::interval(DECAY_TICK_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = poll_interval.tick() => {
                match ingestor.run_once().await {
                    Ok(n) if n > 0 => tracing::debug!(processed = n, "ingestor processed records"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "ingestor run failed"),
                }
                if let Err(e) = ingestor.engine().poll_rule_reload() {
                    tracing::error!(error = %e, "rule registry reload failed");
                }
            }
            _ = decay_interval.tick() => {
                ingestor.engine().decay_tick();
            }
        }
    }

    tracing::info!("telemetry-engined shut down cleanly");
}
