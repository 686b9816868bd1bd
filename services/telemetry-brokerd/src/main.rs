//! Broker process entrypoint: load config, open the trust map and broker
//! log, and serve the mTLS admission surface until shutdown. Exit
//! codes: 0 normal, 2 config error, 3 TLS/trust load failure, 4
//! storage corruption, 5 graceful-shutdown timeout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use telemetry_broker::{
    AdmissionPipeline, AppState, BrokerLog, BrokerStats, DedupCache, Governor, PeerCnAcceptor,
};
use telemetry_config::BrokerConfig;
use telemetry_crypto::TrustMap;
use telemetry_types::Severity;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "telemetry-brokerd", about = "Telemetry fabric ingestion broker")]
struct Args {
    /// Path to the broker's TOML configuration file.
    #[arg(long, env = "TELEMETRY_BROKER_CONFIG")]
    config: PathBuf,
}

fn parse_severity_cutoff(s: &str) -> Severity {
    match s.to_ascii_uppercase().as_str() {
        "INFO" => Severity::Info,
        "LOW" => Severity::Low,
        "MEDIUM" => Severity::Medium,
        "HIGH" => Severity::High,
        "CRITICAL" => Severity::Critical,
        other => {
            tracing::warn!(value = other, "unrecognized shed_severity_cutoff, defaulting to LOW");
            Severity::Low
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    telemetry_observability::init_tracing();

    let config = match BrokerConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load broker configuration");
            std::process::exit(2);
        }
    };

    let trust_map = match TrustMap::from_file(&config.trust_map_path) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            tracing::error!(error = %e, "failed to load broker trust map");
            std::process::exit(3);
        }
    };

    let tls_config = match telemetry_broker::load_server_config(
        &config.tls_cert_path,
        &config.tls_key_path,
        &config.ca_cert_path,
    )
    .await
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load broker tls material");
            std::process::exit(3);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        tracing::error!(error = %e, "failed to create broker log directory");
        std::process::exit(4);
    }
    let log = match BrokerLog::open(&config.log_dir.join("broker.log")) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            tracing::error!(error = %e, "failed to open broker log, storage unrecoverable");
            std::process::exit(4);
        }
    };

    let governor = Arc::new(Governor::new(
        config.governor.soft_inflight,
        config.governor.hard_inflight,
        parse_severity_cutoff(&config.governor.shed_severity_cutoff),
    ));

    let pipeline = Arc::new(AdmissionPipeline {
        trust_map,
        dedup: Arc::new(DedupCache::new()),
        log,
        governor,
        max_envelope_bytes: config.max_envelope_bytes,
        stats: BrokerStats::default(),
    });

    let app = telemetry_broker::router(AppState { pipeline });

    let addr: std::net::SocketAddr = match config.listen_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            tracing::error!(error = %e, addr = %config.listen_addr, "invalid listen_addr");
            std::process::exit(2);
        }
    };

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to wait on shutdown signal");
        }
        tracing::info!("shutdown requested, draining in-flight connections");
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    tracing::info!(addr = %config.listen_addr, "telemetry-brokerd running");

    if let Err(e) = axum_server::bind(addr)
        .acceptor(PeerCnAcceptor::new(tls_config))
        .handle(handle)
        .serve(app.into_make_service())
        .await
    {
        tracing::error!(error = %e, "broker server exited with error");
        std::process::exit(5);
    }
    tracing::info!("telemetry-brokerd shut down cleanly");
}
