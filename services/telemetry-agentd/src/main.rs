//! Agent process entrypoint: load config, open the WAL, start the
//! collection scheduler and publisher, and run until shutdown. Exit
//! codes: 0 normal, 2 config error, 3 signing-key load failure, 4
//! storage corruption, 5 graceful-shutdown timeout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use telemetry_agent::{BrokerClient, HttpBrokerClient, Publisher, Scheduler};
use telemetry_config::AgentConfig;
use telemetry_crypto::Signer;
use telemetry_wal::Wal;

mod host_collector;

use host_collector::LoadAverageCollector;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "telemetry-agentd", about = "Telemetry fabric collection agent")]
struct Args {
    /// Path to the agent's TOML configuration file.
    #[arg(long, env = "TELEMETRY_AGENT_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    telemetry_observability::init_tracing();

    let config = match AgentConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load agent configuration");
            std::process::exit(2);
        }
    };

    let signer = match Signer::from_hex_file(&config.signing_key_path) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to load agent signing key");
            std::process::exit(3);
        }
    };

    let wal = match Wal::open(&config.wal_path, config.wal_max_bytes) {
        Ok(w) => Arc::new(w),
        Err(e) => {
            tracing::error!(error = %e, "failed to open agent wal");
            std::process::exit(4);
        }
    };

    let mut scheduler = Scheduler::new(config.device_id.clone(), Arc::new(signer), wal.clone());
    for source in &config.sources {
        scheduler.add_source(
            Arc::new(LoadAverageCollector::new(&source.name)),
            source.clone(),
        );
    }

    let client: Arc<dyn BrokerClient> =
        Arc::new(HttpBrokerClient::new(&config.broker_addr, PUBLISH_TIMEOUT));
    let publisher = Arc::new(Publisher::new(
        wal,
        client,
        config.publisher.max_batch,
        config.publisher.retry_min_ms,
        config.publisher.retry_max_ms,
        config.publisher.circuit_threshold,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = scheduler.spawn_all(shutdown_rx.clone());
    handles.push(tokio::spawn(publisher.run(shutdown_rx)));

    tracing::info!(
        device_id = %config.device_id,
        broker = %config.broker_addr,
        sources = config.sources.len(),
        "telemetry-agentd running"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to wait on shutdown signal");
    }
    tracing::info!("shutdown requested, draining in-flight work");
    let _ = shutdown_tx.send(true);

    let drain = futures::future::join_all(handles);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::error!("graceful shutdown timed out");
        std::process::exit(5);
    }
    tracing::info!("telemetry-agentd shut down cleanly");
}
