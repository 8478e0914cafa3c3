//! Run command implementation.

use crate::server::{start_server, ServerState};
use anyhow::{anyhow, Result};
use persister_core::engine::Persister;
use persister_core::metrics::Registry;
use persister_core::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Values given on the command line that replace the configuration file's.
#[derive(Debug, Default)]
pub struct Overrides {
    pub bootstrap_servers: Option<String>,
    pub topic: Option<String>,
    pub consumer_group: Option<String>,
    pub batch_size: Option<usize>,
}

impl Overrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(servers) = self.bootstrap_servers {
            config.kafka.bootstrap_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(topic) = self.topic {
            config.kafka.topic = topic;
        }
        if let Some(group) = self.consumer_group {
            config.kafka.consumer_group = group;
        }
        if let Some(batch_size) = self.batch_size {
            config.kafka.batch_size = batch_size;
        }
    }
}

/// How the consume loop ended when it ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// Source exhausted or SIGTERM
    Completed,
    /// SIGINT
    Interrupted,
}

/// Run the persister until a signal or a fatal error.
pub async fn run(mut config: Config, overrides: Overrides) -> Result<Stopped> {
    overrides.apply(&mut config);
    config.validate()?;

    info!(
        topic = %config.kafka.topic,
        group = %config.kafka.consumer_group,
        batch_size = config.kafka.batch_size,
        "Starting persister"
    );

    let mut persister = Persister::from_config(&config, Registry::new())?;
    let shutdown_tx = persister.shutdown_signal();

    let server_state = Arc::new(ServerState {
        health: Arc::clone(persister.health()),
        metrics: Arc::clone(persister.metrics()),
    });
    tokio::spawn(start_server(
        server_state,
        config.monitoring.health_port,
        config.monitoring.metrics_port,
        shutdown_tx.subscribe(),
    ));

    let interrupted = Arc::new(AtomicBool::new(false));
    tokio::spawn(wait_for_signal(shutdown_tx.clone(), Arc::clone(&interrupted)));

    // Rebalance callbacks block in place, so the loop must run on a worker
    let outcome = tokio::spawn(async move { persister.run().await })
        .await
        .map_err(|e| anyhow!("Consume loop task failed: {}", e))?;

    // Stops the HTTP servers
    let _ = shutdown_tx.send(());
    outcome?;

    info!("Persister stopped");
    if interrupted.load(Ordering::SeqCst) {
        Ok(Stopped::Interrupted)
    } else {
        Ok(Stopped::Completed)
    }
}

/// Wait for SIGINT or SIGTERM and request a graceful shutdown.
async fn wait_for_signal(shutdown_tx: broadcast::Sender<()>, interrupted: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                        interrupted.store(true, Ordering::SeqCst);
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler, listening for SIGINT only");
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                interrupted.store(true, Ordering::SeqCst);
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
        interrupted.store(true, Ordering::SeqCst);
    }

    let _ = shutdown_tx.send(());
}
