use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use market_gateway::archive::{Archiver, FileArchiveSink};
use market_gateway::config::GatewayConfig;
use market_gateway::core::ConnectionId;
use market_gateway::feed::{FeedIngestor, WebSocketFeedServer};
use market_gateway::gateway::{SignalOrchestrator, WorkstationServer};
use market_gateway::health::{
    ConnectionRole, HealthMonitor, ReconnectError, ReconnectSupervisor, Reconnector,
};
use market_gateway::store::MarketDataStore;

/// Routes a reconnection to the server that owns the connection's socket
struct ServerReconnector {
    feeds: Arc<WebSocketFeedServer>,
    workstations: Arc<WorkstationServer>,
}

#[async_trait]
impl Reconnector for ServerReconnector {
    async fn reconnect(&self, id: &ConnectionId, role: ConnectionRole) -> Result<(), ReconnectError> {
        match role {
            ConnectionRole::FeedSource => self.feeds.reconnect(id, role).await,
            ConnectionRole::SignalConsumer => self.workstations.reconnect(id, role).await,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::load().context("loading gateway configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> Result<()> {
    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        tracing::info!("metrics exported on {}", addr);
    }

    let store = Arc::new(MarketDataStore::new(config.store.clone()));
    let health = Arc::new(HealthMonitor::new(config.health.clone()));

    let ingestor = Arc::new(FeedIngestor::new(Arc::clone(&store), Arc::clone(&health)));
    let feeds = Arc::new(WebSocketFeedServer::new(ingestor, config.feed.listen_addr));

    let orchestrator = Arc::new(SignalOrchestrator::new(
        Arc::clone(&health),
        config.orchestrator.clone(),
    ));
    let workstations = Arc::new(WorkstationServer::new(
        orchestrator,
        config.orchestrator.listen_addr,
        config.orchestrator.outbound_capacity,
    ));

    let supervisor = Arc::new(ReconnectSupervisor::new(
        Arc::clone(&health),
        Arc::new(ServerReconnector {
            feeds: Arc::clone(&feeds),
            workstations: Arc::clone(&workstations),
        }),
    ));

    let archiver = Arc::new(Archiver::new(
        Arc::clone(&store),
        Arc::new(FileArchiveSink::new(
            config.archive.directory.clone(),
            config.archive.compression,
        )),
        config.archive.clone(),
    ));

    let watchdog = health.spawn_watchdog();
    let reconnects = supervisor.spawn();
    let archive_schedule = archiver.spawn_schedule(config.archive.interval());
    let feed_server = tokio::spawn(Arc::clone(&feeds).start());
    let workstation_server = tokio::spawn(Arc::clone(&workstations).start());

    tracing::info!(version = market_gateway::VERSION, "market gateway started");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            tracing::info!("shutdown requested");
        }
        result = feed_server => {
            result?.context("feed server stopped")?;
        }
        result = workstation_server => {
            result?.context("workstation server stopped")?;
        }
    }

    watchdog.abort();
    reconnects.abort();
    archive_schedule.abort();

    match archiver.run_once().await {
        Ok(batch) => tracing::info!(records = batch.len(), "final archive batch handed off"),
        Err(err) => tracing::error!(%err, pending = archiver.pending(), "final archive run failed"),
    }
    Ok(())
}
