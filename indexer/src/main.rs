//! mixscope-indexer - privacy pool indexer and linkability analyzer
//!
//! Modes:
//! - `once` - one pass over every active protocol, then reports and metrics as JSON
//! - `watch` - poll loop plus the SSE gateway
//! - `backfill <protocol>` - page one protocol back through its history
//! - `analyze` - correlate stored events and print every result

mod config;
mod db;
mod gateway;
mod rpc;
mod shutdown;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mixscope::{CorrelationEngine, EventBus, FetchClient, Orchestrator, RunReport};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{Command, Config};
use db::SqliteStore;
use gateway::GatewayState;
use rpc::RpcSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize tracing
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mixscope=debug,mixscope_indexer=debug"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();

    let config = Config::parse();
    let registry = config.load_registry()?;
    let correlation = config.correlation()?;

    info!("Starting mixscope-indexer...");
    info!("RPC URL: {}", config.rpc_url);
    info!("Database: {}", config.db_path.display());
    info!("Registry: {} ({} protocols)", config.protocols_path.display(), registry.protocols.len());

    let store = Arc::new(SqliteStore::open(&config.db_path).await?);
    info!("Database initialized");

    let bus = Arc::new(EventBus::new());
    let source = Arc::new(RpcSource::new(&config.rpc_url));
    let fetch = Arc::new(FetchClient::new(source, config.retry_policy()));
    let engine = CorrelationEngine::new(correlation, store.clone(), bus.clone());
    let orchestrator = Arc::new(
        Orchestrator::new(&registry, fetch, store.clone(), bus.clone(), config.indexer_settings())
            .with_engine(engine.clone()),
    );

    let protocols = orchestrator.protocols();
    if protocols.is_empty() {
        warn!("No enabled protocols in {}", config.protocols_path.display());
    } else {
        info!("Active protocols: {}", protocols.join(", "));
    }

    let result = match &config.command {
        Command::Once => run_once(&config, &orchestrator, &engine).await,
        Command::Watch => watch(&config, &orchestrator, &engine, &bus).await,
        Command::Backfill {
            protocol,
            page_size,
            max_pages,
        } => backfill(&config, &orchestrator, &engine, protocol, *page_size, *max_pages).await,
        Command::Analyze => analyze(&config, &engine).await,
    };

    store.close().await;
    info!("Database closed");
    result
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_once(
    config: &Config,
    orchestrator: &Orchestrator,
    engine: &Arc<CorrelationEngine>,
) -> anyhow::Result<()> {
    engine.load_from_store(config.history_limit).await?;
    let handle = engine.attach();

    let results = orchestrator.run_once(config.signature_limit).await;
    handle.flush().await;
    handle.shutdown().await;

    let mut runs = BTreeMap::new();
    for (protocol, result) in results {
        let entry = match result {
            Ok(report) => serde_json::to_value(report)?,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        runs.insert(protocol, entry);
    }

    let metrics = orchestrator.snapshot().await?;
    print_json(&serde_json::json!({ "runs": runs, "metrics": metrics }))
}

async fn watch(
    config: &Config,
    orchestrator: &Arc<Orchestrator>,
    engine: &Arc<CorrelationEngine>,
    bus: &Arc<EventBus>,
) -> anyhow::Result<()> {
    let shutdown = shutdown::spawn_shutdown_handler();

    let loaded = engine.load_from_store(config.history_limit).await?;
    info!("Loaded {} stored withdrawals into the correlation engine", loaded.len());
    let handle = engine.attach();

    let state = GatewayState::new(orchestrator.clone());
    let bridge = state.bridge(bus);
    let gateway_handle = tokio::spawn(gateway::serve(state, config.port, shutdown.clone()));

    let interval = Duration::from_secs(config.poll_interval_secs.max(1));
    info!("Starting poll loop (interval: {}s)", interval.as_secs());

    while !shutdown.is_shutdown() {
        if gateway_handle.is_finished() {
            warn!("Gateway exited, stopping poll loop");
            break;
        }

        let results = orchestrator.run_once(config.signature_limit).await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        let indexed: usize = results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .map(|report| report.count)
            .sum();
        info!(
            "Poll complete: {} protocols, {} new events, {} failed",
            results.len(),
            indexed,
            failed
        );

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.wait() => {}
        }
    }

    shutdown.shutdown();
    bus.unsubscribe(bridge);
    handle.shutdown().await;
    info!("Correlation engine stopped");

    match gateway_handle.await {
        Ok(result) => result,
        Err(e) => {
            error!("Gateway task failed: {}", e);
            Ok(())
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackfillSummary<'a> {
    protocol: &'a str,
    pages: usize,
    fetched: usize,
    count: usize,
    duplicates: usize,
    unknown: usize,
    errors: usize,
    next_cursor: Option<&'a str>,
}

impl<'a> BackfillSummary<'a> {
    fn new(protocol: &'a str, reports: &'a [RunReport]) -> Self {
        Self {
            protocol,
            pages: reports.len(),
            fetched: reports.iter().map(|r| r.fetched).sum(),
            count: reports.iter().map(|r| r.count).sum(),
            duplicates: reports.iter().map(|r| r.duplicates).sum(),
            unknown: reports.iter().map(|r| r.unknown).sum(),
            errors: reports.iter().map(|r| r.errors).sum(),
            next_cursor: reports.last().and_then(|r| r.next_cursor.as_deref()),
        }
    }
}

async fn backfill(
    config: &Config,
    orchestrator: &Orchestrator,
    engine: &Arc<CorrelationEngine>,
    protocol: &str,
    page_size: usize,
    max_pages: Option<usize>,
) -> anyhow::Result<()> {
    engine.load_from_store(config.history_limit).await?;
    let handle = engine.attach();

    let result = orchestrator.backfill(protocol, page_size.max(1), max_pages).await;
    handle.flush().await;
    handle.shutdown().await;

    let reports = result?;
    print_json(&BackfillSummary::new(protocol, &reports))
}

async fn analyze(config: &Config, engine: &CorrelationEngine) -> anyhow::Result<()> {
    let results = engine.load_from_store(config.history_limit).await?;
    let (overall, protocols) = engine.metrics().await;
    info!(
        "Analyzed {} withdrawals: {} linkable, {} critical",
        overall.analyzed, overall.linkable, overall.critical
    );
    print_json(&serde_json::json!({
        "results": results,
        "metrics": { "overall": overall, "protocols": protocols },
    }))
}
