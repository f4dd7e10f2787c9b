//! Orchestrator - turns the protocol registry into running indexers
//!
//! The active indexer set is derived from the registry once, at
//! construction. Each protocol is its own failure domain: one indexer
//! failing is reported on the bus and in the results, and never stops the
//! others.

use std::sync::Arc;

use futures::future::join_all;

use crate::bus::{BusEvent, EventBus};
use crate::config::ProtocolRegistry;
use crate::correlation::{CorrelationEngine, MetricsSnapshot};
use crate::error::{ConfigError, IndexerError, StoreError};
use crate::fetch::FetchClient;
use crate::indexer::{Indexer, IndexerSettings, RunReport};
use crate::store::Store;

pub struct Orchestrator {
    indexers: Vec<Indexer>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    engine: Option<Arc<CorrelationEngine>>,
}

impl Orchestrator {
    pub fn new(
        registry: &ProtocolRegistry,
        fetch: Arc<FetchClient>,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        settings: IndexerSettings,
    ) -> Self {
        let indexers = registry
            .active()
            .into_iter()
            .map(|protocol| Indexer::new(protocol, fetch.clone(), store.clone(), bus.clone(), settings))
            .collect();
        Self {
            indexers,
            store,
            bus,
            engine: None,
        }
    }

    /// Include the engine's privacy metrics in `metrics:updated`.
    pub fn with_engine(mut self, engine: Arc<CorrelationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Ids of the active protocols, in registry order.
    pub fn protocols(&self) -> Vec<&str> {
        self.indexers.iter().map(Indexer::protocol).collect()
    }

    fn indexer(&self, protocol: &str) -> Result<&Indexer, ConfigError> {
        self.indexers
            .iter()
            .find(|i| i.protocol() == protocol)
            .ok_or_else(|| ConfigError::UnknownProtocol(protocol.to_string()))
    }

    /// One pass over every active protocol, concurrently, then a metrics update.
    pub async fn run_once(&self, limit: usize) -> Vec<(String, Result<RunReport, IndexerError>)> {
        let runs = self.indexers.iter().map(|indexer| async move {
            let result = indexer.run(limit, None).await;
            if let Err(e) = &result {
                tracing::error!("Indexer {} failed: {}", indexer.protocol(), e);
            }
            (indexer.protocol().to_string(), result)
        });
        let results = join_all(runs).await;

        if let Err(e) = self.publish_metrics().await {
            tracing::warn!("Failed to publish metrics: {}", e);
        }
        results
    }

    /// Page `protocol` back through its history until a short page, `page_size`
    /// signatures at a time. Reports every page.
    pub async fn backfill(
        &self,
        protocol: &str,
        page_size: usize,
        max_pages: Option<usize>,
    ) -> Result<Vec<RunReport>, IndexerError> {
        let indexer = self.indexer(protocol)?;

        let mut reports = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let report = indexer.run(page_size, cursor.as_deref()).await?;
            let short_page = report.fetched < page_size;
            cursor = report.next_cursor.clone();
            tracing::info!(
                "Backfill {} page {}: {} signatures, cursor {}",
                protocol,
                reports.len() + 1,
                report.fetched,
                cursor.as_deref().unwrap_or("-")
            );
            reports.push(report);

            if short_page || cursor.is_none() || max_pages.is_some_and(|max| reports.len() >= max) {
                break;
            }
        }

        if let Err(e) = self.publish_metrics().await {
            tracing::warn!("Failed to publish metrics: {}", e);
        }
        Ok(reports)
    }

    pub async fn snapshot(&self) -> Result<MetricsSnapshot, StoreError> {
        let stats = self.store.get_stats().await?;
        let (overall, protocols) = match &self.engine {
            Some(engine) => engine.metrics().await,
            None => Default::default(),
        };
        Ok(MetricsSnapshot {
            stats,
            overall,
            protocols,
        })
    }

    /// Waits for the engine to analyze this run's events before publishing.
    async fn publish_metrics(&self) -> Result<(), StoreError> {
        if let Some(engine) = &self.engine {
            engine.flush().await;
        }
        let snapshot = self.snapshot().await?;
        self.bus.publish(BusEvent::MetricsUpdated(snapshot));
        Ok(())
    }
}
