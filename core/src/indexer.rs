//! Per-protocol indexer
//!
//! Fetches a protocol's signatures, fetches and parses each transaction in
//! small batches, stores every event and announces new ones on the bus.
//! A single transaction failing (rate limited, provider error, store error)
//! is counted and skipped; it never aborts the run.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::bus::{BusEvent, EventBus};
use crate::config::ProtocolConfig;
use crate::consts::{DEFAULT_BATCH_DELAY_MS, DEFAULT_BATCH_SIZE};
use crate::error::{FetchError, IndexerError, StoreError};
use crate::fetch::{FetchClient, SignatureInfo};
use crate::parser::{DomainEvent, ProtocolParser};
use crate::store::{Store, UpsertOutcome};
use crate::types::IndexerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexerSettings {
    /// Transactions fetched concurrently per batch
    pub batch_size: usize,
    /// Settle delay between batches
    pub batch_delay: Duration,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
        }
    }
}

/// Counts for one indexer run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub protocol: String,
    /// Signatures fetched
    pub fetched: usize,
    /// New events stored
    pub count: usize,
    pub deposits: usize,
    pub withdrawals: usize,
    pub transfers: usize,
    /// Already stored from an earlier run
    pub duplicates: usize,
    /// Failed on-chain, missing, or not classifiable
    pub unknown: usize,
    /// Provider or store failures, rate limits included
    pub errors: usize,
    pub rate_limited: usize,
    /// Oldest signature seen; pass as the cursor to continue backwards
    pub next_cursor: Option<String>,
}

impl RunReport {
    fn new(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Stored(kind) => {
                self.count += 1;
                match kind {
                    EventKind::Deposit => self.deposits += 1,
                    EventKind::Withdrawal => self.withdrawals += 1,
                    EventKind::Transfer => self.transfers += 1,
                }
            }
            ItemOutcome::Duplicate => self.duplicates += 1,
            ItemOutcome::Unknown => self.unknown += 1,
            ItemOutcome::RateLimited => {
                self.errors += 1;
                self.rate_limited += 1;
            }
            ItemOutcome::FetchFailed | ItemOutcome::StoreFailed(_) => self.errors += 1,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} new events ({} deposits, {} withdrawals, {} transfers), {} duplicates, {} unknown, {} errors",
            self.count,
            self.deposits,
            self.withdrawals,
            self.transfers,
            self.duplicates,
            self.unknown,
            self.errors
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Deposit,
    Withdrawal,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemOutcome {
    Stored(EventKind),
    Duplicate,
    Unknown,
    RateLimited,
    FetchFailed,
    StoreFailed(StoreError),
}

pub struct Indexer {
    protocol: ProtocolConfig,
    parser: ProtocolParser,
    fetch: Arc<FetchClient>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    settings: IndexerSettings,
}

impl Indexer {
    pub fn new(
        protocol: &ProtocolConfig,
        fetch: Arc<FetchClient>,
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            parser: ProtocolParser::from_config(protocol),
            protocol: protocol.clone(),
            fetch,
            store,
            bus,
            settings,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol.id
    }

    fn publish_status(&self, status: IndexerStatus) {
        self.bus.publish(BusEvent::IndexerStatus(status));
    }

    /// Index up to `limit` of the newest signatures before `cursor`.
    pub async fn run(&self, limit: usize, cursor: Option<&str>) -> Result<RunReport, IndexerError> {
        let id = self.protocol.id.as_str();
        self.publish_status(IndexerStatus::starting(id));
        tracing::info!("Indexing {} ({}), limit {}", self.protocol.display_name(), self.protocol.program_id, limit);

        let signatures = match self
            .fetch
            .fetch_signatures(&self.protocol.program_id, limit, cursor)
            .await
        {
            Ok(signatures) => signatures,
            Err(e) => {
                tracing::error!("{}: failed to fetch signatures: {}", id, e);
                self.publish_status(IndexerStatus::error(id, e.to_string()));
                return Err(e.into());
            }
        };

        let mut report = RunReport::new(id);
        report.fetched = signatures.len();
        report.next_cursor = signatures.last().map(|s| s.signature.clone());

        let total = signatures.len();
        let batch_size = self.settings.batch_size.max(1);
        let mut done = 0;
        let mut store_failures = 0;
        let mut last_store_error: Option<StoreError> = None;

        for (batch_index, batch) in signatures.chunks(batch_size).enumerate() {
            if batch_index > 0 && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }

            let outcomes = join_all(batch.iter().map(|sig| self.process(sig))).await;
            for outcome in outcomes {
                report.record(&outcome);
                if let ItemOutcome::StoreFailed(e) = outcome {
                    store_failures += 1;
                    last_store_error = Some(e);
                }
            }

            done += batch.len();
            self.publish_status(IndexerStatus::indexing(id, done, total));
        }

        // Every write failed: the store itself is unavailable
        if let Some(e) = last_store_error {
            if report.count == 0 && report.duplicates == 0 && store_failures > 0 {
                tracing::error!("{}: store unavailable: {}", id, e);
                self.publish_status(IndexerStatus::error(id, e.to_string()));
                return Err(e.into());
            }
        }

        let summary = report.summary();
        tracing::info!("{}: run complete, {} signatures: {}", id, report.fetched, summary);
        self.publish_status(IndexerStatus::complete(id, summary));
        Ok(report)
    }

    async fn process(&self, sig: &SignatureInfo) -> ItemOutcome {
        if sig.is_failed() {
            return ItemOutcome::Unknown;
        }

        let tx = match self.fetch.fetch_transaction(&sig.signature).await {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                tracing::debug!("{}: transaction {} not found", self.protocol.id, sig.signature);
                return ItemOutcome::Unknown;
            }
            Err(FetchError::RateLimited { .. }) => return ItemOutcome::RateLimited,
            Err(FetchError::FetchFailed(_)) => return ItemOutcome::FetchFailed,
        };

        let Some(event) = self.parser.parse(&tx) else {
            return ItemOutcome::Unknown;
        };

        match self.store_event(&event).await {
            Ok(UpsertOutcome::Inserted) => {
                let kind = match &event {
                    DomainEvent::Deposit(_) => EventKind::Deposit,
                    DomainEvent::Withdrawal(_) => EventKind::Withdrawal,
                    DomainEvent::Transfer(_) => EventKind::Transfer,
                };
                self.bus.publish(match event {
                    DomainEvent::Deposit(d) => BusEvent::DepositNew(d),
                    DomainEvent::Withdrawal(w) => BusEvent::WithdrawalNew(w),
                    DomainEvent::Transfer(t) => BusEvent::Transfer(t),
                });
                ItemOutcome::Stored(kind)
            }
            Ok(UpsertOutcome::Duplicate) => ItemOutcome::Duplicate,
            Err(e) => {
                tracing::warn!("{}: failed to store {}: {}", self.protocol.id, event.signature(), e);
                ItemOutcome::StoreFailed(e)
            }
        }
    }

    async fn store_event(&self, event: &DomainEvent) -> Result<UpsertOutcome, StoreError> {
        match event {
            DomainEvent::Deposit(d) => self.store.upsert_deposit(d).await,
            DomainEvent::Withdrawal(w) => self.store.upsert_withdrawal(w).await,
            DomainEvent::Transfer(t) => self.store.upsert_transfer(t).await,
        }
    }
}
