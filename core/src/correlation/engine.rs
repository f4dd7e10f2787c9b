//! Incremental correlation engine
//!
//! Keeps every known deposit and withdrawal per protocol and re-analyzes
//! withdrawals as events arrive. Bus handlers only enqueue onto an unbounded
//! channel; a background worker does the analysis, publishes `match:found`
//! and requests spend transitions from the store.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::bus::{BusEvent, EventBus, SubscriptionId, Topic};
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{CorrelationResult, Deposit, Withdrawal};

use super::{analyze, same_links, CorrelationConfig, PrivacyMetrics};

enum EngineMsg {
    Deposit(Deposit),
    Withdrawal(Withdrawal),
    /// Acknowledged once every earlier message has been processed
    Flush(oneshot::Sender<()>),
}

/// Working set of one protocol, keyed by signature.
#[derive(Default)]
struct Partition {
    deposits: BTreeMap<String, Deposit>,
    withdrawals: BTreeMap<String, Withdrawal>,
    /// Latest result per withdrawal signature
    results: BTreeMap<String, CorrelationResult>,
}

/// A result that changed and should go out on `match:found`.
struct Update {
    result: CorrelationResult,
    publish: bool,
}

pub struct CorrelationEngine {
    config: CorrelationConfig,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    partitions: Mutex<BTreeMap<String, Partition>>,
    /// Queue of the attached worker, if any
    worker_tx: std::sync::Mutex<Option<mpsc::WeakUnboundedSender<EngineMsg>>>,
}

impl CorrelationEngine {
    pub fn new(config: CorrelationConfig, store: Arc<dyn Store>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            bus,
            partitions: Mutex::new(BTreeMap::new()),
            worker_tx: std::sync::Mutex::new(None),
        })
    }

    /// Waits until the attached worker has analyzed every event enqueued so
    /// far. Returns immediately when no worker is attached.
    pub async fn flush(&self) {
        let tx = self
            .worker_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(mpsc::WeakUnboundedSender::upgrade);
        if let Some(tx) = tx {
            flush_queue(&tx).await;
        }
    }

    /// Re-analyze `signature` in `partition`, recording the result. Returns
    /// an update when the links differ from the previous result.
    fn reanalyze(&self, partition: &mut Partition, signature: &str) -> Option<Update> {
        let withdrawal = partition.withdrawals.get(signature)?;
        let result = analyze(withdrawal, partition.deposits.values(), &self.config);
        let changed = partition
            .results
            .get(signature)
            .map_or(true, |previous| !same_links(previous, &result));
        partition.results.insert(signature.to_string(), result.clone());
        if !changed {
            return None;
        }
        let publish = result.anonymity_set > 0;
        Some(Update { result, publish })
    }

    /// Adds a deposit and re-analyzes every withdrawal of the same protocol
    /// whose window could now include it.
    pub async fn ingest_deposit(&self, deposit: Deposit) -> Vec<CorrelationResult> {
        let updates = {
            let mut partitions = self.partitions.lock().await;
            let partition = partitions.entry(deposit.protocol.clone()).or_default();
            if partition.deposits.contains_key(&deposit.signature) {
                return Vec::new();
            }
            let affected: Vec<String> = partition
                .withdrawals
                .values()
                .filter(|w| {
                    w.timestamp
                        .checked_sub(deposit.timestamp)
                        .is_some_and(|delta| (0..=self.config.max_window_ms).contains(&delta))
                })
                .map(|w| w.signature.clone())
                .collect();
            partition.deposits.insert(deposit.signature.clone(), deposit);

            affected
                .iter()
                .filter_map(|sig| self.reanalyze(partition, sig))
                .collect::<Vec<_>>()
        };
        self.apply(updates).await
    }

    pub async fn ingest_withdrawal(&self, withdrawal: Withdrawal) -> Vec<CorrelationResult> {
        let updates = {
            let mut partitions = self.partitions.lock().await;
            let partition = partitions.entry(withdrawal.protocol.clone()).or_default();
            if partition.withdrawals.contains_key(&withdrawal.signature) {
                return Vec::new();
            }
            let signature = withdrawal.signature.clone();
            partition.withdrawals.insert(signature.clone(), withdrawal);
            self.reanalyze(partition, &signature).into_iter().collect::<Vec<_>>()
        };
        self.apply(updates).await
    }

    /// Publishes changed results and runs spend transitions, outside the
    /// partition lock. Returns the published results.
    async fn apply(&self, updates: Vec<Update>) -> Vec<CorrelationResult> {
        let mut published = Vec::new();
        for update in updates.into_iter().filter(|u| u.publish) {
            self.maybe_mark_spent(&update.result).await;
            tracing::debug!(
                "match:found {} ({}): anonymity set {}, {}",
                update.result.withdrawal.signature,
                update.result.withdrawal.protocol,
                update.result.anonymity_set,
                update.result.vulnerability_level.as_str()
            );
            self.bus.publish(BusEvent::MatchFound(update.result.clone()));
            published.push(update.result);
        }
        published
    }

    /// A unique candidate at high confidence marks its deposit spent, once.
    async fn maybe_mark_spent(&self, result: &CorrelationResult) {
        if result.anonymity_set != 1 {
            return;
        }
        let Some(top) = result.top_source() else {
            return;
        };
        if top.confidence < self.config.spend_confidence || top.deposit.spent {
            return;
        }
        let deposit = &top.deposit;
        let withdrawal = &result.withdrawal;
        match self
            .store
            .mark_deposit_spent(
                &deposit.protocol,
                &deposit.signature,
                &withdrawal.signature,
                withdrawal.timestamp,
            )
            .await
        {
            Ok(true) => {
                tracing::info!(
                    "Deposit {} linked to withdrawal {} (confidence {:.3}), marked spent",
                    deposit.signature,
                    withdrawal.signature,
                    top.confidence
                );
                let mut partitions = self.partitions.lock().await;
                if let Some(d) = partitions
                    .get_mut(&deposit.protocol)
                    .and_then(|p| p.deposits.get_mut(&deposit.signature))
                {
                    d.mark_spent(&withdrawal.signature, withdrawal.timestamp);
                }
            }
            Ok(false) => {
                tracing::debug!("Deposit {} already spent", deposit.signature);
            }
            Err(StoreError::NotFound(_)) => {
                tracing::debug!("Deposit {} not in store, spend skipped", deposit.signature);
            }
            Err(e) => {
                tracing::warn!("Failed to mark deposit {} spent: {}", deposit.signature, e);
            }
        }
    }

    /// Bulk load and analyze everything. Nothing is published; results become
    /// the baseline later updates are compared against.
    pub async fn load(&self, deposits: Vec<Deposit>, withdrawals: Vec<Withdrawal>) -> Vec<CorrelationResult> {
        let results = {
            let mut partitions = self.partitions.lock().await;
            for d in deposits {
                partitions
                    .entry(d.protocol.clone())
                    .or_default()
                    .deposits
                    .entry(d.signature.clone())
                    .or_insert(d);
            }
            for w in withdrawals {
                partitions
                    .entry(w.protocol.clone())
                    .or_default()
                    .withdrawals
                    .entry(w.signature.clone())
                    .or_insert(w);
            }

            let mut results = Vec::new();
            for partition in partitions.values_mut() {
                let signatures: Vec<String> = partition.withdrawals.keys().cloned().collect();
                for sig in signatures {
                    self.reanalyze(partition, &sig);
                }
                results.extend(partition.results.values().cloned());
            }
            results
        };

        for result in &results {
            self.maybe_mark_spent(result).await;
        }
        tracing::info!("Correlation engine loaded {} withdrawals", results.len());
        results
    }

    /// Loads the most recent `limit` deposits and withdrawals from the store.
    pub async fn load_from_store(&self, limit: usize) -> Result<Vec<CorrelationResult>, StoreError> {
        let deposits = self.store.get_deposits(limit).await?;
        let withdrawals = self.store.get_withdrawals(limit).await?;
        Ok(self.load(deposits, withdrawals).await)
    }

    /// Latest result of every analyzed withdrawal, by protocol then signature.
    pub async fn results(&self) -> Vec<CorrelationResult> {
        let partitions = self.partitions.lock().await;
        partitions
            .values()
            .flat_map(|p| p.results.values().cloned())
            .collect()
    }

    pub async fn result_for(&self, protocol: &str, signature: &str) -> Option<CorrelationResult> {
        let partitions = self.partitions.lock().await;
        partitions.get(protocol)?.results.get(signature).cloned()
    }

    /// Overall metrics and metrics per protocol.
    pub async fn metrics(&self) -> (PrivacyMetrics, BTreeMap<String, PrivacyMetrics>) {
        let partitions = self.partitions.lock().await;
        let per_protocol = partitions
            .iter()
            .map(|(protocol, p)| (protocol.clone(), PrivacyMetrics::from_results(p.results.values())))
            .collect();
        let overall = PrivacyMetrics::from_results(partitions.values().flat_map(|p| p.results.values()));
        (overall, per_protocol)
    }

    /// Subscribe to `deposit:new` and `withdrawal:new` and start the worker.
    pub fn attach(self: &Arc<Self>) -> EngineHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let deposit_tx = tx.clone();
        let deposit_sub = self.bus.subscribe(Topic::DepositNew, move |event| {
            if let BusEvent::DepositNew(d) = event {
                let _ = deposit_tx.send(EngineMsg::Deposit(d.clone()));
            }
        });
        let withdrawal_tx = tx.clone();
        let withdrawal_sub = self.bus.subscribe(Topic::WithdrawalNew, move |event| {
            if let BusEvent::WithdrawalNew(w) = event {
                let _ = withdrawal_tx.send(EngineMsg::Withdrawal(w.clone()));
            }
        });

        *self.worker_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx.downgrade());

        let engine = Arc::clone(self);
        let worker = tokio::spawn(async move {
            engine_loop(engine, rx).await;
        });

        EngineHandle {
            bus: Arc::clone(&self.bus),
            subscriptions: vec![deposit_sub, withdrawal_sub],
            tx,
            worker,
        }
    }
}

async fn flush_queue(tx: &mpsc::UnboundedSender<EngineMsg>) {
    let (ack_tx, ack_rx) = oneshot::channel();
    if tx.send(EngineMsg::Flush(ack_tx)).is_ok() {
        let _ = ack_rx.await;
    }
}

async fn engine_loop(engine: Arc<CorrelationEngine>, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            EngineMsg::Deposit(d) => {
                engine.ingest_deposit(d).await;
            }
            EngineMsg::Withdrawal(w) => {
                engine.ingest_withdrawal(w).await;
            }
            EngineMsg::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    tracing::debug!("Correlation engine worker stopped");
}

/// Running engine attachment. Dropping it without `shutdown` leaves the
/// subscriptions in place.
pub struct EngineHandle {
    bus: Arc<EventBus>,
    subscriptions: Vec<SubscriptionId>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    worker: JoinHandle<()>,
}

impl EngineHandle {
    /// Waits until every event enqueued so far has been analyzed.
    pub async fn flush(&self) {
        flush_queue(&self.tx).await;
    }

    /// Unsubscribes, drains queued events and stops the worker.
    pub async fn shutdown(self) {
        for id in &self.subscriptions {
            self.bus.unsubscribe(*id);
        }
        drop(self.tx);
        if let Err(e) = self.worker.await {
            tracing::error!("Correlation engine worker panicked: {}", e);
        }
    }
}
