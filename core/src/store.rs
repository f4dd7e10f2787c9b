//! Persistent store interface
//!
//! The store is the source of truth for deposits, withdrawals and transfers.
//! Writes are idempotent upserts keyed by (protocol, signature): re-indexing
//! the same transaction is a `Duplicate`, never an error.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{Deposit, Stats, Transfer, Withdrawal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The (protocol, signature) key already existed; nothing was written.
    Duplicate,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_deposit(&self, deposit: &Deposit) -> Result<UpsertOutcome, StoreError>;

    async fn upsert_withdrawal(&self, withdrawal: &Withdrawal) -> Result<UpsertOutcome, StoreError>;

    async fn upsert_transfer(&self, transfer: &Transfer) -> Result<UpsertOutcome, StoreError>;

    /// Check-then-set spend transition. `Ok(false)` when the deposit was
    /// already spent (the first link is kept), `NotFound` when it is unknown.
    async fn mark_deposit_spent(
        &self,
        protocol: &str,
        signature: &str,
        withdrawal_signature: &str,
        spent_at: i64,
    ) -> Result<bool, StoreError>;

    /// Most recent first.
    async fn get_deposits(&self, limit: usize) -> Result<Vec<Deposit>, StoreError>;

    /// Most recent first.
    async fn get_withdrawals(&self, limit: usize) -> Result<Vec<Withdrawal>, StoreError>;

    /// Most recent first.
    async fn get_transfers(&self, limit: usize) -> Result<Vec<Transfer>, StoreError>;

    async fn get_stats(&self) -> Result<Stats, StoreError>;
}

type Key = (String, String);

fn key(protocol: &str, signature: &str) -> Key {
    (protocol.to_string(), signature.to_string())
}

/// Aggregates shared by every store implementation.
pub fn compute_stats<'a>(
    deposits: impl IntoIterator<Item = &'a Deposit>,
    withdrawals: impl IntoIterator<Item = &'a Withdrawal>,
) -> Stats {
    let mut stats = Stats::default();
    let mut depositors = HashSet::new();
    let mut deposited: u128 = 0;
    let mut withdrawn: u128 = 0;

    for d in deposits {
        stats.total_deposits += 1;
        if !d.spent {
            stats.unspent_deposits += 1;
        }
        depositors.insert(d.depositor.as_str());
        deposited += d.amount as u128;
    }
    for w in withdrawals {
        stats.total_withdrawals += 1;
        withdrawn += w.amount as u128;
    }

    stats.unique_depositors = depositors.len() as u64;
    stats.tvl = deposited.saturating_sub(withdrawn).min(u64::MAX as u128) as u64;
    stats
}

#[derive(Default)]
struct Tables {
    deposits: HashMap<Key, Deposit>,
    withdrawals: HashMap<Key, Withdrawal>,
    transfers: HashMap<Key, Transfer>,
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_deposit(&self, protocol: &str, signature: &str) -> Option<Deposit> {
        self.tables
            .read()
            .await
            .deposits
            .get(&key(protocol, signature))
            .cloned()
    }
}

fn newest_first<T>(
    rows: impl Iterator<Item = T>,
    limit: usize,
    order: impl Fn(&T) -> (i64, u64, String),
) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    rows.sort_by_key(|row| {
        let (timestamp, slot, signature) = order(row);
        (Reverse(timestamp), Reverse(slot), signature)
    });
    rows.truncate(limit);
    rows
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_deposit(&self, deposit: &Deposit) -> Result<UpsertOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        let k = key(&deposit.protocol, &deposit.signature);
        if tables.deposits.contains_key(&k) {
            return Ok(UpsertOutcome::Duplicate);
        }
        tables.deposits.insert(k, deposit.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn upsert_withdrawal(&self, withdrawal: &Withdrawal) -> Result<UpsertOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        let k = key(&withdrawal.protocol, &withdrawal.signature);
        if tables.withdrawals.contains_key(&k) {
            return Ok(UpsertOutcome::Duplicate);
        }
        tables.withdrawals.insert(k, withdrawal.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn upsert_transfer(&self, transfer: &Transfer) -> Result<UpsertOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        let k = key(&transfer.protocol, &transfer.signature);
        if tables.transfers.contains_key(&k) {
            return Ok(UpsertOutcome::Duplicate);
        }
        tables.transfers.insert(k, transfer.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn mark_deposit_spent(
        &self,
        protocol: &str,
        signature: &str,
        withdrawal_signature: &str,
        spent_at: i64,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let deposit = tables
            .deposits
            .get_mut(&key(protocol, signature))
            .ok_or_else(|| StoreError::NotFound(format!("deposit {}/{}", protocol, signature)))?;
        Ok(deposit.mark_spent(withdrawal_signature, spent_at))
    }

    async fn get_deposits(&self, limit: usize) -> Result<Vec<Deposit>, StoreError> {
        let tables = self.tables.read().await;
        Ok(newest_first(tables.deposits.values().cloned(), limit, |d| {
            (d.timestamp, d.slot, d.signature.clone())
        }))
    }

    async fn get_withdrawals(&self, limit: usize) -> Result<Vec<Withdrawal>, StoreError> {
        let tables = self.tables.read().await;
        Ok(newest_first(tables.withdrawals.values().cloned(), limit, |w| {
            (w.timestamp, w.slot, w.signature.clone())
        }))
    }

    async fn get_transfers(&self, limit: usize) -> Result<Vec<Transfer>, StoreError> {
        let tables = self.tables.read().await;
        Ok(newest_first(tables.transfers.values().cloned(), limit, |t| {
            (t.timestamp, t.slot, t.signature.clone())
        }))
    }

    async fn get_stats(&self) -> Result<Stats, StoreError> {
        let tables = self.tables.read().await;
        Ok(compute_stats(tables.deposits.values(), tables.withdrawals.values()))
    }
}
