//! SQLite persistence for indexed events.
//!
//! Every table is keyed by `UNIQUE(protocol, signature)`; inserts use
//! `ON CONFLICT DO NOTHING` so a re-indexed transaction reports `Duplicate`.
//! Unsigned amounts are stored bit-for-bit in SQLite's signed INTEGER.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mixscope::{
    Deposit, Stats, Store, StoreError, Transfer, TransferKind, UpsertOutcome, Withdrawal,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{prelude::FromRow, Pool, Sqlite};
use tokio::time::Instant;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS deposits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        protocol TEXT NOT NULL,
        signature TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        slot INTEGER NOT NULL,
        amount INTEGER NOT NULL,
        depositor TEXT NOT NULL,
        commitment TEXT NOT NULL,
        spent INTEGER NOT NULL DEFAULT 0,
        spent_at INTEGER,
        withdrawal_signature TEXT,
        UNIQUE(protocol, signature)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS withdrawals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        protocol TEXT NOT NULL,
        signature TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        slot INTEGER NOT NULL,
        amount INTEGER NOT NULL,
        recipient TEXT NOT NULL,
        nullifier TEXT NOT NULL,
        relayer TEXT NOT NULL,
        fee INTEGER NOT NULL,
        UNIQUE(protocol, signature)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transfers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        protocol TEXT NOT NULL,
        signature TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        slot INTEGER NOT NULL,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        amount INTEGER,
        token TEXT NOT NULL,
        decimals INTEGER NOT NULL,
        kind TEXT NOT NULL,
        ciphertext TEXT,
        UNIQUE(protocol, signature)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_deposits_timestamp ON deposits (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_withdrawals_timestamp ON withdrawals (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_transfers_timestamp ON transfers (timestamp)",
];

#[derive(Debug, Clone, FromRow)]
struct DepositRow {
    protocol: String,
    signature: String,
    timestamp: i64,
    slot: i64,
    amount: i64,
    depositor: String,
    commitment: String,
    spent: bool,
    spent_at: Option<i64>,
    withdrawal_signature: Option<String>,
}

impl From<DepositRow> for Deposit {
    fn from(r: DepositRow) -> Self {
        Deposit {
            protocol: r.protocol,
            signature: r.signature,
            timestamp: r.timestamp,
            slot: r.slot as u64,
            amount: r.amount as u64,
            depositor: r.depositor,
            commitment: r.commitment,
            spent: r.spent,
            spent_at: r.spent_at,
            withdrawal_signature: r.withdrawal_signature,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct WithdrawalRow {
    protocol: String,
    signature: String,
    timestamp: i64,
    slot: i64,
    amount: i64,
    recipient: String,
    nullifier: String,
    relayer: String,
    fee: i64,
}

impl From<WithdrawalRow> for Withdrawal {
    fn from(r: WithdrawalRow) -> Self {
        Withdrawal {
            protocol: r.protocol,
            signature: r.signature,
            timestamp: r.timestamp,
            slot: r.slot as u64,
            amount: r.amount as u64,
            recipient: r.recipient,
            nullifier: r.nullifier,
            relayer: r.relayer,
            fee: r.fee as u64,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct TransferRow {
    protocol: String,
    signature: String,
    timestamp: i64,
    slot: i64,
    sender: String,
    recipient: String,
    amount: Option<i64>,
    token: String,
    decimals: i64,
    kind: String,
    ciphertext: Option<String>,
}

impl TryFrom<TransferRow> for Transfer {
    type Error = StoreError;

    fn try_from(r: TransferRow) -> Result<Self, Self::Error> {
        Ok(Transfer {
            kind: kind_from_str(&r.kind)?,
            protocol: r.protocol,
            signature: r.signature,
            timestamp: r.timestamp,
            slot: r.slot as u64,
            sender: r.sender,
            recipient: r.recipient,
            amount: r.amount.map(|a| a as u64),
            token: r.token,
            decimals: r.decimals.clamp(0, u8::MAX as i64) as u8,
            ciphertext: r.ciphertext,
        })
    }
}

fn kind_as_str(kind: TransferKind) -> &'static str {
    match kind {
        TransferKind::Transfer => "transfer",
        TransferKind::Confidential => "confidential",
        TransferKind::ConfidentialDeposit => "confidential_deposit",
        TransferKind::ConfidentialWithdraw => "confidential_withdraw",
    }
}

fn kind_from_str(kind: &str) -> Result<TransferKind, StoreError> {
    match kind {
        "transfer" => Ok(TransferKind::Transfer),
        "confidential" => Ok(TransferKind::Confidential),
        "confidential_deposit" => Ok(TransferKind::ConfidentialDeposit),
        "confidential_withdraw" => Ok(TransferKind::ConfidentialWithdraw),
        other => Err(StoreError::Backend(format!("unknown transfer kind: {}", other))),
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn outcome(rows_affected: u64) -> UpsertOutcome {
    if rows_affected == 0 {
        UpsertOutcome::Duplicate
    } else {
        UpsertOutcome::Inserted
    }
}

fn log_slow(label: &str, now: Instant) {
    let elapsed = now.elapsed().as_millis();
    if elapsed >= 1000 {
        tracing::warn!("Long Query: {} in {}ms", label, elapsed);
    }
}

fn limit_param(limit: usize) -> i64 {
    limit.min(i64::MAX as usize) as i64
}

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Sums an amount column as unsigned 64-bit values.
    async fn sum_amounts(&self, query: &'static str) -> Result<u128, StoreError> {
        sqlx::query_scalar::<_, i64>(query)
            .fetch(&self.pool)
            .try_fold(0u128, |total, amount| async move {
                Ok::<_, sqlx::Error>(total + amount as u64 as u128)
            })
            .await
            .map_err(backend)
    }

    /// Opens (creating if missing) the database file and applies the schema.
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Single-connection in-memory database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: Pool<Sqlite>) -> Result<Self, sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_deposit(&self, d: &Deposit) -> Result<UpsertOutcome, StoreError> {
        let now = Instant::now();
        let result = sqlx::query(
            r#"
            INSERT INTO deposits (
                protocol, signature, timestamp, slot, amount, depositor, commitment,
                spent, spent_at, withdrawal_signature
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(protocol, signature) DO NOTHING
            "#,
        )
        .bind(&d.protocol)
        .bind(&d.signature)
        .bind(d.timestamp)
        .bind(d.slot as i64)
        .bind(d.amount as i64)
        .bind(&d.depositor)
        .bind(&d.commitment)
        .bind(d.spent)
        .bind(d.spent_at)
        .bind(&d.withdrawal_signature)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        log_slow("Deposit inserted", now);
        Ok(outcome(result.rows_affected()))
    }

    async fn upsert_withdrawal(&self, w: &Withdrawal) -> Result<UpsertOutcome, StoreError> {
        let now = Instant::now();
        let result = sqlx::query(
            r#"
            INSERT INTO withdrawals (
                protocol, signature, timestamp, slot, amount, recipient, nullifier, relayer, fee
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(protocol, signature) DO NOTHING
            "#,
        )
        .bind(&w.protocol)
        .bind(&w.signature)
        .bind(w.timestamp)
        .bind(w.slot as i64)
        .bind(w.amount as i64)
        .bind(&w.recipient)
        .bind(&w.nullifier)
        .bind(&w.relayer)
        .bind(w.fee as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        log_slow("Withdrawal inserted", now);
        Ok(outcome(result.rows_affected()))
    }

    async fn upsert_transfer(&self, t: &Transfer) -> Result<UpsertOutcome, StoreError> {
        let now = Instant::now();
        let result = sqlx::query(
            r#"
            INSERT INTO transfers (
                protocol, signature, timestamp, slot, sender, recipient, amount, token,
                decimals, kind, ciphertext
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(protocol, signature) DO NOTHING
            "#,
        )
        .bind(&t.protocol)
        .bind(&t.signature)
        .bind(t.timestamp)
        .bind(t.slot as i64)
        .bind(&t.sender)
        .bind(&t.recipient)
        .bind(t.amount.map(|a| a as i64))
        .bind(&t.token)
        .bind(t.decimals as i64)
        .bind(kind_as_str(t.kind))
        .bind(&t.ciphertext)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        log_slow("Transfer inserted", now);
        Ok(outcome(result.rows_affected()))
    }

    async fn mark_deposit_spent(
        &self,
        protocol: &str,
        signature: &str,
        withdrawal_signature: &str,
        spent_at: i64,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE deposits
            SET spent = 1, spent_at = ?, withdrawal_signature = ?
            WHERE protocol = ? AND signature = ? AND spent = 0
            "#,
        )
        .bind(spent_at)
        .bind(withdrawal_signature)
        .bind(protocol)
        .bind(signature)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        log_slow("Deposit marked spent", now);

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM deposits WHERE protocol = ? AND signature = ?")
                .bind(protocol)
                .bind(signature)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("deposit {}/{}", protocol, signature))),
        }
    }

    async fn get_deposits(&self, limit: usize) -> Result<Vec<Deposit>, StoreError> {
        let now = Instant::now();
        let rows: Vec<DepositRow> = sqlx::query_as(
            r#"
            SELECT protocol, signature, timestamp, slot, amount, depositor, commitment,
                   spent, spent_at, withdrawal_signature
            FROM deposits
            ORDER BY timestamp DESC, slot DESC, signature ASC
            LIMIT ?
            "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        log_slow("Deposits loaded", now);
        Ok(rows.into_iter().map(Deposit::from).collect())
    }

    async fn get_withdrawals(&self, limit: usize) -> Result<Vec<Withdrawal>, StoreError> {
        let now = Instant::now();
        let rows: Vec<WithdrawalRow> = sqlx::query_as(
            r#"
            SELECT protocol, signature, timestamp, slot, amount, recipient, nullifier, relayer, fee
            FROM withdrawals
            ORDER BY timestamp DESC, slot DESC, signature ASC
            LIMIT ?
            "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        log_slow("Withdrawals loaded", now);
        Ok(rows.into_iter().map(Withdrawal::from).collect())
    }

    async fn get_transfers(&self, limit: usize) -> Result<Vec<Transfer>, StoreError> {
        let now = Instant::now();
        let rows: Vec<TransferRow> = sqlx::query_as(
            r#"
            SELECT protocol, signature, timestamp, slot, sender, recipient, amount, token,
                   decimals, kind, ciphertext
            FROM transfers
            ORDER BY timestamp DESC, slot DESC, signature ASC
            LIMIT ?
            "#,
        )
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        log_slow("Transfers loaded", now);
        rows.into_iter().map(Transfer::try_from).collect()
    }

    async fn get_stats(&self) -> Result<Stats, StoreError> {
        let now = Instant::now();
        let (total_deposits, unspent_deposits, unique_depositors): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN spent = 0 THEN 1 ELSE 0 END), 0),
                   COUNT(DISTINCT depositor)
            FROM deposits
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        let total_withdrawals: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM withdrawals")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;

        // SQL SUM would read the stored bits as signed and can overflow
        let deposited = self.sum_amounts("SELECT amount FROM deposits").await?;
        let withdrawn = self.sum_amounts("SELECT amount FROM withdrawals").await?;
        log_slow("Stats computed", now);

        let tvl = deposited.saturating_sub(withdrawn).min(u64::MAX as u128) as u64;
        Ok(Stats {
            total_deposits: total_deposits as u64,
            total_withdrawals: total_withdrawals as u64,
            unique_depositors: unique_depositors as u64,
            tvl,
            unspent_deposits: unspent_deposits as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deposit(sig: &str, timestamp: i64, amount: u64, depositor: &str) -> Deposit {
        Deposit {
            protocol: "pool".to_string(),
            signature: sig.to_string(),
            timestamp,
            slot: timestamp as u64 / 400,
            amount,
            depositor: depositor.to_string(),
            commitment: "unknown".to_string(),
            spent: false,
            spent_at: None,
            withdrawal_signature: None,
        }
    }

    fn withdrawal(sig: &str, timestamp: i64, amount: u64) -> Withdrawal {
        Withdrawal {
            protocol: "pool".to_string(),
            signature: sig.to_string(),
            timestamp,
            slot: timestamp as u64 / 400,
            amount,
            recipient: "bob".to_string(),
            nullifier: "unknown".to_string(),
            relayer: "relay".to_string(),
            fee: 6_000_000,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let d = deposit("d1", 1_000, 1_000_000_000, "alice");

        assert_eq!(store.upsert_deposit(&d).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_deposit(&d).await.unwrap(), UpsertOutcome::Duplicate);

        // Same signature under another protocol is a different row
        let mut other = d.clone();
        other.protocol = "other".to_string();
        assert_eq!(store.upsert_deposit(&other).await.unwrap(), UpsertOutcome::Inserted);

        let loaded = store.get_deposits(10).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&d));
    }

    #[tokio::test]
    async fn test_mark_spent_keeps_first_link() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_deposit(&deposit("d1", 1_000, 1_000_000_000, "alice")).await.unwrap();

        assert!(store.mark_deposit_spent("pool", "d1", "w1", 5_000).await.unwrap());
        assert!(!store.mark_deposit_spent("pool", "d1", "w2", 6_000).await.unwrap());
        assert!(matches!(
            store.mark_deposit_spent("pool", "missing", "w1", 5_000).await,
            Err(StoreError::NotFound(_))
        ));

        let d = &store.get_deposits(1).await.unwrap()[0];
        assert!(d.spent);
        assert_eq!(d.spent_at, Some(5_000));
        assert_eq!(d.withdrawal_signature.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_newest_first_with_limit() {
        let store = SqliteStore::in_memory().await.unwrap();
        for (i, sig) in ["a", "b", "c"].iter().enumerate() {
            store
                .upsert_withdrawal(&withdrawal(sig, (i as i64 + 1) * 1_000, 1_000_000))
                .await
                .unwrap();
        }
        let loaded = store.get_withdrawals(2).await.unwrap();
        let sigs: Vec<&str> = loaded.iter().map(|w| w.signature.as_str()).collect();
        assert_eq!(sigs, vec!["c", "b"]);
        assert_eq!(loaded[0].fee, 6_000_000);
    }

    #[tokio::test]
    async fn test_transfer_kind_and_concealed_amount() {
        let store = SqliteStore::in_memory().await.unwrap();
        let t = Transfer {
            protocol: "ct".to_string(),
            signature: "t1".to_string(),
            timestamp: 1_000,
            slot: 2,
            sender: "alice".to_string(),
            recipient: "bob".to_string(),
            amount: None,
            token: "mint".to_string(),
            decimals: 6,
            kind: TransferKind::Confidential,
            ciphertext: Some("AAEC".to_string()),
        };
        assert_eq!(store.upsert_transfer(&t).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_transfer(&t).await.unwrap(), UpsertOutcome::Duplicate);
        assert_eq!(store.get_transfers(10).await.unwrap(), vec![t]);
    }

    #[tokio::test]
    async fn test_stats_match_memory_store() {
        let sqlite = SqliteStore::in_memory().await.unwrap();
        let memory = mixscope::MemoryStore::new();
        let deposits = [
            deposit("d1", 1_000, 1_000_000_000, "alice"),
            deposit("d2", 2_000, 2_000_000_000, "alice"),
            deposit("d3", 3_000, 500_000_000, "carol"),
        ];
        let withdrawals = [withdrawal("w1", 4_000, 994_000_000)];

        for store in [&sqlite as &dyn Store, &memory as &dyn Store] {
            for d in &deposits {
                store.upsert_deposit(d).await.unwrap();
            }
            for w in &withdrawals {
                store.upsert_withdrawal(w).await.unwrap();
            }
            store.mark_deposit_spent("pool", "d1", "w1", 4_000).await.unwrap();
        }

        let stats = sqlite.get_stats().await.unwrap();
        assert_eq!(stats, memory.get_stats().await.unwrap());
        assert_eq!(stats.total_deposits, 3);
        assert_eq!(stats.unique_depositors, 2);
        assert_eq!(stats.unspent_deposits, 2);
        assert_eq!(stats.tvl, 3_500_000_000 - 994_000_000);
    }

    #[tokio::test]
    async fn test_stats_with_amounts_above_i64_max() {
        let sqlite = SqliteStore::in_memory().await.unwrap();
        let memory = mixscope::MemoryStore::new();
        let deposits = [
            deposit("d1", 1_000, u64::MAX - 1, "alice"),
            deposit("d2", 2_000, u64::MAX - 1, "bob"),
        ];
        let w = withdrawal("w1", 3_000, u64::MAX);

        for store in [&sqlite as &dyn Store, &memory as &dyn Store] {
            for d in &deposits {
                store.upsert_deposit(d).await.unwrap();
            }
            store.upsert_withdrawal(&w).await.unwrap();
        }

        let stats = sqlite.get_stats().await.unwrap();
        assert_eq!(stats, memory.get_stats().await.unwrap());
        assert_eq!(stats.tvl, u64::MAX - 2);
        let stored = sqlite.get_deposits(10).await.unwrap();
        assert!(stored.iter().all(|d| d.amount == u64::MAX - 1));
    }

    #[tokio::test]
    async fn test_empty_stats() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.get_stats().await.unwrap(), Stats::default());
    }
}
