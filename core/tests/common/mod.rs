#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use mixscope::{
    ChainDataSource, ParserConfig, ParserKind, ProtocolConfig, RawTransaction, SignatureInfo,
    SourceError,
};
use serde_json::json;

// ============================================================================
// Addresses
// ============================================================================

pub const POOL: &str = "oreV3EG1i9BEgiAJ8b177Z2S2rMarzak4NMv1kULvWv";
pub const OTHER_POOL: &str = "6kJMMw6psY1MjH3T3yK351uw1FL1aE7rF3xKFz4prHb";
pub const DEPOSITOR: &str = "45db2FSR4mcXdSVVZbKbwojU6uYDpMyhpEi7cC8nHaWG";
pub const RELAYER: &str = "56qSi79jWdM1zie17NKFvdsh213wPb15HHUqGUjmJ2Lr";
pub const RECIPIENT: &str = "oreoU2P8bN6jkk3jbaiVxYnG1dCXcYxwhwyK9jSybcp";

pub const BLOCK_TIME: i64 = 1_700_000_000;
pub const NETWORK_FEE: u64 = 5_000;

// ============================================================================
// Scripted Chain Data Source
// ============================================================================

/// In-memory chain: fixed signature lists per address, stored transactions,
/// and optional scripted failures per signature.
#[derive(Default)]
pub struct ScriptedSource {
    signatures: HashMap<String, Vec<SignatureInfo>>,
    transactions: HashMap<String, RawTransaction>,
    scripted: Mutex<HashMap<String, VecDeque<Result<Option<RawTransaction>, SourceError>>>>,
    failing_addresses: HashSet<String>,
    pub calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `tx` to `address`'s history. Call oldest first; pages are
    /// served newest first.
    pub fn with_tx(mut self, address: &str, tx: RawTransaction) -> Self {
        let signature = tx.transaction.signatures[0].clone();
        let info = SignatureInfo {
            signature: signature.clone(),
            slot: tx.slot,
            block_time: tx.block_time,
            err: tx.meta.as_ref().and_then(|m| m.err.clone()),
        };
        self.signatures
            .entry(address.to_string())
            .or_default()
            .insert(0, info);
        self.transactions.insert(signature, tx);
        self
    }

    /// Responses returned for `signature` before falling back to the stored tx.
    pub fn with_script(
        self,
        signature: &str,
        responses: Vec<Result<Option<RawTransaction>, SourceError>>,
    ) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .insert(signature.to_string(), responses.into());
        self
    }

    pub fn with_failing_address(mut self, address: &str) -> Self {
        self.failing_addresses.insert(address.to_string());
        self
    }
}

#[async_trait]
impl ChainDataSource for ScriptedSource {
    async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<SignatureInfo>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_addresses.contains(address) {
            return Err(SourceError::Other("connection refused".to_string()));
        }
        let all = self.signatures.get(address).cloned().unwrap_or_default();
        let start = match before {
            Some(b) => all
                .iter()
                .position(|s| s.signature == b)
                .map(|p| p + 1)
                .unwrap_or(all.len()),
            None => 0,
        };
        Ok(all.into_iter().skip(start).take(limit).collect())
    }

    async fn get_parsed_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<RawTransaction>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(queue) = self.scripted.lock().unwrap().get_mut(signature) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        Ok(self.transactions.get(signature).cloned())
    }
}

pub fn rate_limited() -> Result<Option<RawTransaction>, SourceError> {
    Err(SourceError::RateLimited("HTTP 429 Too Many Requests".to_string()))
}

// ============================================================================
// Transaction Builders
// ============================================================================

fn native_tx(signature: &str, block_time: i64, accounts: &[(&str, u64, u64)]) -> RawTransaction {
    let keys: Vec<&str> = accounts.iter().map(|a| a.0).collect();
    let pre: Vec<u64> = accounts.iter().map(|a| a.1).collect();
    let post: Vec<u64> = accounts.iter().map(|a| a.2).collect();
    serde_json::from_value(json!({
        "slot": 250_000_000u64 + (block_time - BLOCK_TIME) as u64,
        "blockTime": block_time,
        "transaction": {
            "signatures": [signature],
            "message": { "accountKeys": keys, "instructions": [] }
        },
        "meta": {
            "err": null,
            "fee": NETWORK_FEE,
            "preBalances": pre,
            "postBalances": post,
            "logMessages": ["Program log: Instruction: Transact"]
        }
    }))
    .unwrap()
}

/// Depositor pays `amount` into the pool.
pub fn deposit_tx(signature: &str, block_time: i64, amount: u64) -> RawTransaction {
    let start = 10_000_000_000;
    native_tx(
        signature,
        block_time,
        &[
            (DEPOSITOR, start, start - amount - NETWORK_FEE),
            (POOL, 50_000_000_000, 50_000_000_000 + amount),
        ],
    )
}

/// Relayer submits; pool pays `amount` to the recipient and `relayer_fee` to the relayer.
pub fn withdrawal_tx(signature: &str, block_time: i64, amount: u64, relayer_fee: u64) -> RawTransaction {
    native_tx(
        signature,
        block_time,
        &[
            (RELAYER, 1_000_000_000, 1_000_000_000 + relayer_fee - NETWORK_FEE),
            (POOL, 50_000_000_000, 50_000_000_000 - amount - relayer_fee),
            (RECIPIENT, 0, amount),
        ],
    )
}

/// Payer moves dust: parses to nothing.
pub fn dust_tx(signature: &str, block_time: i64) -> RawTransaction {
    native_tx(
        signature,
        block_time,
        &[(DEPOSITOR, 1_000_000_000, 999_000_000 - NETWORK_FEE), (POOL, 0, 1_000_000)],
    )
}

pub fn failed_tx(signature: &str, block_time: i64) -> RawTransaction {
    let mut tx = deposit_tx(signature, block_time, 1_000_000_000);
    if let Some(meta) = tx.meta.as_mut() {
        meta.err = Some(json!({"InstructionError": [0, {"Custom": 1}]}));
    }
    tx
}

pub fn balance_flow_protocol(id: &str, program_id: &str) -> ProtocolConfig {
    ProtocolConfig {
        id: id.to_string(),
        name: None,
        program_id: program_id.to_string(),
        parser: ParserKind::BalanceFlow,
        enabled: true,
        parser_config: ParserConfig::default(),
    }
}
