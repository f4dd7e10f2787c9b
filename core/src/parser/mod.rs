//! Protocol parsers
//!
//! Each parser maps one raw transaction to zero or one domain event. Parsers
//! are total: malformed or ambiguous input yields `None` (with the reason
//! available through `classify`), never a panic or an error.

pub mod address_pattern;
pub mod balance_flow;
pub mod confidential;

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::{ParserKind, ProtocolConfig};
use crate::consts::UNKNOWN;
use crate::raw::RawTransaction;
use crate::types::{Deposit, Transfer, Withdrawal};

pub use address_pattern::AddressPatternParser;
pub use balance_flow::BalanceFlowParser;
pub use confidential::ConfidentialParser;

/// Output of a successful parse
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Deposit(Deposit),
    Withdrawal(Withdrawal),
    Transfer(Transfer),
}

impl DomainEvent {
    pub fn signature(&self) -> &str {
        match self {
            DomainEvent::Deposit(d) => &d.signature,
            DomainEvent::Withdrawal(w) => &w.signature,
            DomainEvent::Transfer(t) => &t.signature,
        }
    }
}

/// Why a transaction produced no event. Counted as "unknown", never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unclassified {
    /// The transaction failed on-chain
    Failed,
    MissingMeta,
    MissingSignature,
    MissingBlockTime,
    /// A needed account key is absent from the message
    MissingAccountKey,
    /// No flow crossed the configured thresholds
    NoSignificantFlow,
    /// Two or more accounts tie for the largest gain
    AmbiguousGainers,
    /// Two or more accounts tie for the largest loss
    AmbiguousLosers,
    /// None of the configured relay addresses moved funds
    RelayNotInvolved,
    /// No confidential-transfer activity in logs or instructions
    NotConfidentialTransfer,
    /// Confidential activity without visible token account owners
    MissingOwners,
}

/// Signature, block time and slot shared by every event.
pub(crate) struct TxContext<'a> {
    pub signature: &'a str,
    pub timestamp: i64,
    pub slot: u64,
}

pub(crate) fn tx_context(tx: &RawTransaction) -> Result<TxContext<'_>, Unclassified> {
    if tx.meta.is_none() {
        return Err(Unclassified::MissingMeta);
    }
    if tx.is_failed() {
        return Err(Unclassified::Failed);
    }
    let signature = tx.signature().ok_or(Unclassified::MissingSignature)?;
    let timestamp = tx.timestamp_ms().ok_or(Unclassified::MissingBlockTime)?;
    Ok(TxContext {
        signature,
        timestamp,
        slot: tx.slot,
    })
}

/// Proof tags logged as "commitment: <hex>" / "nullifier: <hex>".
static PROOF_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(commitment|nullifier)(?:\s+hash)?\s*[:=]\s*(?:0x)?([0-9a-f]{16,128})\b")
        .expect("Invalid proof tag regex")
});

/// First `tag` found in the logs, or "unknown".
pub(crate) fn extract_proof_tag(logs: &[String], tag: &str) -> String {
    logs.iter()
        .filter_map(|log| PROOF_TAG_REGEX.captures(log))
        .find(|cap| cap[1].eq_ignore_ascii_case(tag))
        .map(|cap| cap[2].to_lowercase())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

#[derive(Debug, Clone)]
enum ParserImpl {
    BalanceFlow(BalanceFlowParser),
    AddressPattern(AddressPatternParser),
    Confidential(ConfidentialParser),
}

/// The parser bound to one protocol.
#[derive(Debug, Clone)]
pub struct ProtocolParser {
    protocol: String,
    inner: ParserImpl,
}

impl ProtocolParser {
    pub fn from_config(config: &ProtocolConfig) -> Self {
        let pc = &config.parser_config;
        let inner = match config.parser {
            ParserKind::BalanceFlow => ParserImpl::BalanceFlow(BalanceFlowParser::new(
                pc.deposit_threshold,
                pc.withdrawal_threshold,
            )),
            ParserKind::AddressPattern => ParserImpl::AddressPattern(AddressPatternParser::new(
                pc.relay_addresses.iter().cloned(),
                pc.deposit_threshold,
                pc.withdrawal_threshold,
                pc.mint.clone(),
            )),
            ParserKind::ConfidentialTransfer => {
                ParserImpl::Confidential(ConfidentialParser::new(pc.mint.clone()))
            }
        };
        Self {
            protocol: config.id.clone(),
            inner,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn kind(&self) -> ParserKind {
        match self.inner {
            ParserImpl::BalanceFlow(_) => ParserKind::BalanceFlow,
            ParserImpl::AddressPattern(_) => ParserKind::AddressPattern,
            ParserImpl::Confidential(_) => ParserKind::ConfidentialTransfer,
        }
    }

    /// Event for `tx`, or the reason there is none.
    pub fn classify(&self, tx: &RawTransaction) -> Result<DomainEvent, Unclassified> {
        match &self.inner {
            ParserImpl::BalanceFlow(p) => p.parse(&self.protocol, tx),
            ParserImpl::AddressPattern(p) => p.parse(&self.protocol, tx),
            ParserImpl::Confidential(p) => p.parse(&self.protocol, tx),
        }
    }

    pub fn parse(&self, tx: &RawTransaction) -> Option<DomainEvent> {
        match self.classify(tx) {
            Ok(event) => Some(event),
            Err(reason) => {
                tracing::debug!(
                    "{}: skipping {} ({:?})",
                    self.protocol,
                    tx.signature().unwrap_or(UNKNOWN),
                    reason
                );
                None
            }
        }
    }
}
