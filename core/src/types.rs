use serde::{Deserialize, Serialize};

// ============================================================================
// Domain Events
// ============================================================================

/// Funds entering a privacy pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub protocol: String,
    pub signature: String,
    /// Block time in milliseconds.
    pub timestamp: i64,
    pub slot: u64,
    /// Smallest unit (lamports or token base units).
    pub amount: u64,
    pub depositor: String,
    /// Opaque proof tag, or "unknown".
    pub commitment: String,
    pub spent: bool,
    pub spent_at: Option<i64>,
    pub withdrawal_signature: Option<String>,
}

impl Deposit {
    /// Check-then-set spend transition. Returns true only on the call that
    /// actually flips `spent`; later calls leave the first link in place.
    pub fn mark_spent(&mut self, withdrawal_signature: &str, spent_at: i64) -> bool {
        if self.spent {
            return false;
        }
        self.spent = true;
        self.spent_at = Some(spent_at);
        self.withdrawal_signature = Some(withdrawal_signature.to_string());
        true
    }
}

/// Funds leaving a privacy pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {
    pub protocol: String,
    pub signature: String,
    /// Block time in milliseconds.
    pub timestamp: i64,
    pub slot: u64,
    pub amount: u64,
    pub recipient: String,
    /// Opaque proof tag, or "unknown".
    pub nullifier: String,
    /// Relayer address, or "unknown".
    pub relayer: String,
    /// Fee observed on-chain, 0 when it could not be reconstructed.
    pub fee: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Plain or unclassified transfer.
    Transfer,
    /// Confidential transfer; amount is encrypted.
    Confidential,
    /// Public balance moved into a confidential balance.
    ConfidentialDeposit,
    /// Confidential balance moved back to a public balance.
    ConfidentialWithdraw,
}

/// Generic transfer for protocols without a deposit/withdrawal distinction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub protocol: String,
    pub signature: String,
    pub timestamp: i64,
    pub slot: u64,
    pub sender: String,
    pub recipient: String,
    /// None when the amount is concealed from this analysis.
    pub amount: Option<u64>,
    pub token: String,
    pub decimals: u8,
    pub kind: TransferKind,
    /// Opaque encrypted amount, kept verbatim. Unrecoverable without the
    /// owner's decryption key.
    pub ciphertext: Option<String>,
}

// ============================================================================
// Correlation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VulnerabilityLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl VulnerabilityLevel {
    /// Banding of anonymity set size. An empty set is inconclusive and bands
    /// as low.
    pub fn from_anonymity_set(size: usize) -> Self {
        match size {
            0 => VulnerabilityLevel::Low,
            1 => VulnerabilityLevel::Critical,
            2..=5 => VulnerabilityLevel::High,
            6..=20 => VulnerabilityLevel::Medium,
            _ => VulnerabilityLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VulnerabilityLevel::Low => "low",
            VulnerabilityLevel::Medium => "medium",
            VulnerabilityLevel::High => "high",
            VulnerabilityLevel::Critical => "critical",
        }
    }
}

/// A candidate source deposit for a withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikelySource {
    pub deposit: Deposit,
    /// In [0, 1].
    pub confidence: f64,
    /// withdrawal.timestamp - deposit.timestamp, in milliseconds.
    pub time_delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationResult {
    pub withdrawal: Withdrawal,
    pub anonymity_set: usize,
    /// Ordered by descending confidence.
    pub likely_sources: Vec<LikelySource>,
    pub vulnerability_level: VulnerabilityLevel,
}

impl CorrelationResult {
    pub fn top_source(&self) -> Option<&LikelySource> {
        self.likely_sources.first()
    }
}

// ============================================================================
// Indexer Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexerState {
    Starting,
    Indexing,
    Complete,
    Error,
}

/// Ephemeral progress report, published on the bus and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerStatus {
    pub protocol: String,
    pub status: IndexerState,
    /// Percent complete, 0-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IndexerStatus {
    pub fn starting(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            status: IndexerState::Starting,
            progress: None,
            message: None,
        }
    }

    pub fn indexing(protocol: &str, done: usize, total: usize) -> Self {
        let progress = if total == 0 {
            100
        } else {
            ((done.min(total) * 100) / total) as u8
        };
        Self {
            protocol: protocol.to_string(),
            status: IndexerState::Indexing,
            progress: Some(progress),
            message: Some(format!("{}/{} transactions", done, total)),
        }
    }

    pub fn complete(protocol: &str, message: String) -> Self {
        Self {
            protocol: protocol.to_string(),
            status: IndexerState::Complete,
            progress: Some(100),
            message: Some(message),
        }
    }

    pub fn error(protocol: &str, message: String) -> Self {
        Self {
            protocol: protocol.to_string(),
            status: IndexerState::Error,
            progress: None,
            message: Some(message),
        }
    }
}

// ============================================================================
// Store Aggregates
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_deposits: u64,
    pub total_withdrawals: u64,
    pub unique_depositors: u64,
    /// Deposited minus withdrawn, floored at zero.
    pub tvl: u64,
    pub unspent_deposits: u64,
}
