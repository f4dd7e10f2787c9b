//! Timing/amount correlation
//!
//! For each withdrawal, every deposit that could plausibly have funded it is a
//! candidate. The number of candidates is the withdrawal's anonymity set; each
//! candidate is scored by how well its timing and amount fit.
//!
//! Candidate filter for deposit `d` and withdrawal `w`:
//! - `d.timestamp <= w.timestamp`
//! - `w.timestamp - d.timestamp <= max_window`
//! - `d.amount >= w.amount` and `(d.amount - w.amount) / d.amount <= max_fee_bps / 10000`
//!
//! Scores (each in [0, 1], multiplied):
//! - time:   `exp(-delta / (max_window / 5))`, 1 at delta 0, about 0.007 at the window edge
//! - amount: `1 - |d.amount - w.amount - fee| / d.amount`, where `fee` is the
//!   withdrawal's observed fee, or `expected_fee_bps` of the deposit when none was seen
//!
//! Ranking is by confidence, then by smaller time delta, then by deposit
//! signature, so results are reproducible for the same input.

mod engine;
mod metrics;

pub use engine::{CorrelationEngine, EngineHandle};
pub use metrics::{MetricsSnapshot, PrivacyMetrics};

use crate::consts::{
    BPS, DEFAULT_EXPECTED_FEE_BPS, DEFAULT_MAX_FEE_BPS, DEFAULT_MAX_WINDOW_MS,
    DEFAULT_SPEND_CONFIDENCE, TIME_DECAY_DIVISOR,
};
use crate::types::{CorrelationResult, Deposit, LikelySource, VulnerabilityLevel, Withdrawal};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelationConfig {
    /// Longest deposit-to-withdrawal gap still considered, in milliseconds.
    pub max_window_ms: i64,
    /// Largest fee ratio accepted by the candidate filter.
    pub max_fee_bps: u64,
    /// Fee assumed by the amount score when the withdrawal shows none.
    pub expected_fee_bps: u64,
    /// Confidence a unique candidate needs before its deposit is marked spent.
    pub spend_confidence: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_window_ms: DEFAULT_MAX_WINDOW_MS,
            max_fee_bps: DEFAULT_MAX_FEE_BPS,
            expected_fee_bps: DEFAULT_EXPECTED_FEE_BPS,
            spend_confidence: DEFAULT_SPEND_CONFIDENCE,
        }
    }
}

impl CorrelationConfig {
    pub fn is_candidate(&self, deposit: &Deposit, withdrawal: &Withdrawal) -> bool {
        let delta = withdrawal.timestamp.saturating_sub(deposit.timestamp);
        if deposit.timestamp > withdrawal.timestamp || delta > self.max_window_ms {
            return false;
        }
        if deposit.amount == 0 || deposit.amount < withdrawal.amount {
            return false;
        }
        let fee = (deposit.amount - withdrawal.amount) as u128;
        fee * BPS as u128 <= self.max_fee_bps as u128 * deposit.amount as u128
    }

    /// Decays from 1 at zero delay towards 0 at the window edge.
    pub fn time_score(&self, time_delta: i64) -> f64 {
        if time_delta <= 0 {
            return 1.0;
        }
        if self.max_window_ms <= 0 {
            return 0.0;
        }
        let tau = self.max_window_ms as f64 / TIME_DECAY_DIVISOR;
        (-(time_delta as f64) / tau).exp().clamp(0.0, 1.0)
    }

    /// 1 for an exact fee-accounted match, falling linearly with the residual.
    pub fn amount_score(&self, deposit: &Deposit, withdrawal: &Withdrawal) -> f64 {
        if deposit.amount == 0 {
            return 0.0;
        }
        let fee = if withdrawal.fee > 0 {
            withdrawal.fee as i128
        } else {
            (deposit.amount as u128 * self.expected_fee_bps as u128 / BPS as u128) as i128
        };
        let residual = (deposit.amount as i128 - withdrawal.amount as i128 - fee).unsigned_abs();
        (1.0 - residual as f64 / deposit.amount as f64).clamp(0.0, 1.0)
    }

    pub fn confidence(&self, deposit: &Deposit, withdrawal: &Withdrawal) -> f64 {
        let delta = withdrawal.timestamp.saturating_sub(deposit.timestamp);
        self.time_score(delta) * self.amount_score(deposit, withdrawal)
    }
}

/// Anonymity set and ranked candidate sources of `withdrawal`.
pub fn analyze<'a>(
    withdrawal: &Withdrawal,
    deposits: impl IntoIterator<Item = &'a Deposit>,
    config: &CorrelationConfig,
) -> CorrelationResult {
    let mut likely_sources: Vec<LikelySource> = deposits
        .into_iter()
        .filter(|d| config.is_candidate(d, withdrawal))
        .map(|d| LikelySource {
            deposit: d.clone(),
            confidence: config.confidence(d, withdrawal),
            time_delta: withdrawal.timestamp - d.timestamp,
        })
        .collect();

    likely_sources.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.time_delta.cmp(&b.time_delta))
            .then_with(|| a.deposit.signature.cmp(&b.deposit.signature))
    });

    let anonymity_set = likely_sources.len();
    CorrelationResult {
        withdrawal: withdrawal.clone(),
        anonymity_set,
        likely_sources,
        vulnerability_level: VulnerabilityLevel::from_anonymity_set(anonymity_set),
    }
}

/// Same anonymity set and the same ranked links with the same confidences.
/// Ignores spend state carried on the deposits.
pub fn same_links(a: &CorrelationResult, b: &CorrelationResult) -> bool {
    a.anonymity_set == b.anonymity_set
        && a.likely_sources.len() == b.likely_sources.len()
        && a.likely_sources.iter().zip(&b.likely_sources).all(|(x, y)| {
            x.deposit.signature == y.deposit.signature
                && x.confidence.to_bits() == y.confidence.to_bits()
                && x.time_delta == y.time_delta
        })
}
