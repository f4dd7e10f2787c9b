use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{CorrelationResult, Stats, VulnerabilityLevel};

/// Summary of how well a protocol hides deposit/withdrawal links.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyMetrics {
    /// Withdrawals analyzed
    pub analyzed: u64,
    /// Withdrawals with at least one candidate source
    pub linkable: u64,
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    /// Over linkable withdrawals only; an empty set is inconclusive
    pub average_anonymity_set: f64,
    pub median_anonymity_set: f64,
}

impl PrivacyMetrics {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a CorrelationResult>) -> Self {
        let mut metrics = PrivacyMetrics::default();
        let mut sizes: Vec<usize> = Vec::new();

        for result in results {
            metrics.analyzed += 1;
            match result.vulnerability_level {
                VulnerabilityLevel::Critical => metrics.critical += 1,
                VulnerabilityLevel::High => metrics.high += 1,
                VulnerabilityLevel::Medium => metrics.medium += 1,
                VulnerabilityLevel::Low => metrics.low += 1,
            }
            if result.anonymity_set > 0 {
                metrics.linkable += 1;
                sizes.push(result.anonymity_set);
            }
        }

        if !sizes.is_empty() {
            sizes.sort_unstable();
            metrics.average_anonymity_set = sizes.iter().sum::<usize>() as f64 / sizes.len() as f64;
            let mid = sizes.len() / 2;
            metrics.median_anonymity_set = if sizes.len() % 2 == 0 {
                (sizes[mid - 1] + sizes[mid]) as f64 / 2.0
            } else {
                sizes[mid] as f64
            };
        }
        metrics
    }
}

/// Payload of `metrics:updated`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub stats: Stats,
    pub overall: PrivacyMetrics,
    pub protocols: BTreeMap<String, PrivacyMetrics>,
}
