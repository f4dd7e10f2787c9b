mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use mixscope::consts::DEFAULT_MAX_WINDOW_MS;
use mixscope::{
    analyze, CorrelationConfig, Deposit, FetchClient, FetchError, RetryPolicy, VulnerabilityLevel,
    Withdrawal,
};

fn deposit(sig: &str, timestamp: i64, amount: u64) -> Deposit {
    Deposit {
        protocol: "pool".to_string(),
        signature: sig.to_string(),
        timestamp,
        slot: 0,
        amount,
        depositor: DEPOSITOR.to_string(),
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
        slot: 0,
        amount,
        recipient: RECIPIENT.to_string(),
        nullifier: "unknown".to_string(),
        relayer: "unknown".to_string(),
        fee: 0,
    }
}

// ============================================================================
// Correlation Scenarios
// ============================================================================

#[test]
fn test_unique_candidate_is_critical() {
    let config = CorrelationConfig::default();
    let d1 = deposit("D1", 0, 1_000_000_000);
    let w1 = withdrawal("W1", 600_000, 994_000_000);

    let result = analyze(&w1, [&d1], &config);

    assert_eq!(result.anonymity_set, 1);
    assert_eq!(result.likely_sources.len(), 1);
    assert_eq!(result.likely_sources[0].deposit.signature, "D1");
    assert_eq!(result.likely_sources[0].time_delta, 600_000);
    assert_eq!(result.vulnerability_level, VulnerabilityLevel::Critical);
    assert!(result.likely_sources[0].confidence > 0.99);
}

#[test]
fn test_two_candidates_closer_deposit_ranks_first() {
    let config = CorrelationConfig::default();
    let d1 = deposit("D1", 0, 1_000_000_000);
    let d2 = deposit("D2", 5_000, 1_000_000_000);
    let w1 = withdrawal("W1", 600_000, 994_000_000);

    let result = analyze(&w1, [&d1, &d2], &config);

    assert_eq!(result.anonymity_set, 2);
    assert_eq!(result.vulnerability_level, VulnerabilityLevel::High);
    let order: Vec<&str> = result
        .likely_sources
        .iter()
        .map(|s| s.deposit.signature.as_str())
        .collect();
    assert_eq!(order, vec!["D2", "D1"]);
    assert!(result.likely_sources[0].confidence > result.likely_sources[1].confidence);
}

#[test]
fn test_withdrawal_just_outside_window_has_no_candidates() {
    let config = CorrelationConfig::default();
    let d1 = deposit("D1", 0, 1_000_000_000);
    let w1 = withdrawal("W1", DEFAULT_MAX_WINDOW_MS + 1, 994_000_000);

    let result = analyze(&w1, [&d1], &config);

    assert_eq!(result.anonymity_set, 0);
    assert!(result.likely_sources.is_empty());
    assert_eq!(result.vulnerability_level, VulnerabilityLevel::Low);
}

// ============================================================================
// Properties
// ============================================================================

/// Deterministic spread of deposits across amounts and times.
fn deposit_grid() -> Vec<Deposit> {
    (0..40)
        .map(|i: i64| {
            let amount = 1_000_000_000 + (i as u64 % 7) * 10_000_000;
            deposit(&format!("D{:02}", i), i * 3_600_000 * 20, amount)
        })
        .collect()
}

#[test]
fn test_result_invariants_hold() {
    let config = CorrelationConfig::default();
    let deposits = deposit_grid();

    for (i, amount) in [(5_i64, 994_000_000_u64), (30, 1_020_000_000), (60, 1_000_000_000)] {
        let w = withdrawal(&format!("W{}", i), i * 3_600_000 * 24, amount);
        let result = analyze(&w, &deposits, &config);

        assert_eq!(result.anonymity_set, result.likely_sources.len());
        assert!(result
            .likely_sources
            .windows(2)
            .all(|pair| pair[0].confidence >= pair[1].confidence));
        for source in &result.likely_sources {
            assert!(source.deposit.timestamp <= w.timestamp);
            assert!(w.timestamp - source.deposit.timestamp <= config.max_window_ms);
            assert!((0.0..=1.0).contains(&source.confidence));
        }
    }
}

#[test]
fn test_analyze_is_idempotent() {
    let config = CorrelationConfig::default();
    let deposits = deposit_grid();
    let w = withdrawal("W", 10 * 3_600_000 * 24, 994_000_000);

    let first = analyze(&w, &deposits, &config);
    let second = analyze(&w, &deposits, &config);
    assert_eq!(first, second);

    // Input order does not matter either
    let reversed: Vec<Deposit> = deposits.iter().rev().cloned().collect();
    assert_eq!(first, analyze(&w, &reversed, &config));
}

#[test]
fn test_spend_is_exactly_once() {
    let mut d = deposit("D1", 0, 1_000_000_000);
    assert!(d.mark_spent("W1", 600_000));
    assert!(!d.mark_spent("W1", 600_000));
    assert!(!d.mark_spent("W2", 700_000));
    assert_eq!(d.spent_at, Some(600_000));
    assert_eq!(d.withdrawal_signature.as_deref(), Some("W1"));
}

// ============================================================================
// Rate-limit Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rate_limited_fetch_recovers_on_fourth_attempt() {
    let tx = deposit_tx("sigD", BLOCK_TIME, 1_000_000_000);
    let source = ScriptedSource::new().with_tx(POOL, tx.clone()).with_script(
        "sigD",
        vec![rate_limited(), rate_limited(), rate_limited()],
    );
    let source = Arc::new(source);
    let client = FetchClient::new(source.clone(), RetryPolicy::default());

    let start = tokio::time::Instant::now();
    let fetched = client.fetch_transaction("sigD").await.unwrap().unwrap();
    let elapsed = start.elapsed();

    assert_eq!(fetched.signature(), Some("sigD"));
    assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    // 2s + 4s + 8s
    assert!(elapsed >= Duration::from_secs(14), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(14_500), "elapsed {:?}", elapsed);
    assert_eq!(client.policy().total_backoff(), Duration::from_secs(14));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_exhaustion_is_per_item() {
    let source = ScriptedSource::new()
        .with_tx(POOL, deposit_tx("sigA", BLOCK_TIME, 1_000_000_000))
        .with_tx(POOL, deposit_tx("sigB", BLOCK_TIME + 1, 1_000_000_000))
        .with_script("sigA", vec![rate_limited(); 4]);
    let client = FetchClient::new(Arc::new(source), RetryPolicy::default());

    match client.fetch_transaction("sigA").await {
        Err(FetchError::RateLimited { attempts, .. }) => assert_eq!(attempts, 4),
        other => panic!("expected rate limit failure, got {:?}", other.map(|t| t.is_some())),
    }
    // The next item is unaffected
    assert!(client.fetch_transaction("sigB").await.unwrap().is_some());
}
