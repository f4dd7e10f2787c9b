//! Fetch client - paced, retrying gateway to the chain data source
//!
//! All chain reads from indexers go through this module.
//! Provides:
//! - Steady request pacing (fixed minimum interval between calls, even on success)
//! - Exponential backoff on rate-limit failures, bounded retry count
//! - Immediate failure on any other provider error
//!
//! Backoff schedule with the defaults (base 2s, 3 retries): 2s, 4s, 8s, then
//! the call fails with `FetchError::RateLimited` after 4 attempts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::consts::{
    DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_INTERVAL_MS, DEFAULT_RETRY_BASE_DELAY_MS,
    MAX_SIGNATURE_PAGE,
};
use crate::error::{FetchError, SourceError};
use crate::raw::RawTransaction;

/// One entry of a `getSignaturesForAddress` page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    /// Non-null when the transaction failed on-chain.
    #[serde(default)]
    pub err: Option<Value>,
}

impl SignatureInfo {
    pub fn is_failed(&self) -> bool {
        matches!(&self.err, Some(err) if !err.is_null())
    }
}

/// The unreliable, rate-limited upstream. Implementations classify their own
/// failures into `SourceError::RateLimited` or `SourceError::Other`.
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    /// Newest-first signatures for `address`, starting before `before` when set.
    async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<SignatureInfo>, SourceError>;

    /// `Ok(None)` when the provider does not know the transaction.
    async fn get_parsed_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<RawTransaction>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First backoff delay; doubles on every retry.
    pub base_delay: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Minimum spacing between consecutive requests.
    pub request_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            request_interval: Duration::from_millis(DEFAULT_REQUEST_INTERVAL_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base * 2^retry.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }

    /// Total wait if every retry is used.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries).map(|r| self.backoff(r)).sum()
    }
}

pub struct FetchClient {
    source: Arc<dyn ChainDataSource>,
    policy: RetryPolicy,
    last_request_at: Mutex<Option<Instant>>,
}

impl FetchClient {
    pub fn new(source: Arc<dyn ChainDataSource>, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            last_request_at: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Rate limit: wait if we're calling too fast. The lock is held across the
    /// wait so concurrent callers queue up behind each other.
    async fn pace(&self) {
        let mut last = self.last_request_at.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.policy.request_interval {
                tokio::time::sleep(self.policy.request_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn with_retry<T, F, Fut>(&self, method: &str, target: &str, call: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut retry = 0;
        loop {
            self.pace().await;
            match call().await {
                Ok(value) => return Ok(value),
                Err(SourceError::RateLimited(message)) => {
                    if retry >= self.policy.max_retries {
                        tracing::warn!(
                            "{} ({}) still rate limited after {} attempts, skipping",
                            method,
                            target,
                            retry + 1
                        );
                        return Err(FetchError::RateLimited {
                            attempts: retry + 1,
                            message,
                        });
                    }
                    let delay = self.policy.backoff(retry);
                    tracing::warn!(
                        "{} ({}) rate limited (attempt {}/{}), backing off {}ms",
                        method,
                        target,
                        retry + 1,
                        self.policy.max_retries + 1,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(SourceError::Other(message)) => {
                    tracing::warn!("{} ({}) failed: {}", method, target, message);
                    return Err(FetchError::FetchFailed(message));
                }
            }
        }
    }

    /// Up to `limit` newest-first signatures for `address`, paging backwards
    /// from `cursor` (exclusive) when given.
    pub async fn fetch_signatures(
        &self,
        address: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Vec<SignatureInfo>, FetchError> {
        let mut all_sigs: Vec<SignatureInfo> = Vec::new();
        let mut before: Option<String> = cursor.map(str::to_string);

        while all_sigs.len() < limit {
            let page_size = (limit - all_sigs.len()).min(MAX_SIGNATURE_PAGE);
            let page = self
                .with_retry("getSignaturesForAddress", address, || {
                    self.source
                        .get_signatures_for_address(address, page_size, before.as_deref())
                })
                .await?;

            let count = page.len();
            if let Some(last) = page.last() {
                before = Some(last.signature.clone());
            }
            all_sigs.extend(page);

            if count < page_size {
                break; // No more pages
            }
        }

        all_sigs.truncate(limit);
        Ok(all_sigs)
    }

    pub async fn fetch_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<RawTransaction>, FetchError> {
        self.with_retry("getTransaction", signature, || {
            self.source.get_parsed_transaction(signature)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted transaction responses and serves a fixed signature list.
    struct ScriptedSource {
        tx_responses: std::sync::Mutex<VecDeque<Result<Option<RawTransaction>, SourceError>>>,
        signatures: Vec<SignatureInfo>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(tx_responses: Vec<Result<Option<RawTransaction>, SourceError>>) -> Self {
            Self {
                tx_responses: std::sync::Mutex::new(tx_responses.into()),
                signatures: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn with_signatures(count: usize) -> Self {
            let signatures = (0..count)
                .map(|i| SignatureInfo {
                    signature: format!("sig{}", i),
                    slot: 1_000 - i as u64,
                    block_time: Some(1_700_000_000),
                    err: None,
                })
                .collect();
            Self {
                tx_responses: std::sync::Mutex::new(VecDeque::new()),
                signatures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChainDataSource for ScriptedSource {
        async fn get_signatures_for_address(
            &self,
            _address: &str,
            limit: usize,
            before: Option<&str>,
        ) -> Result<Vec<SignatureInfo>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = match before {
                Some(b) => self
                    .signatures
                    .iter()
                    .position(|s| s.signature == b)
                    .map(|p| p + 1)
                    .unwrap_or(self.signatures.len()),
                None => 0,
            };
            Ok(self.signatures.iter().skip(start).take(limit).cloned().collect())
        }

        async fn get_parsed_transaction(
            &self,
            _signature: &str,
        ) -> Result<Option<RawTransaction>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tx_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }
    }

    fn rate_limited() -> Result<Option<RawTransaction>, SourceError> {
        Err(SourceError::RateLimited("429 Too Many Requests".to_string()))
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
        assert_eq!(policy.total_backoff(), Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion_fails_item() {
        let source = Arc::new(ScriptedSource::new(vec![
            rate_limited(),
            rate_limited(),
            rate_limited(),
            rate_limited(),
            Ok(Some(RawTransaction::default())),
        ]));
        let client = FetchClient::new(source.clone(), RetryPolicy::default());

        let result = client.fetch_transaction("sig").await;
        match result {
            Err(FetchError::RateLimited { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(SourceError::Other("connection reset".to_string())),
            Ok(Some(RawTransaction::default())),
        ]));
        let client = FetchClient::new(source.clone(), RetryPolicy::default());

        let start = Instant::now();
        let result = client.fetch_transaction("sig").await;
        assert_eq!(result.unwrap_err(), FetchError::FetchFailed("connection reset".to_string()));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_paced_on_success() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(None),
            Ok(None),
            Ok(None),
        ]));
        let policy = RetryPolicy {
            request_interval: Duration::from_millis(300),
            ..RetryPolicy::default()
        };
        let client = FetchClient::new(source, policy);

        let start = Instant::now();
        for _ in 0..3 {
            assert!(client.fetch_transaction("sig").await.unwrap().is_none());
        }
        // First call goes out immediately, the next two wait one interval each.
        assert_eq!(start.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_signatures_paginates_to_limit() {
        let source = Arc::new(ScriptedSource::with_signatures(2_500));
        let client = FetchClient::new(source.clone(), RetryPolicy::default());

        let sigs = client.fetch_signatures("pool", 1_200, None).await.unwrap();
        assert_eq!(sigs.len(), 1_200);
        assert_eq!(sigs[0].signature, "sig0");
        assert_eq!(sigs[1_199].signature, "sig1199");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        let next = client
            .fetch_signatures("pool", 10, Some("sig1199"))
            .await
            .unwrap();
        assert_eq!(next[0].signature, "sig1200");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_signatures_stops_on_short_page() {
        let source = Arc::new(ScriptedSource::with_signatures(30));
        let client = FetchClient::new(source.clone(), RetryPolicy::default());

        let sigs = client.fetch_signatures("pool", 100, None).await.unwrap();
        assert_eq!(sigs.len(), 30);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
