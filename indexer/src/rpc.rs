//! JSON-RPC chain data source over HTTP.
//!
//! Only the two reads the indexers need: `getSignaturesForAddress` and
//! `getTransaction` (jsonParsed). Every failure is classified as either a
//! rate limit or something else; retrying is the fetch client's job.

use async_trait::async_trait;
use mixscope::{ChainDataSource, RawTransaction, SignatureInfo, SourceError};
use serde::de::DeserializeOwned;
use serde::Deserialize;

const COMMITMENT: &str = "confirmed";

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Provider signals for "too many requests".
pub fn is_rate_limit(code: Option<i64>, message: &str) -> bool {
    if matches!(code, Some(429) | Some(-32429) | Some(-32005)) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    message.contains("too many requests") || message.contains("rate limit")
}

fn classify(code: Option<i64>, message: String) -> SourceError {
    if is_rate_limit(code, &message) {
        SourceError::RateLimited(message)
    } else {
        SourceError::Other(message)
    }
}

/// Turns a raw HTTP response into the JSON-RPC result. `Ok(None)` for a
/// null result; a non-2xx status is always an error.
fn decode<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<Option<T>, SourceError> {
    if status == 429 {
        return Err(SourceError::RateLimited(format!("HTTP {}", status)));
    }

    let parsed = serde_json::from_slice::<JsonRpcResponse<T>>(body);
    if let Ok(JsonRpcResponse {
        error: Some(error), ..
    }) = &parsed
    {
        return Err(classify(
            Some(error.code),
            format!("RPC error {}: {}", error.code, error.message),
        ));
    }

    if !(200..300).contains(&status) {
        let text = String::from_utf8_lossy(body);
        return Err(classify(None, format!("HTTP {}: {}", status, text.trim())));
    }

    match parsed {
        Ok(json) => Ok(json.result),
        Err(e) => Err(classify(None, format!("invalid response: {}", e))),
    }
}

pub struct RpcSource {
    url: String,
    client: reqwest::Client,
}

impl RpcSource {
    pub fn new(url: &str) -> Self {
        let normalized_url = if url.starts_with("http") {
            url.to_string()
        } else {
            format!("https://{}", url)
        };

        Self {
            url: normalized_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, SourceError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify(e.status().map(|s| s.as_u16() as i64), e.to_string()))?;

        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SourceError::Other(e.to_string()))?;

        decode(status, &bytes)
    }
}

fn signatures_params(address: &str, limit: usize, before: Option<&str>) -> serde_json::Value {
    let mut options = serde_json::json!({
        "limit": limit,
        "commitment": COMMITMENT,
    });
    if let Some(before) = before {
        options["before"] = serde_json::Value::String(before.to_string());
    }
    serde_json::json!([address, options])
}

fn transaction_params(signature: &str) -> serde_json::Value {
    serde_json::json!([
        signature,
        {
            "encoding": "jsonParsed",
            "maxSupportedTransactionVersion": 0,
            "commitment": COMMITMENT,
        }
    ])
}

#[async_trait]
impl ChainDataSource for RpcSource {
    async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<SignatureInfo>, SourceError> {
        let params = signatures_params(address, limit, before);
        self.request("getSignaturesForAddress", params)
            .await?
            .ok_or_else(|| SourceError::Other("No result in response".to_string()))
    }

    async fn get_parsed_transaction(
        &self,
        signature: &str,
    ) -> Result<Option<RawTransaction>, SourceError> {
        self.request("getTransaction", transaction_params(signature)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_classification() {
        assert!(is_rate_limit(Some(429), "whatever"));
        assert!(is_rate_limit(Some(-32429), ""));
        assert!(is_rate_limit(Some(-32005), "Node is behind"));
        assert!(is_rate_limit(None, "Too Many Requests for this key"));
        assert!(is_rate_limit(Some(-32000), "rate limit exceeded"));
        assert!(!is_rate_limit(Some(-32602), "Invalid params"));
        assert!(!is_rate_limit(None, "connection reset"));
    }

    #[test]
    fn test_decode_http_429() {
        let err = decode::<Vec<SignatureInfo>>(429, b"").unwrap_err();
        assert!(matches!(err, SourceError::RateLimited(_)));
    }

    #[test]
    fn test_decode_rpc_error() {
        let body = br#"{"jsonrpc":"2.0","id":1,"error":{"code":-32429,"message":"slow down"}}"#;
        let err = decode::<Vec<SignatureInfo>>(200, body).unwrap_err();
        assert!(matches!(err, SourceError::RateLimited(_)));

        let body = br#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Invalid param"}}"#;
        let err = decode::<Vec<SignatureInfo>>(200, body).unwrap_err();
        assert_eq!(err, SourceError::Other("RPC error -32602: Invalid param".to_string()));
    }

    #[test]
    fn test_decode_non_json_error_page() {
        let err = decode::<Vec<SignatureInfo>>(503, b"Too many requests, try later").unwrap_err();
        assert!(matches!(err, SourceError::RateLimited(_)));

        let err = decode::<Vec<SignatureInfo>>(502, b"Bad Gateway").unwrap_err();
        assert!(matches!(err, SourceError::Other(_)));
    }

    #[test]
    fn test_decode_json_error_status_without_rpc_error() {
        let err = decode::<RawTransaction>(403, br#"{"message":"Forbidden"}"#).unwrap_err();
        assert_eq!(err, SourceError::Other(r#"HTTP 403: {"message":"Forbidden"}"#.to_string()));

        let body = br#"{"code":503,"message":"Service Unavailable"}"#;
        let err = decode::<RawTransaction>(503, body).unwrap_err();
        assert!(matches!(err, SourceError::Other(_)));

        // A null result is only "not found" on success
        let err = decode::<RawTransaction>(500, br#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap_err();
        assert!(matches!(err, SourceError::Other(_)));

        let body = br#"{"jsonrpc":"2.0","id":1,"error":{"code":429,"message":"Too Many Requests"}}"#;
        let err = decode::<RawTransaction>(503, body).unwrap_err();
        assert!(matches!(err, SourceError::RateLimited(_)));
    }

    #[test]
    fn test_decode_signatures_and_null_transaction() {
        let body = br#"{"jsonrpc":"2.0","id":1,"result":[
            {"signature":"s1","slot":10,"blockTime":1700000000,"err":null,"memo":null,"confirmationStatus":"finalized"},
            {"signature":"s2","slot":9,"blockTime":null,"err":{"InstructionError":[0,"Custom"]}}
        ]}"#;
        let sigs = decode::<Vec<SignatureInfo>>(200, body).unwrap().unwrap();
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].block_time, Some(1_700_000_000));
        assert!(!sigs[0].is_failed());
        assert!(sigs[1].is_failed());

        let body = br#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        assert!(decode::<RawTransaction>(200, body).unwrap().is_none());
    }

    #[test]
    fn test_request_params() {
        let params = signatures_params("addr", 50, Some("sig"));
        assert_eq!(params[0], "addr");
        assert_eq!(params[1]["limit"], 50);
        assert_eq!(params[1]["before"], "sig");
        assert!(signatures_params("addr", 50, None)[1].get("before").is_none());

        let params = transaction_params("sig");
        assert_eq!(params[1]["encoding"], "jsonParsed");
        assert_eq!(params[1]["maxSupportedTransactionVersion"], 0);
    }

    #[test]
    fn test_url_normalization() {
        assert_eq!(RpcSource::new("rpc.example.com").url(), "https://rpc.example.com");
        assert_eq!(RpcSource::new("http://localhost:8899").url(), "http://localhost:8899");
    }
}
