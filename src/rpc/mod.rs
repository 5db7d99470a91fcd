//! JSON-RPC plumbing shared by the node, bundler and paymaster clients.

#[cfg(test)]
pub mod mock;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ethers_core::types::U256;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Node {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("unexpected response to {method}: {reason}")]
    Decode { method: String, reason: String },

    #[error("{0} returned no result")]
    Empty(String),
}

impl RpcError {
    /// Node error code, when the failure came from the remote side
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Node { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Anything that can answer a JSON-RPC request
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// JSON-RPC 2.0 over HTTP
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        trace!(url = %self.url, %method, id, "Sending rpc request");
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json::<RpcResponse>()
            .await?;

        if let Some(error) = response.error {
            debug!(%method, code = error.code, message = %error.message, "Rpc call failed");
            return Err(RpcError::Node {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }
}

/// Issue a request and deserialize its result
pub async fn call<T: DeserializeOwned>(
    transport: &dyn RpcTransport,
    method: &str,
    params: Value,
) -> Result<T, RpcError> {
    let value = transport.request(method, params).await?;
    if value.is_null() {
        return Err(RpcError::Empty(method.to_string()));
    }

    serde_json::from_value(value).map_err(|e| RpcError::Decode {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Like [`call`], but a `null` result is `None` rather than an error
pub async fn call_optional<T: DeserializeOwned>(
    transport: &dyn RpcTransport,
    method: &str,
    params: Value,
) -> Result<Option<T>, RpcError> {
    let value = transport.request(method, params).await?;
    if value.is_null() {
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| RpcError::Decode {
            method: method.to_string(),
            reason: e.to_string(),
        })
}

/// Re-run `fetch` every `interval` until it yields a value or `timeout` passes
pub async fn poll<T, F, Fut>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut fetch: F,
) -> Result<T, crate::error::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, RpcError>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = fetch().await? {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(crate::error::Error::Timeout(what.to_string()));
        }
        trace!(%what, "Still waiting");
        tokio::time::sleep(interval).await;
    }
}

/// Parse a hex quantity such as `"0x14a34"`
pub fn parse_quantity(value: &str) -> Option<U256> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    if digits.is_empty() {
        return Some(U256::zero());
    }
    U256::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one HTTP request with `reply` and hand back the JSON body received
    async fn serve_once(reply: Value) -> (String, JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 1024];
            let body = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                received.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if received.len() >= end + 4 + length {
                        break received[end + 4..end + 4 + length].to_vec();
                    }
                }
                assert!(n > 0, "client closed before sending a full request");
            };

            let payload = reply.to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
                payload.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            serde_json::from_slice(&body).unwrap()
        });

        (url, handle)
    }

    fn transport(url: &str) -> HttpTransport {
        HttpTransport::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn http_transport_sends_a_jsonrpc_envelope() {
        let (url, server) = serve_once(json!({ "jsonrpc": "2.0", "id": 1, "result": "0x8274f" })).await;

        let result = transport(&url).request("eth_chainId", json!([])).await.unwrap();
        assert_eq!(result, json!("0x8274f"));

        let sent = server.await.unwrap();
        assert_eq!(sent["jsonrpc"], "2.0");
        assert_eq!(sent["method"], "eth_chainId");
        assert_eq!(sent["params"], json!([]));
        assert_eq!(sent["id"], 1);
    }

    #[tokio::test]
    async fn http_transport_maps_node_errors() {
        let (url, server) = serve_once(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32521, "message": "execution reverted", "data": "0x220266b6" }
        }))
        .await;

        let err = transport(&url)
            .request("eth_estimateUserOperationGas", json!([{}, "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"]))
            .await
            .unwrap_err();
        match err {
            RpcError::Node { code, message, data } => {
                assert_eq!(code, -32521);
                assert_eq!(message, "execution reverted");
                assert_eq!(data, Some(json!("0x220266b6")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.await.unwrap()["method"], "eth_estimateUserOperationGas");
    }

    #[tokio::test]
    async fn http_transport_passes_null_through() {
        let (url, server) = serve_once(json!({ "jsonrpc": "2.0", "id": 1, "result": null })).await;
        let node = transport(&url);

        let receipt: Option<U256> = call_optional(&node, "eth_getTransactionReceipt", json!(["0x00"]))
            .await
            .unwrap();
        assert_eq!(receipt, None);
        server.await.unwrap();

        // A response with neither result nor error also reads as null
        let (url, server) = serve_once(json!({ "jsonrpc": "2.0", "id": 1 })).await;
        let value = transport(&url).request("eth_getTransactionReceipt", json!(["0x00"])).await.unwrap();
        assert_eq!(value, Value::Null);
        server.await.unwrap();
    }

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(parse_quantity("0x14a34"), Some(U256::from(84532)));
        assert_eq!(parse_quantity("0x"), Some(U256::zero()));
        assert_eq!(parse_quantity("ff"), Some(U256::from(255)));
        assert_eq!(parse_quantity("0xzz"), None);
    }

    #[tokio::test]
    async fn poll_returns_first_value() {
        let mut attempts = 0;
        let value = poll("receipt", Duration::from_millis(1), Duration::from_secs(1), || {
            attempts += 1;
            let current = attempts;
            async move { Ok::<_, RpcError>((current >= 3).then_some(current)) }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn poll_times_out() {
        let result: Result<u32, _> = poll("receipt", Duration::from_millis(1), Duration::from_millis(5), || async {
            Ok::<_, RpcError>(None)
        })
        .await;
        assert!(matches!(result, Err(crate::error::Error::Timeout(_))));
    }

    #[test]
    fn node_errors_expose_their_code() {
        let err = RpcError::Node {
            code: 4902,
            message: "unrecognized chain".into(),
            data: None,
        };
        assert_eq!(err.code(), Some(4902));
        assert_eq!(RpcError::Empty("eth_call".into()).code(), None);
    }
}
