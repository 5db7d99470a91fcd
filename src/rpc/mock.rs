use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{RpcError, RpcTransport};

/// Scripted transport for tests. One-shot responses are consumed first, then
/// the persistent response for the method. `eth_call` can be scripted per
/// function selector.
#[derive(Default)]
pub struct MockTransport {
    persistent: Mutex<HashMap<String, Value>>,
    queued: Mutex<HashMap<String, VecDeque<Result<Value, RpcError>>>>,
    reverts: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: &str, result: Value) -> &Self {
        self.persistent.lock().unwrap().insert(method.to_string(), result);
        self
    }

    pub fn respond_once(&self, method: &str, result: Value) -> &Self {
        self.push(method, Ok(result))
    }

    pub fn fail_once(&self, method: &str, code: i64, message: &str) -> &Self {
        self.push(
            method,
            Err(RpcError::Node {
                code,
                message: message.to_string(),
                data: None,
            }),
        )
    }

    /// Answer `eth_call` for one 4-byte selector with ABI-encoded bytes
    pub fn respond_call(&self, selector: [u8; 4], encoded: &[u8]) -> &Self {
        self.respond(
            &call_key(&hex::encode(selector)),
            Value::String(format!("0x{}", hex::encode(encoded))),
        )
    }

    /// Make `eth_call` for one selector revert with `data`, the way geth
    /// reports custom errors
    pub fn revert_call(&self, selector: [u8; 4], data: &[u8]) -> &Self {
        self.reverts
            .lock()
            .unwrap()
            .insert(call_key(&hex::encode(selector)), data.to_vec());
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }

    fn push(&self, method: &str, result: Result<Value, RpcError>) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
        self
    }
}

fn call_key(selector_hex: &str) -> String {
    format!("eth_call:{selector_hex}")
}

fn selector_of(params: &Value) -> Option<String> {
    let data = params.get(0)?.get("data")?.as_str()?;
    let hex = data.strip_prefix("0x").unwrap_or(data);
    hex.get(..8).map(str::to_string)
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.calls.lock().unwrap().push((method.to_string(), params.clone()));

        if let Some(next) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return next;
        }

        let persistent = self.persistent.lock().unwrap();
        if method == "eth_call" {
            let key = selector_of(&params).map(|s| call_key(&s)).unwrap_or_default();
            if let Some(data) = self.reverts.lock().unwrap().get(&key) {
                return Err(RpcError::Node {
                    code: 3,
                    message: "execution reverted".to_string(),
                    data: Some(Value::String(format!("0x{}", hex::encode(data)))),
                });
            }
            if let Some(value) = persistent.get(&key) {
                return Ok(value.clone());
            }
        }

        persistent.get(method).cloned().ok_or_else(|| RpcError::Node {
            code: -32601,
            message: format!("no scripted response for {method}"),
            data: None,
        })
    }
}
