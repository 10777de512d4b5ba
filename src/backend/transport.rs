//! Shared JSON-RPC envelope, request correlation table, and the `Transport`
//! trait both backend variants implement (§4.1, §9 — a tagged variant
//! replaces the teacher's duck-typed `BackendConfig`).

use super::error::{BackendError, MAX_PENDING};
use crate::model::ToolDescriptor;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tokio::sync::oneshot;
use tokio::time::Duration;

pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(30);
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_RESPONSE_ITEMS: usize = 100;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// `Idle -> Starting -> Running -> Stopping -> Stopped`, with `Running ->
/// Failed` on fatal peer error (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

const STATE_IDLE: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_STOPPING: u8 = 3;
const STATE_STOPPED: u8 = 4;
const STATE_FAILED: u8 = 5;

pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(initial: ConnectionState) -> Self {
        Self(AtomicU8::new(encode(initial)))
    }

    pub fn load(&self) -> ConnectionState {
        decode(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(encode(state), Ordering::Release);
    }
}

fn encode(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Idle => STATE_IDLE,
        ConnectionState::Starting => STATE_STARTING,
        ConnectionState::Running => STATE_RUNNING,
        ConnectionState::Stopping => STATE_STOPPING,
        ConnectionState::Stopped => STATE_STOPPED,
        ConnectionState::Failed => STATE_FAILED,
    }
}

fn decode(byte: u8) -> ConnectionState {
    match byte {
        STATE_IDLE => ConnectionState::Idle,
        STATE_STARTING => ConnectionState::Starting,
        STATE_RUNNING => ConnectionState::Running,
        STATE_STOPPING => ConnectionState::Stopping,
        STATE_STOPPED => ConnectionState::Stopped,
        _ => ConnectionState::Failed,
    }
}

/// Structured diagnostics (§4.1 `getHealthDetail`). Values that could
/// contain credentials are redacted by the caller before this is built.
#[derive(Debug, Clone, Serialize)]
pub struct HealthDetail {
    pub healthy: bool,
    pub uptime_secs: Option<u64>,
    pub tool_count: usize,
    pub pending_requests: Option<usize>,
    pub pid: Option<u32>,
    pub consecutive_failures: Option<u32>,
    pub redacted_url: Option<String>,
    pub error: Option<String>,
}

/// Owned by the connection task; holds at most `MAX_PENDING` entries. A
/// `Mutex` rather than a single-owner task because the HTTP variant has no
/// continuous reader loop to own it alone (§4.1a) — both the request path
/// and the response-matching path touch it directly.
pub struct PendingTable {
    name: String,
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, oneshot::Sender<Result<Value, BackendError>>>>,
}

impl PendingTable {
    pub fn new(name: String) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a new pending request, failing `Overloaded` at the cap.
    pub fn register(&self) -> Result<(u64, oneshot::Receiver<Result<Value, BackendError>>), BackendError> {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() >= MAX_PENDING {
            return Err(BackendError::Overloaded {
                name: self.name.clone(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        slots.insert(id, tx);
        Ok((id, rx))
    }

    /// Delivers a response to the waiting caller, if any (late/duplicate
    /// responses after a deadline fired are silently dropped).
    pub fn complete(&self, id: u64, result: Result<Value, BackendError>) {
        if let Some(tx) = self.slots.lock().unwrap().remove(&id) {
            let _ = tx.send(result);
        }
    }

    /// Cancels every pending request with `Canceled` (connection stop, §5).
    pub fn cancel_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        for (_, tx) in slots.drain() {
            let _ = tx.send(Err(BackendError::Canceled {
                name: self.name.clone(),
            }));
        }
    }
}

/// Validates a `CallToolResult`-shaped payload against the response size
/// caps (§4.1): total size <= 10 MiB over <= 100 items, each item <= 10 MiB.
pub fn check_response_size(name: &str, value: &Value) -> Result<(), BackendError> {
    let items = value
        .get("content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    if items.len() > MAX_RESPONSE_ITEMS {
        return Err(BackendError::ResponseTooLarge {
            name: name.to_string(),
            reason: format!("{} items exceeds cap of {MAX_RESPONSE_ITEMS}", items.len()),
        });
    }

    let mut total = 0usize;
    for item in &items {
        let size = serde_json::to_vec(item).map(|v| v.len()).unwrap_or(0);
        if size > MAX_RESPONSE_BYTES {
            return Err(BackendError::ResponseTooLarge {
                name: name.to_string(),
                reason: format!("item of {size} bytes exceeds per-item cap"),
            });
        }
        total += size;
    }

    if total > MAX_RESPONSE_BYTES {
        return Err(BackendError::ResponseTooLarge {
            name: name.to_string(),
            reason: format!("total {total} bytes exceeds response cap"),
        });
    }

    Ok(())
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<(), BackendError>;
    async fn invoke(&self, tool: &str, arguments: Option<Value>) -> Result<Value, BackendError>;
    async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>, BackendError>;
    async fn health_check(&self) -> HealthDetail;
    async fn stop(&self) -> Result<(), BackendError>;
    fn state(&self) -> ConnectionState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_table_caps_at_max() {
        let table = PendingTable::new("test".to_string());
        let mut receivers = Vec::new();
        for _ in 0..MAX_PENDING {
            let (_, rx) = table.register().unwrap();
            receivers.push(rx);
        }
        assert!(table.register().is_err());
        assert_eq!(table.len(), MAX_PENDING);
    }

    #[test]
    fn response_size_cap_enforced() {
        let big_item = serde_json::json!("x".repeat(MAX_RESPONSE_BYTES + 1));
        let value = serde_json::json!({"content": [big_item]});
        assert!(check_response_size("b", &value).is_err());
    }

    #[test]
    fn response_item_count_cap_enforced() {
        let items: Vec<Value> = (0..MAX_RESPONSE_ITEMS + 1)
            .map(|i| serde_json::json!(i))
            .collect();
        let value = serde_json::json!({"content": items});
        assert!(check_response_size("b", &value).is_err());
    }
}
