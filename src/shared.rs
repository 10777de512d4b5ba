//! Shared Manager (§4.2): one Backend Connection per catalog entry, reused
//! across every client subscribed to it. Keyed by `mcp_id`, not by user —
//! that's what distinguishes it from the Per-User Pool (`crate::pool`).

use crate::backend::{BackendError, ConnectionState, HealthDetail, HttpConfig, HttpTransport, StdioConfig, StdioTransport, Transport};
use crate::model::{BackendCatalogEntry, McpId, ToolDescriptor, Transport as TransportKind};
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct StdioConfigShape {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct HttpConfigShape {
    url: String,
    /// Unexpanded form with `${ENV_VAR}` placeholders intact, injected by
    /// the catalog loader alongside the resolved `url` (§4.1, §9).
    #[serde(default)]
    url_template: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

/// A sha256 digest of `(transport, config, isolation_mode)`, used by the
/// Catalog Reloader (§4.9) to decide whether a changed catalog entry needs
/// its connection torn down or can be left running.
pub fn fingerprint(entry: &BackendCatalogEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{:?}", entry.transport).as_bytes());
    hasher.update(serde_json::to_vec(&entry.config).unwrap_or_default());
    hasher.update(format!("{:?}", entry.isolation_mode).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build_transport(entry: &BackendCatalogEntry) -> Result<Arc<dyn Transport>, BackendError> {
    match entry.transport {
        TransportKind::Stdio => {
            let shape: StdioConfigShape = serde_json::from_value(entry.config.clone())
                .map_err(|e| BackendError::StartupError {
                    name: entry.name.clone(),
                    reason: format!("invalid stdio config: {e}"),
                })?;
            let config = StdioConfig {
                command: shape.command,
                args: shape.args,
                env: shape.env,
                cwd: shape.cwd,
                timeout: Duration::from_secs(shape.timeout_secs),
            };
            Ok(Arc::new(StdioTransport::new(entry.name.clone(), config)))
        }
        TransportKind::Http => {
            let shape: HttpConfigShape = serde_json::from_value(entry.config.clone())
                .map_err(|e| BackendError::StartupError {
                    name: entry.name.clone(),
                    reason: format!("invalid http config: {e}"),
                })?;
            let url_template = shape.url_template.clone().unwrap_or_else(|| shape.url.clone());
            let config = HttpConfig {
                url: shape.url,
                url_template,
                headers: shape.headers,
                timeout: Duration::from_secs(shape.timeout_secs),
            };
            Ok(Arc::new(HttpTransport::new(entry.name.clone(), config)?))
        }
    }
}

struct Entry {
    transport: Arc<dyn Transport>,
    fingerprint: String,
}

pub struct SharedManager {
    backends: DashMap<McpId, Entry>,
}

impl Default for SharedManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedManager {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    /// Starts a connection for `entry` if one isn't already running with a
    /// matching fingerprint. Idempotent across repeated resolver lookups.
    pub async fn ensure_started(&self, entry: &BackendCatalogEntry) -> Result<Arc<dyn Transport>, BackendError> {
        let fp = fingerprint(entry);
        if let Some(existing) = self.backends.get(&entry.mcp_id) {
            if existing.fingerprint == fp && existing.transport.state() == ConnectionState::Running {
                return Ok(Arc::clone(&existing.transport));
            }
        }

        let transport = build_transport(entry)?;
        transport.start().await?;
        self.backends.insert(
            entry.mcp_id.clone(),
            Entry {
                transport: Arc::clone(&transport),
                fingerprint: fp,
            },
        );
        Ok(transport)
    }

    pub fn get(&self, mcp_id: &str) -> Option<Arc<dyn Transport>> {
        self.backends.get(mcp_id).map(|e| Arc::clone(&e.transport))
    }

    pub async fn restart(&self, entry: &BackendCatalogEntry) -> Result<Arc<dyn Transport>, BackendError> {
        if let Some((_, old)) = self.backends.remove(&entry.mcp_id) {
            let _ = old.transport.stop().await;
        }
        self.ensure_started(entry).await
    }

    pub async fn stop(&self, mcp_id: &str) -> Result<()> {
        if let Some((_, entry)) = self.backends.remove(mcp_id) {
            entry
                .transport
                .stop()
                .await
                .context("stopping shared backend")?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, entry)) = self.backends.remove(&name) {
                let _ = entry.transport.stop().await;
            }
        }
    }

    /// Tools from every running shared backend, namespaced `mcp_id:tool` so
    /// identically-named tools from different backends never collide in the
    /// router's dispatch table (§4.4).
    pub async fn aggregated_tools(&self) -> Vec<(McpId, String, ToolDescriptor)> {
        let mut out = Vec::new();
        let handles: Vec<(McpId, Arc<dyn Transport>)> = self
            .backends
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e.value().transport)))
            .collect();

        for (mcp_id, transport) in handles {
            if let Ok(tools) = transport.refresh_tools().await {
                for tool in tools {
                    let namespaced = format!("{mcp_id}:{}", tool.name);
                    out.push((mcp_id.clone(), namespaced, tool));
                }
            }
        }
        out
    }

    pub async fn health_snapshot(&self) -> Vec<(McpId, HealthDetail)> {
        let handles: Vec<(McpId, Arc<dyn Transport>)> = self
            .backends
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e.value().transport)))
            .collect();

        let mut out = Vec::with_capacity(handles.len());
        for (mcp_id, transport) in handles {
            out.push((mcp_id, transport.health_check().await));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CatalogEntryStatus, IsolationMode};

    fn entry(mcp_id: &str, config: serde_json::Value) -> BackendCatalogEntry {
        BackendCatalogEntry {
            mcp_id: mcp_id.to_string(),
            name: mcp_id.to_string(),
            transport: TransportKind::Stdio,
            config,
            isolation_mode: IsolationMode::Shared,
            requires_user_credentials: false,
            status: CatalogEntryStatus::Published,
            tool_catalog: Vec::new(),
        }
    }

    #[test]
    fn fingerprint_changes_with_config() {
        let a = entry("x", serde_json::json!({"command": "echo"}));
        let b = entry("x", serde_json::json!({"command": "cat"}));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_stable_for_same_config() {
        let a = entry("x", serde_json::json!({"command": "echo"}));
        let b = entry("x", serde_json::json!({"command": "echo"}));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }
}
