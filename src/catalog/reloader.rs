//! Catalog Reloader (§4.9): diff an incoming catalog against the stored
//! one, then apply it — adding and updating backends before tearing old
//! ones down, tolerating partial failure, and reporting exactly what
//! happened rather than a single success/failure bit.

use crate::model::{BackendCatalogEntry, IsolationMode, McpId};
use crate::pool::PerUserPool;
use crate::shared::{SharedManager, fingerprint};
use crate::store::CatalogStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Errors from `CatalogReloader::apply` (§4.9, §7). A dedicated type rather
/// than bare `anyhow::Error` so the HTTP boundary can tell a rejected
/// concurrent apply apart from every other failure.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    /// §4.9 step 1: a second concurrent apply fails instead of queuing
    /// behind the first one.
    #[error("a catalog reload is already in progress")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Default, serde::Serialize)]
pub struct CatalogDiff {
    pub to_add: Vec<BackendCatalogEntry>,
    pub to_remove: Vec<McpId>,
    pub to_update: Vec<BackendCatalogEntry>,
    pub unchanged: Vec<McpId>,
}

/// Pure comparison, no I/O — lets callers preview a reload before applying
/// it (§6 `/v1/admin/catalog/reload?dry_run=true`).
pub fn diff(current: &[BackendCatalogEntry], incoming: &[BackendCatalogEntry]) -> CatalogDiff {
    let current_by_id: HashMap<&str, &BackendCatalogEntry> =
        current.iter().map(|e| (e.mcp_id.as_str(), e)).collect();
    let incoming_by_id: HashMap<&str, &BackendCatalogEntry> =
        incoming.iter().map(|e| (e.mcp_id.as_str(), e)).collect();

    let mut out = CatalogDiff::default();

    for entry in incoming {
        match current_by_id.get(entry.mcp_id.as_str()) {
            None => out.to_add.push(entry.clone()),
            Some(existing) => {
                if fingerprint(existing) != fingerprint(entry) {
                    out.to_update.push(entry.clone());
                } else {
                    out.unchanged.push(entry.mcp_id.clone());
                }
            }
        }
    }

    out.to_remove = current
        .iter()
        .filter(|e| !incoming_by_id.contains_key(e.mcp_id.as_str()))
        .map(|e| e.mcp_id.clone())
        .collect();

    out
}

#[derive(Debug, Default, serde::Serialize)]
pub struct ApplyResult {
    pub added: Vec<McpId>,
    pub removed: Vec<McpId>,
    pub updated: Vec<McpId>,
    pub errors: Vec<(McpId, String)>,
}

pub struct CatalogReloader {
    catalog: Arc<dyn CatalogStore>,
    shared: Arc<SharedManager>,
    pool: Arc<PerUserPool>,
    apply_lock: Mutex<()>,
}

impl CatalogReloader {
    pub fn new(catalog: Arc<dyn CatalogStore>, shared: Arc<SharedManager>, pool: Arc<PerUserPool>) -> Self {
        Self {
            catalog,
            shared,
            pool,
            apply_lock: Mutex::new(()),
        }
    }

    pub async fn preview(&self, incoming: &[BackendCatalogEntry]) -> anyhow::Result<CatalogDiff> {
        let current = self.catalog.all().await?;
        Ok(diff(&current, incoming))
    }

    /// Single writer at a time (`apply_lock`): adds and updates connect
    /// before any old connection for a changed entry is stopped, so a
    /// failing new connection doesn't leave callers with nothing. A second
    /// caller that arrives while a reload is already in flight fails
    /// immediately with `ReloadError::Conflict` rather than waiting its turn
    /// (§4.9 step 1, §7 "concurrent reload; 409").
    ///
    /// `shared` entries are driven through the Shared Manager directly;
    /// `per_user` entries have no single connection to start here — the
    /// pool spawns those lazily per caller, so an add/update just writes
    /// the catalog row, and a removal terminates whatever instances the
    /// pool already has running for it (§4.9 step 5).
    pub async fn apply(&self, incoming: Vec<BackendCatalogEntry>) -> Result<ApplyResult, ReloadError> {
        let _guard = self.apply_lock.try_lock().map_err(|_| ReloadError::Conflict)?;
        let current = self.catalog.all().await?;
        let plan = diff(&current, &incoming);
        let mut result = ApplyResult::default();

        for entry in &plan.to_add {
            let started: Result<(), crate::backend::BackendError> = match entry.isolation_mode {
                IsolationMode::Shared => self.shared.ensure_started(entry).await.map(|_| ()),
                // No single connection to start: the pool spawns per-user
                // instances lazily on first invocation.
                IsolationMode::PerUser => Ok(()),
            };
            match started {
                Ok(_) => {
                    if let Err(e) = self.catalog.upsert(entry.clone()).await {
                        result.errors.push((entry.mcp_id.clone(), e.to_string()));
                        continue;
                    }
                    result.added.push(entry.mcp_id.clone());
                }
                Err(e) => result.errors.push((entry.mcp_id.clone(), e.to_string())),
            }
        }

        for entry in &plan.to_update {
            let restarted: Result<(), crate::backend::BackendError> = match entry.isolation_mode {
                IsolationMode::Shared => self.shared.restart(entry).await.map(|_| ()),
                IsolationMode::PerUser => {
                    // Config changed enough to bump the fingerprint: old
                    // per-user instances were built from stale config and
                    // must not survive, so terminate them and let the pool
                    // re-spawn fresh ones against the new catalog row.
                    self.pool.terminate_for_backend(&entry.mcp_id).await;
                    Ok(())
                }
            };
            match restarted {
                Ok(_) => {
                    if let Err(e) = self.catalog.upsert(entry.clone()).await {
                        result.errors.push((entry.mcp_id.clone(), e.to_string()));
                        continue;
                    }
                    result.updated.push(entry.mcp_id.clone());
                }
                Err(e) => result.errors.push((entry.mcp_id.clone(), e.to_string())),
            }
        }

        for mcp_id in &plan.to_remove {
            let removed_entry = current.iter().find(|e| &e.mcp_id == mcp_id);
            let stopped = match removed_entry.map(|e| e.isolation_mode) {
                Some(IsolationMode::PerUser) => {
                    self.pool.terminate_for_backend(mcp_id).await;
                    Ok(())
                }
                _ => self.shared.stop(mcp_id).await,
            };
            if let Err(e) = stopped {
                result.errors.push((mcp_id.clone(), e.to_string()));
                continue;
            }
            if let Err(e) = self.catalog.remove(mcp_id).await {
                result.errors.push((mcp_id.clone(), e.to_string()));
                continue;
            }
            result.removed.push(mcp_id.clone());
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CatalogEntryStatus, IsolationMode, Transport};

    fn entry(id: &str, command: &str) -> BackendCatalogEntry {
        BackendCatalogEntry {
            mcp_id: id.to_string(),
            name: id.to_string(),
            transport: Transport::Stdio,
            config: serde_json::json!({"command": command}),
            isolation_mode: IsolationMode::Shared,
            requires_user_credentials: false,
            status: CatalogEntryStatus::Published,
            tool_catalog: Vec::new(),
        }
    }

    #[test]
    fn diff_classifies_add_remove_update_unchanged() {
        let current = vec![entry("a", "echo"), entry("b", "cat")];
        let incoming = vec![entry("a", "echo"), entry("b", "tac"), entry("c", "ls")];

        let plan = diff(&current, &incoming);
        assert_eq!(plan.to_add.len(), 1);
        assert_eq!(plan.to_add[0].mcp_id, "c");
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].mcp_id, "b");
        assert_eq!(plan.unchanged, vec!["a".to_string()]);
        assert!(plan.to_remove.is_empty());
    }

    #[test]
    fn diff_detects_removal() {
        let current = vec![entry("a", "echo")];
        let incoming: Vec<BackendCatalogEntry> = vec![];
        let plan = diff(&current, &incoming);
        assert_eq!(plan.to_remove, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn apply_adds_per_user_entry_without_starting_a_shared_connection() {
        use crate::store::memory::MemoryStore;
        use crate::vault::CredentialVault;
        use crate::pool::PoolLimits;

        let store = Arc::new(MemoryStore::new());
        let shared = Arc::new(SharedManager::new());
        let vault = Arc::new(CredentialVault::new([3u8; 32]));
        let pool = Arc::new(PerUserPool::new(PoolLimits::default(), store.clone(), vault));
        let reloader = CatalogReloader::new(store.clone(), shared, pool);

        let mut per_user_entry = entry("pu", "echo");
        per_user_entry.isolation_mode = IsolationMode::PerUser;

        let result = reloader.apply(vec![per_user_entry]).await.unwrap();
        assert_eq!(result.added, vec!["pu".to_string()]);
        assert!(result.errors.is_empty());
        assert!(store.get("pu").await.unwrap().is_some());
    }
}
