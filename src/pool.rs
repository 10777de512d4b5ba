//! Per-User Pool (§4.3): one Backend Connection per `(user, mcp)` pair, for
//! catalog entries marked `isolation_mode = per_user`. Unlike the Shared
//! Manager, connections here are spun up lazily on first use and carry
//! user-specific credentials injected at start time.

use crate::backend::{BackendError, HttpConfig, HttpTransport, StdioConfig, StdioTransport, Transport};
use crate::model::{BackendCatalogEntry, McpId, Transport as TransportKind, UserId};
use crate::store::CredentialStore;
use crate::vault::CredentialVault;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Hard ceiling on concurrently running per-user connections, independent of
/// per-user caps, protecting total child-process/socket fan-out (§5).
const DEFAULT_GLOBAL_CAPACITY: usize = 256;
/// Per-user ceiling, so one user's subscriptions can't starve everyone
/// else's pool slots (§5).
const DEFAULT_PER_USER_CAPACITY: usize = 16;
/// A per-user connection with no activity for this long is eligible for the
/// idle reaper (§4.3).
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

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
    /// the catalog loader alongside the resolved `url` (§4.1, §9). Falls
    /// back to `url` itself for configs built without going through that
    /// loader (e.g. tests).
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

fn key(user_id: &str, mcp_id: &str) -> String {
    format!("{user_id}\u{0}{mcp_id}")
}

struct Slot {
    transport: Arc<dyn Transport>,
    user_id: UserId,
    last_used_unix: AtomicI64,
}

pub struct PoolLimits {
    pub global_capacity: usize,
    pub per_user_capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            global_capacity: DEFAULT_GLOBAL_CAPACITY,
            per_user_capacity: DEFAULT_PER_USER_CAPACITY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Guards the "check capacity, then insert" sequence so concurrent spawns
/// for the same user can't both slip past the per-user cap.
pub struct PerUserPool {
    slots: DashMap<String, Slot>,
    per_user_counts: DashMap<UserId, usize>,
    total: AtomicUsize,
    capacity_lock: Mutex<()>,
    limits: PoolLimits,
    credentials: Arc<dyn CredentialStore>,
    vault: Arc<CredentialVault>,
}

impl PerUserPool {
    pub fn new(limits: PoolLimits, credentials: Arc<dyn CredentialStore>, vault: Arc<CredentialVault>) -> Self {
        Self {
            slots: DashMap::new(),
            per_user_counts: DashMap::new(),
            total: AtomicUsize::new(0),
            capacity_lock: Mutex::new(()),
            limits,
            credentials,
            vault,
        }
    }

    pub fn get(&self, user_id: &str, mcp_id: &str) -> Option<Arc<dyn Transport>> {
        let k = key(user_id, mcp_id);
        let slot = self.slots.get(&k)?;
        slot.last_used_unix.store(now_unix(), Ordering::Relaxed);
        Some(Arc::clone(&slot.transport))
    }

    /// Returns an existing connection, or spawns one with the user's
    /// credentials injected, failing `CapacityExceeded` over either cap.
    pub async fn get_or_spawn(
        &self,
        user_id: &str,
        entry: &BackendCatalogEntry,
        vault_salt: Option<&str>,
    ) -> Result<Arc<dyn Transport>, BackendError> {
        if let Some(existing) = self.get(user_id, &entry.mcp_id) {
            return Ok(existing);
        }

        let _guard = self.capacity_lock.lock().await;
        // Re-check under the lock: another task may have spawned it first.
        if let Some(existing) = self.get(user_id, &entry.mcp_id) {
            return Ok(existing);
        }

        if self.total.load(Ordering::SeqCst) >= self.limits.global_capacity {
            return Err(BackendError::CapacityExceeded {
                name: entry.name.clone(),
                scope: crate::backend::CapacityScope::Global,
            });
        }
        let per_user = self
            .per_user_counts
            .get(user_id)
            .map(|c| *c)
            .unwrap_or(0);
        if per_user >= self.limits.per_user_capacity {
            return Err(BackendError::CapacityExceeded {
                name: entry.name.clone(),
                scope: crate::backend::CapacityScope::PerUser,
            });
        }

        let transport = self
            .build_transport(user_id, entry, vault_salt)
            .await?;
        transport.start().await?;

        self.total.fetch_add(1, Ordering::SeqCst);
        *self.per_user_counts.entry(user_id.to_string()).or_insert(0) += 1;
        self.slots.insert(
            key(user_id, &entry.mcp_id),
            Slot {
                transport: Arc::clone(&transport),
                user_id: user_id.to_string(),
                last_used_unix: AtomicI64::new(now_unix()),
            },
        );
        Ok(transport)
    }

    async fn build_transport(
        &self,
        user_id: &str,
        entry: &BackendCatalogEntry,
        vault_salt: Option<&str>,
    ) -> Result<Arc<dyn Transport>, BackendError> {
        let credentials = if entry.requires_user_credentials {
            match (self.credentials.get(user_id, &entry.mcp_id).await, vault_salt) {
                (Ok(Some(cred)), Some(salt)) => self
                    .vault
                    .decrypt(salt, &cred.iv, &cred.ciphertext)
                    .map_err(|e| BackendError::StartupError {
                        name: entry.name.clone(),
                        reason: format!("credential decrypt failed: {e}"),
                    })?,
                _ => {
                    return Err(BackendError::CredentialsMissing {
                        name: entry.name.clone(),
                    });
                }
            }
        } else {
            HashMap::new()
        };

        match entry.transport {
            TransportKind::Stdio => {
                let mut shape: StdioConfigShape = serde_json::from_value(entry.config.clone())
                    .map_err(|e| BackendError::StartupError {
                        name: entry.name.clone(),
                        reason: format!("invalid stdio config: {e}"),
                    })?;
                shape.env.extend(credentials);
                let config = StdioConfig {
                    command: shape.command,
                    args: shape.args,
                    env: shape.env,
                    cwd: shape.cwd,
                    timeout: Duration::from_secs(shape.timeout_secs),
                };
                Ok(Arc::new(StdioTransport::new(
                    format!("{}:{user_id}", entry.name),
                    config,
                )))
            }
            TransportKind::Http => {
                let mut shape: HttpConfigShape = serde_json::from_value(entry.config.clone())
                    .map_err(|e| BackendError::StartupError {
                        name: entry.name.clone(),
                        reason: format!("invalid http config: {e}"),
                    })?;
                shape.headers.extend(credentials);
                let url_template = shape.url_template.clone().unwrap_or_else(|| shape.url.clone());
                let config = HttpConfig {
                    url: shape.url,
                    url_template,
                    headers: shape.headers,
                    timeout: Duration::from_secs(shape.timeout_secs),
                };
                Ok(Arc::new(HttpTransport::new(
                    format!("{}:{user_id}", entry.name),
                    config,
                )?))
            }
        }
    }

    /// Tears down every connection for `user_id` — called on credential
    /// rotation so the next call re-spawns with the new credentials (§4.3).
    pub async fn terminate_for_user(&self, user_id: &str) {
        let keys: Vec<String> = self
            .slots
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.key().clone())
            .collect();
        for k in keys {
            if let Some((_, slot)) = self.slots.remove(&k) {
                let _ = slot.transport.stop().await;
                self.total.fetch_sub(1, Ordering::SeqCst);
                if let Some(mut count) = self.per_user_counts.get_mut(user_id) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// Stops every live instance of `mcp_id` regardless of owning user —
    /// used by the Catalog Reloader when a per-user backend is removed or
    /// its config changes enough that old instances must not survive (§4.9
    /// step 5: "the pool terminates obsolete instances lazily").
    pub async fn terminate_for_backend(&self, mcp_id: &str) {
        let suffix = format!("\u{0}{mcp_id}");
        let keys: Vec<(String, UserId)> = self
            .slots
            .iter()
            .filter(|e| e.key().ends_with(&suffix))
            .map(|e| (e.key().clone(), e.value().user_id.clone()))
            .collect();
        for (k, user_id) in keys {
            if let Some((_, slot)) = self.slots.remove(&k) {
                let _ = slot.transport.stop().await;
                self.total.fetch_sub(1, Ordering::SeqCst);
                if let Some(mut count) = self.per_user_counts.get_mut(&user_id) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    /// Stops and evicts connections idle longer than the configured
    /// timeout. Intended to run on a periodic background tick.
    pub async fn reap_idle(&self) {
        let cutoff = now_unix() - self.limits.idle_timeout.as_secs() as i64;
        let stale: Vec<(String, UserId)> = self
            .slots
            .iter()
            .filter(|e| e.value().last_used_unix.load(Ordering::Relaxed) < cutoff)
            .map(|e| (e.key().clone(), e.value().user_id.clone()))
            .collect();

        for (k, user_id) in stale {
            if let Some((_, slot)) = self.slots.remove(&k) {
                let _ = slot.transport.stop().await;
                self.total.fetch_sub(1, Ordering::SeqCst);
                if let Some(mut count) = self.per_user_counts.get_mut(&user_id) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }

    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for k in keys {
            if let Some((_, slot)) = self.slots.remove(&k) {
                let _ = slot.transport.stop().await;
            }
        }
        self.total.store(0, Ordering::SeqCst);
        self.per_user_counts.clear();
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CatalogEntryStatus, IsolationMode};
    use crate::store::memory::MemoryStore;

    fn entry() -> BackendCatalogEntry {
        BackendCatalogEntry {
            mcp_id: "m1".to_string(),
            name: "m1".to_string(),
            transport: TransportKind::Stdio,
            config: serde_json::json!({"command": "echo"}),
            isolation_mode: IsolationMode::PerUser,
            requires_user_credentials: false,
            status: CatalogEntryStatus::Published,
            tool_catalog: Vec::new(),
        }
    }

    #[tokio::test]
    async fn capacity_rejects_beyond_global_cap() {
        let store = Arc::new(MemoryStore::new());
        let vault = Arc::new(CredentialVault::new([1u8; 32]));
        let limits = PoolLimits {
            global_capacity: 0,
            ..PoolLimits::default()
        };
        let pool = PerUserPool::new(limits, store, vault);
        let result = pool.get_or_spawn("u1", &entry(), None).await;
        assert!(result.is_err());
    }
}
