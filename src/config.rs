//! Process configuration (§6, §9). YAML on disk, `${VAR}` environment
//! interpolation, hot-reloaded catalog file watched the same way the
//! teacher's config file itself used to be watched — diffed and applied
//! rather than restarting the process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

static DOTENV_ONCE: Once = Once::new();

/// Load `~/.env` into the process environment exactly once. Must be called
/// early in `main()`, before any task that reads env vars concurrently.
pub fn load_dotenv() {
    DOTENV_ONCE.call_once(|| {
        let env_path = dirs::home_dir()
            .map(|h| h.join(".env"))
            .filter(|p| p.is_file());
        if let Some(env_file) = env_path
            && let Ok(contents) = std::fs::read_to_string(&env_file)
        {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    // SAFETY: called once, before any task is spawned.
                    unsafe { std::env::set_var(key.trim(), value.trim()) };
                }
            }
        }
    });
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(with = "humantime_duration", default = "default_session_ttl")]
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_session_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_retention_days")]
    pub retention_days: i64,
    #[serde(with = "humantime_duration", default = "default_audit_flush_interval")]
    pub flush_interval: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_audit_retention_days(),
            flush_interval: default_audit_flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_global_capacity")]
    pub global_capacity: usize,
    #[serde(default = "default_per_user_capacity")]
    pub per_user_capacity: usize,
    #[serde(with = "humantime_duration", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            global_capacity: default_global_capacity(),
            per_user_capacity: default_per_user_capacity(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// Admin-surface auth (§6). A full admin-key/password store is explicitly
/// out of scope as an external collaborator; this crate still has to gate
/// `/v1/admin/*` and `/v1/audit/events` with *something*, so it accepts a
/// single operator-configured bearer token instead. May itself be a
/// `secretref:` reference, resolved the same way backend config values are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub token: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ambassador")
}
fn default_catalog_path() -> PathBuf {
    default_data_dir().join("catalog.yaml")
}
fn default_session_ttl() -> Duration {
    Duration::from_secs(8 * 3600)
}
fn default_audit_retention_days() -> i64 {
    90
}
fn default_audit_flush_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_global_capacity() -> usize {
    256
}
fn default_per_user_capacity() -> usize {
    16
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime_format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime_parse(&s).map_err(serde::de::Error::custom)
    }

    fn humantime_format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs.is_multiple_of(3600) && secs >= 3600 {
            format!("{}h", secs / 3600)
        } else if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn humantime_parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                format!("invalid duration '{s}': expected a form like '30s', '5m', '1h'")
            })
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;
        let mut config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.apply_process_env_overrides();
        Ok(config)
    }

    /// `MCP_AMBASSADOR_DATA_DIR`/`_HOST`/`_PORT` override whatever the YAML
    /// file says (§6); host/port only apply if `listen` is still parseable
    /// as `host:port` after either override.
    fn apply_process_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("MCP_AMBASSADOR_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        let host_override = std::env::var("MCP_AMBASSADOR_HOST").ok();
        let port_override = std::env::var("MCP_AMBASSADOR_PORT").ok();
        if host_override.is_some() || port_override.is_some() {
            let (current_host, current_port) = self
                .listen
                .rsplit_once(':')
                .map(|(h, p)| (h.to_string(), p.to_string()))
                .unwrap_or_else(|| (self.listen.clone(), "8787".to_string()));
            let host = host_override.unwrap_or(current_host);
            let port = port_override.unwrap_or(current_port);
            self.listen = format!("{host}:{port}");
        }
    }

    /// Resolves `secretref:` patterns embedded in config values that aren't
    /// part of the catalog file (currently just the admin token). Catalog
    /// entry configs are resolved separately by the caller since they load
    /// from a different file.
    pub fn resolve_secrets(&mut self, resolver: &crate::secrets::SecretResolver) -> Result<()> {
        resolver.resolve_option(&mut self.admin.token)
    }
}

/// Loads the catalog file: a YAML list of backend catalog entries, the
/// on-disk form of §3's Backend Catalog Entry.
///
/// `${ENV_VAR}` placeholders are expanded for dialing, but each HTTP entry's
/// unexpanded `config.url` is also carried through as `config.url_template`
/// (§4.1, §9): diagnostics and error messages must show the template, never
/// a resolved credential, so both forms need to survive past this point.
pub fn load_catalog(path: &Path) -> Result<Vec<crate::model::BackendCatalogEntry>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog file {}", path.display()))?;
    let expanded = shellexpand::env(&raw)
        .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;
    let mut entries: Vec<crate::model::BackendCatalogEntry> = serde_yaml_ng::from_str(&expanded)
        .with_context(|| format!("parsing catalog file {}", path.display()))?;

    // Parse the file a second time, unexpanded, purely to recover each HTTP
    // entry's literal url string (still a valid YAML scalar with `${...}` in
    // it, just not a resolvable URL).
    if let Ok(raw_entries) =
        serde_yaml_ng::from_str::<Vec<crate::model::BackendCatalogEntry>>(&raw)
    {
        for (entry, raw_entry) in entries.iter_mut().zip(raw_entries.iter()) {
            if entry.transport != crate::model::Transport::Http {
                continue;
            }
            let Some(template) = raw_entry.config.get("url").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(obj) = entry.config.as_object_mut() {
                obj.insert(
                    "url_template".to_string(),
                    serde_json::Value::String(template.to_string()),
                );
            }
        }
    }

    Ok(entries)
}

/// Watches the catalog file for changes and applies the diff through the
/// reloader (§4.9), mirroring the teacher's config-file watcher — debounce,
/// reload, diff, apply, log — just pointed at the catalog instead of the
/// whole process config.
pub async fn watch_catalog(
    catalog_path: PathBuf,
    reloader: Arc<crate::catalog::CatalogReloader>,
    secret_resolver: Arc<crate::secrets::SecretResolver>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use tracing::{error, info, warn};

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let watcher_result: std::result::Result<RecommendedWatcher, _> =
        notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res
                && matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                )
            {
                let _ = tx.try_send(());
            }
        });

    let mut watcher = match watcher_result {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to create catalog file watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&catalog_path, RecursiveMode::NonRecursive) {
        error!(path = %catalog_path.display(), error = %e, "failed to watch catalog file");
        return;
    }

    info!(path = %catalog_path.display(), "catalog file watcher started");
    let debounce = Duration::from_millis(500);

    loop {
        tokio::select! {
            Some(()) = rx.recv() => {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}

                info!("catalog file changed, reloading");
                let mut incoming = match load_catalog(&catalog_path) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "failed to parse reloaded catalog, keeping current");
                        continue;
                    }
                };
                let resolved = incoming
                    .iter_mut()
                    .try_for_each(|entry| secret_resolver.resolve_json(&mut entry.config));
                if let Err(e) = resolved {
                    error!(error = %e, "failed to resolve reloaded catalog secrets, keeping current");
                    continue;
                }

                match reloader.apply(incoming).await {
                    Ok(result) => {
                        if !result.errors.is_empty() {
                            warn!(errors = ?result.errors, "catalog reload completed with errors");
                        }
                        info!(
                            added = result.added.len(),
                            removed = result.removed.len(),
                            updated = result.updated.len(),
                            "catalog reload applied"
                        );
                    }
                    Err(e) => error!(error = %e, "catalog reload failed"),
                }
            }
            _ = shutdown.notified() => {
                info!("catalog watcher shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humantime_round_trip() {
        #[derive(Serialize, Deserialize)]
        struct Wrap(#[serde(with = "humantime_duration")] Duration);

        let encoded = serde_json::to_string(&Wrap(Duration::from_secs(300))).unwrap();
        assert_eq!(encoded, "\"5m\"");
        let decoded: Wrap = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(decoded.0, Duration::from_secs(3600));
    }

    #[test]
    fn load_catalog_preserves_http_url_template() {
        unsafe { std::env::set_var("AMB_TEST_TOKEN", "live-secret-value") };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        std::fs::write(
            &path,
            "- mcp_id: m1\n  name: m1\n  transport: http\n  isolation_mode: shared\n  requires_user_credentials: false\n  status: published\n  tool_catalog: []\n  config:\n    url: \"https://api.example.com/mcp?token=${AMB_TEST_TOKEN}\"\n",
        )
        .unwrap();

        let entries = load_catalog(&path).unwrap();
        assert_eq!(entries.len(), 1);
        let url = entries[0].config.get("url").and_then(|v| v.as_str()).unwrap();
        assert!(url.contains("live-secret-value"));
        let template = entries[0]
            .config
            .get("url_template")
            .and_then(|v| v.as_str())
            .unwrap();
        assert!(template.contains("${AMB_TEST_TOKEN}"));
        assert!(!template.contains("live-secret-value"));
        unsafe { std::env::remove_var("AMB_TEST_TOKEN") };
    }

    #[test]
    fn loads_defaults_from_empty_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "log_level: debug\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.session.ttl, Duration::from_secs(8 * 3600));
    }
}
