//! Session Layer (§4.7). Preshared-key validation, HMAC session token
//! issue/verify, session reuse, and per-IP rate limiting. The server HMAC
//! secret, the rate-limit map, and the session store are all owned fields
//! on `SessionManager`, constructed once in `main` and handed down — no
//! ambient globals (§9).

use crate::model::{Client, ClientStatus, Session, SessionStatus, new_session_id};
use crate::store::{ClientStore, SessionStore};
use anyhow::{Context, Result};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const PRESHARED_KEY_PREFIX: &str = "amb_pk_";
pub const SESSION_TOKEN_PREFIX: &str = "amb_st_";
const PRESHARED_KEY_BODY_LEN: usize = 48;
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(8 * 3600);
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const RATE_LIMIT_MAX_REQUESTS: u32 = 10;
const CONSECUTIVE_FAILURE_BACKOFF_START: u32 = 3;
const RATE_LIMIT_REAP_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid key format")]
    InvalidKeyFormat,
    #[error("invalid token format")]
    InvalidFormat,
    #[error("invalid credentials")]
    Unauthorized,
    #[error("invalid token")]
    InvalidToken,
    #[error("session expired")]
    SessionExpired,
    #[error("profile mismatch")]
    ProfileMismatch,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct VerifiedSession {
    pub session_id: String,
    pub user_id: String,
    pub client_id: String,
    pub profile_id: String,
    pub expires_at: i64,
}

pub struct RegisteredSession {
    pub session_id: String,
    pub session_token: String,
    pub profile_id: String,
    pub expires_at: i64,
}

struct IpState {
    window_start: SystemTime,
    request_count: u32,
    consecutive_failures: u32,
    last_seen: SystemTime,
}

/// Server HMAC secret, loaded with the priority order from §4.7: env var
/// (hex) -> file at `{data_dir}/session_hmac_secret` (0600) -> generate new
/// and persist.
pub struct ServerSecret {
    bytes: Mutex<[u8; 64]>,
    path: PathBuf,
}

impl ServerSecret {
    pub fn load_or_create(data_dir: &std::path::Path) -> Result<Self> {
        let path = data_dir.join("session_hmac_secret");

        if let Ok(hex) = std::env::var("SESSION_HMAC_SECRET") {
            let bytes = decode_hex_64(&hex).context("SESSION_HMAC_SECRET is not valid hex")?;
            return Ok(Self {
                bytes: Mutex::new(bytes),
                path,
            });
        }

        if path.exists() {
            let hex = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let bytes = decode_hex_64(hex.trim())
                .with_context(|| format!("{} does not contain a valid secret", path.display()))?;
            return Ok(Self {
                bytes: Mutex::new(bytes),
                path,
            });
        }

        let mut bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut bytes);
        persist_secret(&path, &bytes)?;
        Ok(Self {
            bytes: Mutex::new(bytes),
            path,
        })
    }

    /// Replaces the in-memory secret and persists it. All existing tokens
    /// become invalid immediately since verification recomputes from the
    /// new secret.
    pub fn rotate(&self) -> Result<()> {
        let mut bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut bytes);
        persist_secret(&self.path, &bytes)?;
        *self.bytes.lock().unwrap() = bytes;
        Ok(())
    }

    fn hmac(&self, session_id: &str, nonce: &[u8]) -> Vec<u8> {
        let key = *self.bytes.lock().unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(session_id.as_bytes());
        mac.update(hex::encode(nonce).as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

fn persist_secret(path: &std::path::Path, bytes: &[u8; 64]) -> Result<()> {
    let hex = hex::encode(bytes);
    std::fs::write(path, &hex).with_context(|| format!("writing {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn decode_hex_64(s: &str) -> Result<[u8; 64]> {
    let v = hex::decode(s)?;
    let arr: [u8; 64] = v
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret must be exactly 64 bytes"))?;
    Ok(arr)
}

/// Tiny local hex codec so the crate doesn't need a dedicated `hex` crate
/// solely for this one encode/decode pair.
mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn decode(s: &str) -> anyhow::Result<Vec<u8>> {
        if s.len() % 2 != 0 {
            anyhow::bail!("odd-length hex string");
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(Into::into))
            .collect()
    }
}

pub struct SessionManager {
    clients: std::sync::Arc<dyn ClientStore>,
    sessions: std::sync::Arc<dyn SessionStore>,
    secret: ServerSecret,
    rate_limits: Mutex<HashMap<String, IpState>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(
        clients: std::sync::Arc<dyn ClientStore>,
        sessions: std::sync::Arc<dyn SessionStore>,
        secret: ServerSecret,
    ) -> Self {
        Self {
            clients,
            sessions,
            secret,
            rate_limits: Mutex::new(HashMap::new()),
            ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Removes rate-limit entries idle past `RATE_LIMIT_REAP_AGE` (§5).
    pub fn reap_rate_limits(&self) {
        let now = SystemTime::now();
        self.rate_limits.lock().unwrap().retain(|_, s| {
            now.duration_since(s.last_seen).unwrap_or_default() < RATE_LIMIT_REAP_AGE
        });
    }

    fn check_rate_limit(&self, source_ip: &str) -> Result<(), SessionError> {
        let now = SystemTime::now();
        let mut map = self.rate_limits.lock().unwrap();
        let state = map.entry(source_ip.to_string()).or_insert_with(|| IpState {
            window_start: now,
            request_count: 0,
            consecutive_failures: 0,
            last_seen: now,
        });
        state.last_seen = now;

        if state.consecutive_failures >= CONSECUTIVE_FAILURE_BACKOFF_START {
            let exponent = state.consecutive_failures - CONSECUTIVE_FAILURE_BACKOFF_START;
            let backoff = RATE_LIMIT_WINDOW * 2u32.saturating_pow(exponent);
            let elapsed = now.duration_since(state.window_start).unwrap_or_default();
            if elapsed < backoff {
                let retry_after = backoff - elapsed;
                return Err(SessionError::RateLimited {
                    retry_after_secs: retry_after.as_secs().max(1),
                });
            }
        }

        if now.duration_since(state.window_start).unwrap_or_default() >= RATE_LIMIT_WINDOW {
            state.window_start = now;
            state.request_count = 0;
        }

        state.request_count += 1;
        if state.request_count > RATE_LIMIT_MAX_REQUESTS {
            let elapsed = now.duration_since(state.window_start).unwrap_or_default();
            let retry_after = RATE_LIMIT_WINDOW.saturating_sub(elapsed);
            return Err(SessionError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        Ok(())
    }

    fn record_failure(&self, source_ip: &str) {
        let now = SystemTime::now();
        let mut map = self.rate_limits.lock().unwrap();
        if let Some(state) = map.get_mut(source_ip) {
            if state.consecutive_failures == 0 {
                state.window_start = now;
            }
            state.consecutive_failures += 1;
        }
    }

    fn record_success(&self, source_ip: &str) {
        if let Some(state) = self.rate_limits.lock().unwrap().get_mut(source_ip) {
            state.consecutive_failures = 0;
        }
    }

    /// Registration (§4.7): validate a preshared key, reuse or create a
    /// session. `friendly_name`/`host_tool` are accepted for audit/display
    /// only and never participate in session-reuse matching (open question
    /// 3, see DESIGN.md).
    pub async fn register(
        &self,
        preshared_key: &str,
        source_ip: &str,
    ) -> Result<RegisteredSession, SessionError> {
        self.check_rate_limit(source_ip)?;

        match self.validate_key(preshared_key).await {
            Ok(client) => {
                self.record_success(source_ip);
                self.register_for_client(&client).await
            }
            Err(e) => {
                self.record_failure(source_ip);
                Err(e)
            }
        }
    }

    async fn validate_key(&self, preshared_key: &str) -> Result<Client, SessionError> {
        let body = match preshared_key.strip_prefix(PRESHARED_KEY_PREFIX) {
            Some(b) if b.len() == PRESHARED_KEY_BODY_LEN && is_url_safe_base64(b) => b,
            _ => {
                timing_normalize_delay().await;
                return Err(SessionError::InvalidKeyFormat);
            }
        };

        let key_prefix = &body[..8];
        let now = now_unix();

        let candidates = self
            .clients
            .find_by_key_prefix(key_prefix)
            .await
            .map_err(SessionError::Other)?
            .into_iter()
            .filter(|c| c.status == ClientStatus::Active && !c.is_expired(now));

        for candidate in candidates {
            if verify_password_hash(&candidate.key_hash, preshared_key) {
                return Ok(candidate);
            }
        }

        timing_normalize_delay().await;
        Err(SessionError::Unauthorized)
    }

    async fn register_for_client(
        &self,
        client: &Client,
    ) -> Result<RegisteredSession, SessionError> {
        if let Some(existing) = self
            .sessions
            .get_active_for_client(&client.user_id, &client.client_id)
            .await
            .map_err(SessionError::Other)?
        {
            if existing.profile_id != client.profile_id {
                // Never reveal either profile id in the error.
                return Err(SessionError::ProfileMismatch);
            }

            let nonce = random_nonce();
            let token_hash_raw = self.secret.hmac(&existing.session_id, &nonce);
            let token = format!(
                "{SESSION_TOKEN_PREFIX}{}",
                URL_SAFE_NO_PAD.encode(&token_hash_raw)
            );
            let now = now_unix();

            let updated = Session {
                status: SessionStatus::Active,
                last_activity_at: now,
                nonce: nonce.clone(),
                token_hash: hex::encode(&token_hash_raw),
                ..existing
            };
            let expires_at = updated.expires_at;
            let session_id = updated.session_id.clone();
            let profile_id = updated.profile_id.clone();
            self.sessions
                .put(updated)
                .await
                .map_err(SessionError::Other)?;

            return Ok(RegisteredSession {
                session_id,
                session_token: token,
                profile_id,
                expires_at,
            });
        }

        let session_id = new_session_id();
        let nonce = random_nonce();
        let token_hash_raw = self.secret.hmac(&session_id, &nonce);
        let token = format!(
            "{SESSION_TOKEN_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(&token_hash_raw)
        );
        let now = now_unix();
        let expires_at = now + self.ttl.as_secs() as i64;

        let session = Session {
            session_id: session_id.clone(),
            user_id: client.user_id.clone(),
            client_id: client.client_id.clone(),
            profile_id: client.profile_id.clone(),
            token_hash: hex::encode(&token_hash_raw),
            nonce,
            status: SessionStatus::Active,
            created_at: now,
            last_activity_at: now,
            expires_at,
        };
        self.sessions
            .put(session)
            .await
            .map_err(SessionError::Other)?;

        Ok(RegisteredSession {
            session_id,
            session_token: token,
            profile_id: client.profile_id.clone(),
            expires_at,
        })
    }

    /// Verification (§4.7).
    pub async fn verify(&self, raw_token: &str) -> Result<VerifiedSession, SessionError> {
        let body = raw_token
            .strip_prefix(SESSION_TOKEN_PREFIX)
            .ok_or(SessionError::InvalidFormat)?;
        let provided = URL_SAFE_NO_PAD
            .decode(pad_base64(body))
            .map_err(|_| SessionError::InvalidFormat)?;
        let token_hash = hex::encode(&provided);

        let session = self
            .sessions
            .get_by_token_hash(&token_hash)
            .await
            .map_err(SessionError::Other)?
            .filter(|s| matches!(s.status, SessionStatus::Active | SessionStatus::Idle))
            .ok_or(SessionError::InvalidToken)?;

        let expected = self.secret.hmac(&session.session_id, &session.nonce);
        if expected.ct_eq(&provided).unwrap_u8() != 1 {
            return Err(SessionError::InvalidToken);
        }

        if now_unix() > session.expires_at {
            return Err(SessionError::SessionExpired);
        }

        Ok(VerifiedSession {
            session_id: session.session_id,
            user_id: session.user_id,
            client_id: session.client_id,
            profile_id: session.profile_id,
            expires_at: session.expires_at,
        })
    }
}

fn is_url_safe_base64(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn pad_base64(s: &str) -> String {
    let rem = s.len() % 4;
    if rem == 0 {
        s.to_string()
    } else {
        format!("{s}{}", "=".repeat(4 - rem))
    }
}

fn random_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Sleeps a uniform 0-200ms so format failures and hash mismatches take
/// indistinguishable time (§4.7 timing normalization).
async fn timing_normalize_delay() {
    let millis = rand::thread_rng().next_u32() % 200;
    tokio::time::sleep(Duration::from_millis(millis as u64)).await;
}

fn verify_password_hash(stored_hash: &str, candidate: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok()
}

/// Hashes a preshared/admin/recovery key with Argon2id at the parameters
/// named in §6 (m=19456 KiB, t=2, p=1).
pub fn hash_key(raw: &str) -> Result<String> {
    use argon2::password_hash::{SaltString, rand_core::OsRng};
    use argon2::{Algorithm, Params, Version};

    let salt = SaltString::generate(&mut OsRng);
    let params = Params::new(19456, 2, 1, None).context("invalid argon2 params")?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let hash = argon2::PasswordHasher::hash_password(&argon2, raw.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("argon2 hash failed: {e}"))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;

    fn secret() -> ServerSecret {
        let dir = tempfile::tempdir().unwrap();
        ServerSecret::load_or_create(dir.path()).unwrap()
    }

    #[test]
    fn hmac_round_trip_same_secret() {
        let s = secret();
        let a = s.hmac("sess-1", b"nonce");
        let b = s.hmac("sess-1", b"nonce");
        assert_eq!(a, b);
    }

    #[test]
    fn hmac_differs_across_secrets() {
        let s1 = secret();
        let s2 = secret();
        assert_ne!(s1.hmac("sess-1", b"nonce"), s2.hmac("sess-1", b"nonce"));
    }

    #[tokio::test]
    async fn rate_limiter_trips_after_ten_requests() {
        let store = Arc::new(MemoryStore::new());
        let mgr = SessionManager::new(store.clone(), store, secret());
        for _ in 0..10 {
            mgr.check_rate_limit("198.51.100.7").unwrap();
        }
        assert!(matches!(
            mgr.check_rate_limit("198.51.100.7"),
            Err(SessionError::RateLimited { .. })
        ));
    }

    #[test]
    fn glob_unrelated_sanity() {
        assert!(is_url_safe_base64("abc-_123"));
        assert!(!is_url_safe_base64("abc+/="));
    }
}
