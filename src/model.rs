//! Storage-agnostic data model. Entities here carry the invariants named in
//! the data model; enforcing them at the write boundary is the job of the
//! `store` implementations, not of these plain structs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type UserId = String;
pub type ClientId = String;
pub type ProfileId = String;
pub type McpId = String;
pub type SessionId = String;
pub type SubscriptionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
    Deactivated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub password_hash: Option<String>,
    pub status: UserStatus,
    pub is_admin: bool,
    /// Immutable once set; backs the Credential Vault's per-user key derivation.
    pub vault_salt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
    Suspended,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: ClientId,
    pub user_id: UserId,
    pub profile_id: ProfileId,
    /// First 8 chars of the random portion of the preshared key; indexes the hash lookup.
    pub key_prefix: String,
    pub key_hash: String,
    pub status: ClientStatus,
    pub expires_at: Option<i64>,
}

impl Client {
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub profile_id: ProfileId,
    pub name: String,
    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,
    pub inherited_from: Option<ProfileId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    Shared,
    PerUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogEntryStatus {
    Draft,
    Published,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCatalogEntry {
    pub mcp_id: McpId,
    pub name: String,
    pub transport: Transport,
    /// Opaque to this layer beyond what `config::BackendSpec` needs to dial it.
    pub config: serde_json::Value,
    pub isolation_mode: IsolationMode,
    pub requires_user_credentials: bool,
    pub status: CatalogEntryStatus,
    pub tool_catalog: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: SubscriptionId,
    pub client_id: ClientId,
    pub mcp_id: McpId,
    pub selected_tools: Vec<String>,
    pub status: SubscriptionStatus,
}

/// Plaintext is an opaque key->value map the backend consumes via injected
/// environment variables (stdio) or headers (HTTP). Only the ciphertext is
/// ever persisted; `vault.rs` is the only module that sees plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredential {
    pub user_id: UserId,
    pub mcp_id: McpId,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    SpinningDown,
    Expired,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub client_id: ClientId,
    pub profile_id: ProfileId,
    pub token_hash: String,
    pub nonce: Vec<u8>,
    pub status: SessionStatus,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub expires_at: i64,
}

pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    /// ISO-8601, e.g. "2026-02-16T10:00:00.000Z".
    pub timestamp: String,
    pub event_type: String,
    pub severity: AuditSeverity,
    pub session_id: Option<SessionId>,
    pub client_id: Option<ClientId>,
    pub user_id: Option<UserId>,
    pub source_ip_hash: Option<String>,
    pub tool_name: Option<String>,
    pub downstream_mcp: Option<McpId>,
    pub action: String,
    pub request_summary: Option<serde_json::Value>,
    pub response_summary: Option<serde_json::Value>,
    pub authz_decision: Option<String>,
    pub authz_policy: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AuditEvent {
    /// `timestamp.date()` — the grouping key for rotation (§4.8).
    pub fn date(&self) -> &str {
        self.timestamp.get(0..10).unwrap_or(&self.timestamp)
    }
}
