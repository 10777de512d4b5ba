//! Storage boundary. Real persistence (SQL schema, migrations) is an
//! external concern; these traits are the narrow seam the proxy engine
//! depends on, following the same narrow-trait-plus-swappable-impl idiom
//! as `secrets::resolver::SecretProvider`.

pub mod memory;

use crate::model::*;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<User>>;
}

#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn get(&self, client_id: &str) -> Result<Option<Client>>;
    /// Candidates sharing a `key_prefix`, restricted to active/non-expired
    /// status is the caller's job (session.rs) so hash comparisons still
    /// run against revoked clients uniformly for timing safety.
    async fn find_by_key_prefix(&self, key_prefix: &str) -> Result<Vec<Client>>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, profile_id: &str) -> Result<Option<Profile>>;
    /// Writes a profile, rejecting it if its `inherited_from` chain (as it
    /// would exist after this write) contains a cycle. Cycle detection
    /// lives at the write boundary rather than at authorize-time, so a bad
    /// profile can never reach the Authorization Engine's depth-bounded
    /// walk in the first place (§9).
    async fn upsert(&self, profile: Profile) -> Result<()>;
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get(&self, mcp_id: &str) -> Result<Option<BackendCatalogEntry>>;
    async fn all(&self) -> Result<Vec<BackendCatalogEntry>>;
    async fn upsert(&self, entry: BackendCatalogEntry) -> Result<()>;
    async fn remove(&self, mcp_id: &str) -> Result<()>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn active_for_client(&self, client_id: &str) -> Result<Vec<Subscription>>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, user_id: &str, mcp_id: &str) -> Result<Option<UserCredential>>;
    async fn put(&self, credential: UserCredential) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>>;
    async fn get_active_for_client(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<Session>>;
    async fn put(&self, session: Session) -> Result<()>;
}
