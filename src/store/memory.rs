//! In-memory implementation of the storage traits. Backs tests and a
//! from-scratch local deployment; a SQL-backed implementation is left as an
//! external adapter per the specification's non-goal on schema migrations.

use super::*;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Sessions beyond this count are evicted oldest-first on insertion,
/// realizing the "1 000 user sessions LRU" cap (§5).
pub const SESSION_STORE_CAP: usize = 1000;

pub struct MemoryStore {
    pub users: DashMap<String, User>,
    pub clients: DashMap<String, Client>,
    pub profiles: DashMap<String, Profile>,
    pub catalog: DashMap<String, BackendCatalogEntry>,
    pub subscriptions: DashMap<String, Subscription>,
    pub credentials: DashMap<(String, String), UserCredential>,
    sessions_by_id: DashMap<String, Session>,
    sessions_by_hash: DashMap<String, String>,
    session_order: Mutex<VecDeque<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            clients: DashMap::new(),
            profiles: DashMap::new(),
            catalog: DashMap::new(),
            subscriptions: DashMap::new(),
            credentials: DashMap::new(),
            sessions_by_id: DashMap::new(),
            sessions_by_hash: DashMap::new(),
            session_order: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users.get(user_id).map(|r| r.value().clone()))
    }
}

#[async_trait]
impl ClientStore for MemoryStore {
    async fn get(&self, client_id: &str) -> Result<Option<Client>> {
        Ok(self.clients.get(client_id).map(|r| r.value().clone()))
    }

    async fn find_by_key_prefix(&self, key_prefix: &str) -> Result<Vec<Client>> {
        Ok(self
            .clients
            .iter()
            .filter(|r| r.value().key_prefix == key_prefix)
            .map(|r| r.value().clone())
            .collect())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get(&self, profile_id: &str) -> Result<Option<Profile>> {
        Ok(self.profiles.get(profile_id).map(|r| r.value().clone()))
    }

    async fn upsert(&self, profile: Profile) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        seen.insert(profile.profile_id.clone());
        let mut current = profile.inherited_from.clone();
        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                anyhow::bail!(
                    "profile '{}' would introduce an inheritance cycle at '{id}'",
                    profile.profile_id
                );
            }
            current = self.profiles.get(&id).and_then(|p| p.inherited_from.clone());
        }
        self.profiles.insert(profile.profile_id.clone(), profile);
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get(&self, mcp_id: &str) -> Result<Option<BackendCatalogEntry>> {
        Ok(self.catalog.get(mcp_id).map(|r| r.value().clone()))
    }

    async fn all(&self) -> Result<Vec<BackendCatalogEntry>> {
        Ok(self.catalog.iter().map(|r| r.value().clone()).collect())
    }

    async fn upsert(&self, entry: BackendCatalogEntry) -> Result<()> {
        self.catalog.insert(entry.mcp_id.clone(), entry);
        Ok(())
    }

    async fn remove(&self, mcp_id: &str) -> Result<()> {
        self.catalog.remove(mcp_id);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn active_for_client(&self, client_id: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|r| {
                r.value().client_id == client_id
                    && r.value().status == SubscriptionStatus::Active
            })
            .map(|r| r.value().clone())
            .collect())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, user_id: &str, mcp_id: &str) -> Result<Option<UserCredential>> {
        Ok(self
            .credentials
            .get(&(user_id.to_string(), mcp_id.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn put(&self, credential: UserCredential) -> Result<()> {
        self.credentials.insert(
            (credential.user_id.clone(), credential.mcp_id.clone()),
            credential,
        );
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>> {
        let Some(id) = self.sessions_by_hash.get(token_hash).map(|r| r.clone()) else {
            return Ok(None);
        };
        Ok(self.sessions_by_id.get(&id).map(|r| r.value().clone()))
    }

    async fn get_active_for_client(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<Session>> {
        Ok(self
            .sessions_by_id
            .iter()
            .find(|r| {
                let s = r.value();
                s.user_id == user_id
                    && s.client_id == client_id
                    && matches!(
                        s.status,
                        SessionStatus::Active | SessionStatus::Idle | SessionStatus::SpinningDown
                    )
            })
            .map(|r| r.value().clone()))
    }

    async fn put(&self, session: Session) -> Result<()> {
        let id = session.session_id.clone();
        let hash = session.token_hash.clone();

        let is_new = !self.sessions_by_id.contains_key(&id);
        self.sessions_by_hash.insert(hash, id.clone());
        self.sessions_by_id.insert(id.clone(), session);

        if is_new {
            let mut order = self.session_order.lock().unwrap();
            order.push_back(id);
            while order.len() > SESSION_STORE_CAP {
                if let Some(evict) = order.pop_front() {
                    if let Some((_, s)) = self.sessions_by_id.remove(&evict) {
                        self.sessions_by_hash.remove(&s.token_hash);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, inherited_from: Option<&str>) -> Profile {
        Profile {
            profile_id: id.to_string(),
            name: id.to_string(),
            allowed_tools: Vec::new(),
            denied_tools: Vec::new(),
            inherited_from: inherited_from.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn profile_upsert_rejects_self_cycle() {
        let store = MemoryStore::new();
        let result = store.upsert(profile("p1", Some("p1"))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn profile_upsert_rejects_longer_cycle() {
        let store = MemoryStore::new();
        store.upsert(profile("a", None)).await.unwrap();
        store.upsert(profile("b", Some("a"))).await.unwrap();
        // Rewriting "a" to inherit from "b" closes the loop a -> b -> a.
        let result = store.upsert(profile("a", Some("b"))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn profile_upsert_accepts_acyclic_chain() {
        let store = MemoryStore::new();
        store.upsert(profile("root", None)).await.unwrap();
        store.upsert(profile("child", Some("root"))).await.unwrap();
        assert!(store.get("child").await.unwrap().is_some());
    }
}
