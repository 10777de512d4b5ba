//! Catalog Resolver (§4.5): turns a client's active subscriptions into a
//! concrete set of callable tools, tagged with the backend that serves
//! each. Denial is not applied here — that's the Authorization Engine's
//! job, evaluated per call against the live profile chain, not baked into
//! a cached resolution.

use crate::authz::{AuthorizationEngine, glob_match};
use crate::model::{BackendCatalogEntry, CatalogEntryStatus, Client, McpId, ToolDescriptor};
use crate::store::{CatalogStore, SubscriptionStore};
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub tool_name: String,
    pub source_mcp: McpId,
    pub descriptor: ToolDescriptor,
}

pub struct CatalogResolver {
    catalog: Arc<dyn CatalogStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    authz: Arc<AuthorizationEngine>,
}

impl CatalogResolver {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        authz: Arc<AuthorizationEngine>,
    ) -> Self {
        Self {
            catalog,
            subscriptions,
            authz,
        }
    }

    /// The tool set a client's active, published subscriptions make
    /// reachable. A subscription with an empty `selected_tools` list
    /// subscribes to the backend's whole published catalog; the result is
    /// then narrowed to the client's flattened `allowed_tools` (§4.5 step
    /// 4). `denied_tools` are deliberately not applied here — only
    /// `authorize` subtracts those, so a denial can carry a reason instead
    /// of the tool silently disappearing from discovery.
    pub async fn resolve_for_client(&self, client: &Client) -> Result<Vec<ResolvedTool>> {
        let subscriptions = self.subscriptions.active_for_client(&client.client_id).await?;
        let allowed_globs = self.authz.allowed_globs(&client.profile_id).await?;
        let mut resolved = Vec::new();

        for subscription in subscriptions {
            let Some(entry) = self.catalog.get(&subscription.mcp_id).await? else {
                continue;
            };
            if entry.status != CatalogEntryStatus::Published {
                continue;
            }

            for tool in &entry.tool_catalog {
                let selected = subscription.selected_tools.is_empty()
                    || subscription.selected_tools.contains(&tool.name);
                if !selected {
                    continue;
                }
                if !allowed_globs.is_empty() && !allowed_globs.iter().any(|p| glob_match(p, &tool.name)) {
                    continue;
                }
                resolved.push(ResolvedTool {
                    tool_name: tool.name.clone(),
                    source_mcp: entry.mcp_id.clone(),
                    descriptor: tool.clone(),
                });
            }
        }

        Ok(resolved)
    }

    /// The catalog entry backing a resolved tool's backend, used by the
    /// router to pick Shared Manager vs. Per-User Pool dispatch.
    pub async fn backend_for(&self, mcp_id: &str) -> Result<Option<BackendCatalogEntry>> {
        self.catalog.get(mcp_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IsolationMode, Profile, Subscription, SubscriptionStatus, Transport};
    use crate::store::memory::MemoryStore;

    fn client() -> Client {
        Client {
            client_id: "c1".to_string(),
            user_id: "u1".to_string(),
            profile_id: "p1".to_string(),
            key_prefix: "abcd1234".to_string(),
            key_hash: "hash".to_string(),
            status: crate::model::ClientStatus::Active,
            expires_at: None,
        }
    }

    fn insert_unrestricted_profile(store: &MemoryStore) {
        store.profiles.insert(
            "p1".to_string(),
            Profile {
                profile_id: "p1".to_string(),
                name: "default".to_string(),
                allowed_tools: Vec::new(),
                denied_tools: Vec::new(),
                inherited_from: None,
            },
        );
    }

    fn entry() -> BackendCatalogEntry {
        BackendCatalogEntry {
            mcp_id: "m1".to_string(),
            name: "m1".to_string(),
            transport: Transport::Stdio,
            config: serde_json::json!({}),
            isolation_mode: IsolationMode::Shared,
            requires_user_credentials: false,
            status: CatalogEntryStatus::Published,
            tool_catalog: vec![
                ToolDescriptor {
                    name: "search".to_string(),
                    description: "".to_string(),
                    input_schema: serde_json::json!({}),
                },
                ToolDescriptor {
                    name: "write".to_string(),
                    description: "".to_string(),
                    input_schema: serde_json::json!({}),
                },
            ],
        }
    }

    #[tokio::test]
    async fn selected_tools_intersection() {
        let store = Arc::new(MemoryStore::new());
        store.upsert(entry()).await.unwrap();
        insert_unrestricted_profile(&store);
        store
            .subscriptions
            .insert(
                "s1".to_string(),
                Subscription {
                    subscription_id: "s1".to_string(),
                    client_id: "c1".to_string(),
                    mcp_id: "m1".to_string(),
                    selected_tools: vec!["search".to_string()],
                    status: SubscriptionStatus::Active,
                },
            );

        let authz = Arc::new(AuthorizationEngine::new(store.clone()));
        let resolver = CatalogResolver::new(store.clone(), store, authz);
        let tools = resolver.resolve_for_client(&client()).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_name, "search");
    }

    #[tokio::test]
    async fn empty_selection_resolves_whole_catalog() {
        let store = Arc::new(MemoryStore::new());
        store.upsert(entry()).await.unwrap();
        insert_unrestricted_profile(&store);
        store.subscriptions.insert(
            "s1".to_string(),
            Subscription {
                subscription_id: "s1".to_string(),
                client_id: "c1".to_string(),
                mcp_id: "m1".to_string(),
                selected_tools: vec![],
                status: SubscriptionStatus::Active,
            },
        );

        let authz = Arc::new(AuthorizationEngine::new(store.clone()));
        let resolver = CatalogResolver::new(store.clone(), store, authz);
        let tools = resolver.resolve_for_client(&client()).await.unwrap();
        assert_eq!(tools.len(), 2);
    }

    #[tokio::test]
    async fn allowed_tools_narrow_resolution() {
        let store = Arc::new(MemoryStore::new());
        store.upsert(entry()).await.unwrap();
        store.profiles.insert(
            "p1".to_string(),
            Profile {
                profile_id: "p1".to_string(),
                name: "restricted".to_string(),
                allowed_tools: vec!["search".to_string()],
                denied_tools: Vec::new(),
                inherited_from: None,
            },
        );
        store.subscriptions.insert(
            "s1".to_string(),
            Subscription {
                subscription_id: "s1".to_string(),
                client_id: "c1".to_string(),
                mcp_id: "m1".to_string(),
                selected_tools: vec![],
                status: SubscriptionStatus::Active,
            },
        );

        let authz = Arc::new(AuthorizationEngine::new(store.clone()));
        let resolver = CatalogResolver::new(store.clone(), store, authz);
        let tools = resolver.resolve_for_client(&client()).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_name, "search");
    }
}
