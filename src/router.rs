//! Tool Router (§4.4): the single call path from a verified session to a
//! backend's `tools/call`. Every step — authorize, resolve, dispatch,
//! audit — happens here in that order; no other module is allowed to call
//! a `Transport` directly on a client's behalf.

use crate::authz::{AuthorizationEngine, Authorizer, AuthzContext, Decision};
use crate::audit::AuditSink;
use crate::catalog::CatalogResolver;
use crate::error::{ApiError, ApiResult};
use crate::model::{Client, IsolationMode, User, UserId};
use crate::pool::PerUserPool;
use crate::shared::SharedManager;
use crate::store::UserStore;
use serde_json::Value;
use std::sync::Arc;

pub struct ToolRouter {
    resolver: Arc<CatalogResolver>,
    authz: Arc<AuthorizationEngine>,
    shared: Arc<SharedManager>,
    pool: Arc<PerUserPool>,
    users: Arc<dyn UserStore>,
    audit: Arc<dyn AuditSink>,
}

pub struct InvokeContext<'a> {
    pub session_id: &'a str,
    pub client: &'a Client,
    pub source_ip_hash: Option<String>,
}

impl ToolRouter {
    pub fn new(
        resolver: Arc<CatalogResolver>,
        authz: Arc<AuthorizationEngine>,
        shared: Arc<SharedManager>,
        pool: Arc<PerUserPool>,
        users: Arc<dyn UserStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            resolver,
            authz,
            shared,
            pool,
            users,
            audit,
        }
    }

    /// The tools a client is both subscribed to and permitted to call.
    pub async fn list_tools(&self, client: &Client) -> ApiResult<Vec<String>> {
        let resolved = self
            .resolver
            .resolve_for_client(client)
            .await
            .map_err(ApiError::Internal)?;
        let ctx = AuthzContext {
            client_status: client.status,
            profile_id: client.profile_id.clone(),
        };
        let candidates: Vec<String> = resolved.into_iter().map(|t| t.tool_name).collect();
        self.authz
            .list_authorized(&ctx, &candidates)
            .await
            .map_err(ApiError::Internal)
    }

    pub async fn invoke(
        &self,
        ctx: &InvokeContext<'_>,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> ApiResult<Value> {
        let client = ctx.client;
        let authz_ctx = AuthzContext {
            client_status: client.status,
            profile_id: client.profile_id.clone(),
        };

        let decision = self
            .authz
            .authorize(&authz_ctx, tool_name)
            .await
            .map_err(ApiError::Internal)?;

        if decision.decision == Decision::Deny {
            self.emit_audit(ctx, tool_name, None, "denied", Some(decision.reason.as_str()), None)
                .await;
            return Err(ApiError::ToolNotAllowed(tool_name.to_string()));
        }

        let resolved = self
            .resolver
            .resolve_for_client(client)
            .await
            .map_err(ApiError::Internal)?;
        let Some(target) = resolved.into_iter().find(|t| t.tool_name == tool_name) else {
            self.emit_audit(ctx, tool_name, None, "not_found", None, None).await;
            return Err(ApiError::NotFound(format!("tool '{tool_name}'")));
        };

        let entry = self
            .resolver
            .backend_for(&target.source_mcp)
            .await
            .map_err(ApiError::Internal)?
            .ok_or_else(|| ApiError::NotFound(format!("backend '{}'", target.source_mcp)))?;

        let transport = match entry.isolation_mode {
            IsolationMode::Shared => self.shared.ensure_started(&entry).await?,
            IsolationMode::PerUser => {
                let vault_salt = self.vault_salt_for(&client.user_id).await?;
                self.pool
                    .get_or_spawn(&client.user_id, &entry, vault_salt.as_deref())
                    .await?
            }
        };

        let result = transport.invoke(tool_name, arguments).await;

        match &result {
            Ok(_) => {
                self.emit_audit(
                    ctx,
                    tool_name,
                    Some(&target.source_mcp),
                    "invoked",
                    Some(decision.reason.as_str()),
                    None,
                )
                .await;
            }
            Err(e) => {
                self.emit_audit(
                    ctx,
                    tool_name,
                    Some(&target.source_mcp),
                    "invoke_failed",
                    Some(decision.reason.as_str()),
                    Some(e.to_string()),
                )
                .await;
            }
        }

        Ok(result?)
    }

    async fn vault_salt_for(&self, user_id: &UserId) -> ApiResult<Option<String>> {
        let user: Option<User> = self.users.get(user_id).await.map_err(ApiError::Internal)?;
        Ok(user.and_then(|u| u.vault_salt))
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_audit(
        &self,
        ctx: &InvokeContext<'_>,
        tool_name: &str,
        downstream_mcp: Option<&str>,
        action: &str,
        authz_policy: Option<&str>,
        error: Option<String>,
    ) {
        use crate::model::{AuditEvent, AuditSeverity};

        let event = AuditEvent {
            event_id: crate::model::new_session_id(),
            timestamp: now_iso8601(),
            event_type: "tool.invoke".to_string(),
            severity: if error.is_some() {
                AuditSeverity::Error
            } else {
                AuditSeverity::Info
            },
            session_id: Some(ctx.session_id.to_string()),
            client_id: Some(ctx.client.client_id.clone()),
            user_id: Some(ctx.client.user_id.clone()),
            source_ip_hash: ctx.source_ip_hash.clone(),
            tool_name: Some(tool_name.to_string()),
            downstream_mcp: downstream_mcp.map(|s| s.to_string()),
            action: action.to_string(),
            request_summary: None,
            response_summary: error.map(|e| Value::String(e)),
            authz_decision: Some(if action == "denied" { "deny" } else { "permit" }.to_string()),
            authz_policy: authz_policy.map(|s| s.to_string()),
            metadata: Default::default(),
        };
        self.audit.emit(event).await;
    }
}

fn now_iso8601() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = (secs / 86400) as i64;
    let date = crate::audit::civil_date_from_unix_days(days);
    let time_of_day = secs % 86400;
    format!(
        "{date}T{:02}:{:02}:{:02}.000Z",
        time_of_day / 3600,
        (time_of_day % 3600) / 60,
        time_of_day % 60
    )
}
