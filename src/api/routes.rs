//! Route handlers for the full `/v1/...` surface (§6). Each handler does
//! the HTTP-shape work only — parsing, the response envelope, and which
//! extractor gates it; the actual proxy-engine logic lives in
//! `session::SessionManager`, `router::ToolRouter`, `shared::SharedManager`,
//! and `catalog::CatalogReloader`.

use axum::Json;
use axum::extract::{Path, Query, State};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditQuery;
use crate::catalog::CatalogDiff;
use crate::error::{ApiError, ApiResult};
use crate::model::{AuditEvent, AuditSeverity};
use crate::router::InvokeContext;
use crate::store::CatalogStore;

use super::extract::{AdminAuth, SessionAuth, SourceIp};
use super::{ApiState, Envelope, Pagination};

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub preshared_key: String,
    /// Accepted for audit/display only; never participates in session-reuse
    /// matching (see `session.rs`'s `register_for_client`).
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub host_tool: Option<String>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub session_id: String,
    pub session_token: String,
    pub profile_id: String,
    pub expires_at: i64,
}

pub async fn register_session(
    State(state): State<ApiState>,
    SourceIp(ip): SourceIp,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<Envelope<RegisterResponse>>> {
    let source_ip_hash = state.ip_salt.hash(ip);
    let registered = state
        .sessions
        .register(&req.preshared_key, &source_ip_hash)
        .await;

    let event_type = "session.register";
    match registered {
        Ok(session) => {
            state
                .audit
                .emit(audit_event(
                    event_type,
                    AuditSeverity::Info,
                    Some(session.session_id.clone()),
                    None,
                    None,
                    Some(&source_ip_hash),
                    "registered",
                    req.friendly_name.as_deref(),
                    req.host_tool.as_deref(),
                ))
                .await;
            Ok(Json(Envelope::ok(RegisterResponse {
                session_id: session.session_id,
                session_token: session.session_token,
                profile_id: session.profile_id,
                expires_at: session.expires_at,
            })))
        }
        Err(e) => {
            state
                .audit
                .emit(audit_event(
                    event_type,
                    AuditSeverity::Warning,
                    None,
                    None,
                    None,
                    Some(&source_ip_hash),
                    "rejected",
                    req.friendly_name.as_deref(),
                    req.host_tool.as_deref(),
                ))
                .await;
            Err(e.into())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn audit_event(
    event_type: &str,
    severity: AuditSeverity,
    session_id: Option<String>,
    client_id: Option<String>,
    user_id: Option<String>,
    source_ip_hash: Option<&str>,
    action: &str,
    friendly_name: Option<&str>,
    host_tool: Option<&str>,
) -> AuditEvent {
    let mut metadata = std::collections::HashMap::new();
    if let Some(name) = friendly_name {
        metadata.insert("friendly_name".to_string(), Value::String(name.to_string()));
    }
    if let Some(tool) = host_tool {
        metadata.insert("host_tool".to_string(), Value::String(tool.to_string()));
    }

    AuditEvent {
        event_id: crate::model::new_session_id(),
        timestamp: now_iso8601(),
        event_type: event_type.to_string(),
        severity,
        session_id,
        client_id,
        user_id,
        source_ip_hash: source_ip_hash.map(|s| s.to_string()),
        tool_name: None,
        downstream_mcp: None,
        action: action.to_string(),
        request_summary: None,
        response_summary: None,
        authz_decision: None,
        authz_policy: None,
        metadata,
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

#[derive(Serialize)]
pub struct ToolsResponse {
    pub tools: Vec<String>,
}

pub async fn list_tools(
    State(state): State<ApiState>,
    auth: SessionAuth,
) -> ApiResult<Json<Envelope<ToolsResponse>>> {
    let tools = state.router.list_tools(&auth.client).await?;
    Ok(Json(Envelope::ok(ToolsResponse { tools })))
}

#[derive(Deserialize)]
pub struct InvokeRequest {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

pub async fn invoke_tool(
    State(state): State<ApiState>,
    auth: SessionAuth,
    SourceIp(ip): SourceIp,
    Json(req): Json<InvokeRequest>,
) -> ApiResult<Json<Envelope<Value>>> {
    let ctx = InvokeContext {
        session_id: &auth.session.session_id,
        client: &auth.client,
        source_ip_hash: Some(state.ip_salt.hash(ip)),
    };
    let result = state
        .router
        .invoke(&ctx, &req.tool_name, req.arguments)
        .await?;
    Ok(Json(Envelope::ok(result)))
}

#[derive(Serialize)]
pub struct McpHealthEntry {
    pub mcp_id: String,
    #[serde(flatten)]
    pub detail: crate::backend::HealthDetail,
}

pub async fn health_mcps(
    State(state): State<ApiState>,
    _admin: AdminAuth,
) -> Json<Envelope<Vec<McpHealthEntry>>> {
    let snapshot = state.shared.health_snapshot().await;
    let entries = snapshot
        .into_iter()
        .map(|(mcp_id, detail)| McpHealthEntry { mcp_id, detail })
        .collect();
    Json(Envelope::ok(entries))
}

#[derive(Serialize)]
pub struct RestartResponse {
    pub mcp_id: String,
    pub healthy: bool,
}

pub async fn restart_mcp(
    State(state): State<ApiState>,
    _admin: AdminAuth,
    Path(mcp_id): Path<String>,
) -> ApiResult<Json<Envelope<RestartResponse>>> {
    let entry = state
        .catalog
        .get(&mcp_id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("backend '{mcp_id}'")))?;

    let transport = state.shared.restart(&entry).await?;
    let detail = transport.health_check().await;
    Ok(Json(Envelope::ok(RestartResponse {
        mcp_id,
        healthy: detail.healthy,
    })))
}

#[derive(Deserialize)]
pub struct AuditEventsParams {
    /// Full ISO-8601 timestamps (§4.8 Query), e.g. `2026-02-16T10:00:00.000Z`.
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<AuditSeverity>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

const DEFAULT_AUDIT_PAGE: usize = 100;

pub async fn audit_events(
    State(state): State<ApiState>,
    _admin: AdminAuth,
    Query(params): Query<AuditEventsParams>,
) -> ApiResult<Json<Envelope<Vec<AuditEvent>>>> {
    let page_size = params.limit.unwrap_or(DEFAULT_AUDIT_PAGE).max(1);
    let offset = params
        .cursor
        .as_deref()
        .and_then(decode_cursor)
        .unwrap_or(0);

    let query = AuditQuery {
        start_time: params.start_time,
        end_time: params.end_time,
        client_id: params.client_id,
        user_id: params.user_id,
        event_type: params.event_type,
        severity: params.severity,
        // Fetch one past the requested window so `has_more` doesn't need a
        // second query; `query()` has no native offset so this crate walks
        // it in memory instead.
        limit: Some(offset + page_size + 1),
    };

    let mut events = state.audit.query(query).await.map_err(ApiError::Internal)?;
    if offset > 0 {
        if offset >= events.len() {
            events.clear();
        } else {
            events.drain(0..offset);
        }
    }

    let has_more = events.len() > page_size;
    events.truncate(page_size);
    let next_cursor = has_more.then(|| encode_cursor(offset + page_size));

    Ok(Json(Envelope {
        ok: true,
        data: events,
        pagination: Some(Pagination {
            next_cursor,
            has_more,
        }),
    }))
}

fn encode_cursor(offset: usize) -> String {
    STANDARD_NO_PAD.encode(offset.to_string())
}

fn decode_cursor(cursor: &str) -> Option<usize> {
    let bytes = STANDARD_NO_PAD.decode(cursor).ok()?;
    String::from_utf8(bytes).ok()?.parse().ok()
}

#[derive(Deserialize)]
pub struct ReloadParams {
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum ReloadResponse {
    Preview(CatalogDiff),
    Applied(crate::catalog::ApplyResult),
}

pub async fn reload_catalog(
    State(state): State<ApiState>,
    _admin: AdminAuth,
    Query(params): Query<ReloadParams>,
    Json(entries): Json<Vec<crate::model::BackendCatalogEntry>>,
) -> ApiResult<Json<Envelope<ReloadResponse>>> {
    if params.dry_run {
        let diff = state
            .reloader
            .preview(&entries)
            .await
            .map_err(ApiError::Internal)?;
        return Ok(Json(Envelope::ok(ReloadResponse::Preview(diff))));
    }

    let result = state.reloader.apply(entries).await?;
    Ok(Json(Envelope::ok(ReloadResponse::Applied(result))))
}
