//! HTTP surface (§6), generalized from the teacher's `admin.rs` — same
//! `Router::new().route(...).with_state(state)` plus graceful-shutdown
//! `axum::serve` idiom, expanded from three read-only status endpoints into
//! session registration, tool discovery/invocation, and the admin/audit
//! routes.

pub mod extract;
mod ip_salt;
mod routes;

pub use ip_salt::IpSalt;

use axum::Router;
use axum::routing::{get, post};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use crate::audit::AuditSink;
use crate::catalog::CatalogReloader;
use crate::router::ToolRouter;
use crate::session::SessionManager;
use crate::shared::SharedManager;
use crate::store::{CatalogStore, ClientStore};

#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionManager>,
    pub clients: Arc<dyn ClientStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub router: Arc<ToolRouter>,
    pub audit: Arc<dyn AuditSink>,
    pub reloader: Arc<CatalogReloader>,
    pub shared: Arc<SharedManager>,
    pub ip_salt: Arc<IpSalt>,
    /// `None` disables every `/v1/admin/*` and `/v1/audit/events` route
    /// (they 401 unconditionally) rather than accepting an empty token.
    pub admin_token: Option<Arc<str>>,
}

/// Success envelope (§6): `{ok:true, data, pagination?}`. `ApiError`'s
/// `IntoResponse` impl in `error.rs` builds the matching error shape.
#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    pub ok: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data,
            pagination: None,
        }
    }
}

#[derive(Serialize)]
pub struct Pagination {
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/sessions/register", post(routes::register_session))
        .route("/v1/tools", get(routes::list_tools))
        .route("/v1/tools/invoke", post(routes::invoke_tool))
        .route("/v1/admin/health/mcps", get(routes::health_mcps))
        .route(
            "/v1/admin/health/mcps/{mcp_id}/restart",
            post(routes::restart_mcp),
        )
        .route("/v1/audit/events", get(routes::audit_events))
        .route("/v1/admin/catalog/reload", post(routes::reload_catalog))
        .with_state(state)
}

/// Binds and serves the surface until `shutdown` fires, mirroring the
/// teacher's `admin::api::start`. `into_make_service_with_connect_info` is
/// what lets `extract::SourceIp` read the peer address for audit hashing.
pub async fn serve(state: ApiState, listen: &str, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(listen).await?;
    info!(listen = %listen, "http surface listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.notified().await })
    .await?;
    info!("http surface stopped");
    Ok(())
}
