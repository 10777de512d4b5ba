//! Request extractors for the two auth schemes the HTTP surface uses:
//! a session token for the client-facing routes, and a single configured
//! admin token for `/v1/admin/*` and `/v1/audit/events`. A real admin-key
//! store is out of scope (§1) — this is the minimal concrete mechanism
//! that still gates those routes instead of leaving them open.

use axum::extract::{ConnectInfo, FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::model::Client;
use crate::session::VerifiedSession;
use crate::store::ClientStore;

use super::ApiState;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers.get("x-session-token").and_then(|v| v.to_str().ok()) {
        return Some(v);
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub struct SessionAuth {
    pub session: VerifiedSession,
    pub client: Client,
}

impl<S> FromRequestParts<S> for SessionAuth
where
    ApiState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = ApiState::from_ref(state);
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        let session = state.sessions.verify(token).await?;
        let client = state
            .clients
            .get(&session.client_id)
            .await
            .map_err(ApiError::Internal)?
            .ok_or(ApiError::Unauthorized)?;
        Ok(SessionAuth { session, client })
    }
}

pub struct AdminAuth;

impl<S> FromRequestParts<S> for AdminAuth
where
    ApiState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = ApiState::from_ref(state);
        let configured = state.admin_token.as_deref().ok_or(ApiError::Unauthorized)?;
        let provided = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;

        // Length check short-circuits before `ct_eq`, which panics on a
        // length mismatch; the length of a bearer token isn't secret.
        let matches = configured.len() == provided.len()
            && configured
                .as_bytes()
                .ct_eq(provided.as_bytes())
                .unwrap_u8()
                == 1;
        if !matches {
            return Err(ApiError::Unauthorized);
        }
        Ok(AdminAuth)
    }
}

/// The caller's address for audit hashing, from the `TcpListener` connect
/// info axum attaches to every request (`serve` below wires this up via
/// `into_make_service_with_connect_info`).
pub struct SourceIp(pub std::net::IpAddr);

impl<S> FromRequestParts<S> for SourceIp
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let ConnectInfo(addr) = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::Internal(anyhow::anyhow!("missing connect info")))?;
        Ok(SourceIp(addr.ip()))
    }
}
