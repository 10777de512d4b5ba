//! Authorization Engine (§4.6). Deny-wins glob policy evaluated over a
//! flattened profile-inheritance chain. The `Authorizer` capability-set
//! trait (§9) is the construction-time seam the Tool Router and the HTTP
//! layer depend on instead of matching on a concrete type.

use crate::model::{ClientStatus, Profile, ProfileId};
use crate::store::ProfileStore;
use anyhow::{Result, bail};
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;

/// Maximum inheritance depth walked before a chain is considered
/// pathological. Cycles are rejected at profile-write time (§9); this bound
/// only guards against a write-time check being bypassed by direct store
/// manipulation.
const MAX_PROFILE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Permit,
    Deny,
}

#[derive(Debug, Clone)]
pub struct AuthzResult {
    pub decision: Decision,
    pub reason: String,
    pub policy_id: String,
}

/// Minimal view of a session/client needed to authorize a single tool call.
/// Deliberately narrower than `model::Session` so the engine doesn't need a
/// full session lookup to be exercised in tests.
pub struct AuthzContext {
    pub client_status: ClientStatus,
    pub profile_id: ProfileId,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, ctx: &AuthzContext, tool: &str) -> Result<AuthzResult>;
    async fn list_authorized(&self, ctx: &AuthzContext, tools: &[String]) -> Result<Vec<String>>;
}

/// Flattened view of a profile chain: child `allowed_tools` override parent
/// (last write wins, so we just keep the nearest-ancestor set found first),
/// `denied_tools` union across the whole chain.
struct FlattenedProfile {
    allowed: Vec<String>,
    denied: Vec<String>,
}

pub struct AuthorizationEngine {
    profiles: Arc<dyn ProfileStore>,
}

impl AuthorizationEngine {
    pub fn new(profiles: Arc<dyn ProfileStore>) -> Self {
        Self { profiles }
    }

    async fn flatten(&self, profile_id: &str) -> Result<FlattenedProfile> {
        let mut allowed: Option<Vec<String>> = None;
        let mut denied: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut current = Some(profile_id.to_string());
        let mut depth = 0;

        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                bail!("cycle detected in profile inheritance chain at '{id}'");
            }
            depth += 1;
            if depth > MAX_PROFILE_DEPTH {
                bail!("profile inheritance chain exceeds depth bound of {MAX_PROFILE_DEPTH}");
            }

            let Some(profile) = self.profiles.get(&id).await? else {
                bail!("profile '{id}' not found while resolving inheritance chain");
            };

            // Nearest-ancestor (closest to the child) `allowed_tools` wins;
            // since we walk child -> parent, the first one we see is final.
            if allowed.is_none() && !profile.allowed_tools.is_empty() {
                allowed = Some(profile.allowed_tools.clone());
            }
            denied.extend(profile.denied_tools.clone());

            current = profile.inherited_from;
        }

        Ok(FlattenedProfile {
            allowed: allowed.unwrap_or_default(),
            denied,
        })
    }

    /// The flattened `allowed_tools` globs for a profile chain, with no
    /// deny-list filtering applied. Used by the Catalog Resolver (§4.5 step
    /// 4) to narrow the discoverable tool set; denial itself still only
    /// happens in `authorize` so a denied-but-listed tool can report a
    /// reason instead of silently vanishing.
    pub async fn allowed_globs(&self, profile_id: &str) -> Result<Vec<String>> {
        Ok(self.flatten(profile_id).await?.allowed)
    }
}

#[async_trait]
impl Authorizer for AuthorizationEngine {
    async fn authorize(&self, ctx: &AuthzContext, tool: &str) -> Result<AuthzResult> {
        if matches!(
            ctx.client_status,
            ClientStatus::Suspended | ClientStatus::Revoked
        ) {
            let status = match ctx.client_status {
                ClientStatus::Suspended => "suspended",
                ClientStatus::Revoked => "revoked",
                ClientStatus::Active => unreachable!(),
            };
            return Ok(AuthzResult {
                decision: Decision::Deny,
                reason: format!("client {status}"),
                policy_id: "system_lifecycle".to_string(),
            });
        }

        let flattened = self.flatten(&ctx.profile_id).await?;

        if let Some(pattern) = flattened.denied.iter().find(|p| glob_match(p, tool)) {
            return Ok(AuthzResult {
                decision: Decision::Deny,
                reason: format!("matched denied pattern '{pattern}'"),
                policy_id: ctx.profile_id.clone(),
            });
        }

        if let Some(pattern) = flattened.allowed.iter().find(|p| glob_match(p, tool)) {
            return Ok(AuthzResult {
                decision: Decision::Permit,
                reason: format!("matched allowed pattern '{pattern}'"),
                policy_id: ctx.profile_id.clone(),
            });
        }

        Ok(AuthzResult {
            decision: Decision::Deny,
            reason: "default deny".to_string(),
            policy_id: ctx.profile_id.clone(),
        })
    }

    async fn list_authorized(&self, ctx: &AuthzContext, tools: &[String]) -> Result<Vec<String>> {
        if matches!(
            ctx.client_status,
            ClientStatus::Suspended | ClientStatus::Revoked
        ) {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for tool in tools {
            if self.authorize(ctx, tool).await?.decision == Decision::Permit {
                out.push(tool.clone());
            }
        }
        Ok(out)
    }
}

/// Glob semantics (§4.6/P7): `*` matches any run of characters including
/// dots; every other regex metacharacter is escaped literally. An empty
/// pattern matches nothing; `*` alone matches everything.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    compile_glob(pattern).is_match(value)
}

fn compile_glob(pattern: &str) -> Regex {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    for part in pattern.split('*') {
        out.push_str(&regex::escape(part));
        out.push_str(".*");
    }
    // split('*') leaves one trailing ".*" too many; trim it back off.
    out.truncate(out.len() - 2);
    out.push('$');
    // A pattern this engine builds is always valid; `Profile` writes that
    // contain un-compilable globs are rejected by the store layer.
    Regex::new(&out).expect("compiled glob pattern must be valid regex")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything_including_dots() {
        assert!(glob_match("*", "github.delete_repository"));
        assert!(glob_match("*", ""));
    }

    #[test]
    fn empty_pattern_matches_nothing() {
        assert!(!glob_match("", "anything"));
    }

    #[test]
    fn other_metachars_are_literal() {
        assert!(glob_match("github.delete_*", "github.delete_repository"));
        assert!(!glob_match("github.delete_*", "githubXdelete_repository"));
        assert!(glob_match("a+b", "a+b"));
        assert!(!glob_match("a+b", "aab"));
    }

    #[test]
    fn deny_wins_scenario() {
        let denied = vec!["github.delete_*".to_string()];
        let allowed = vec!["*".to_string()];
        assert!(!denied.iter().any(|p| glob_match(p, "github.search_code")));
        assert!(allowed.iter().any(|p| glob_match(p, "github.search_code")));
        assert!(denied.iter().any(|p| glob_match(p, "github.delete_repository")));
    }
}
