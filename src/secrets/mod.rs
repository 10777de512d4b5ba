//! `secretref:<provider>:<reference>` resolution for config-embedded
//! secrets (§6, §9). The Bitwarden-specific provider from the teacher
//! (`bws.rs`) has no counterpart here and was dropped; `resolver.rs`'s
//! generic `SecretProvider` trait and its env-fallback provider remain the
//! whole of this module.

pub mod resolver;

pub use resolver::{EnvFallbackProvider, SecretProvider, SecretResolver};
