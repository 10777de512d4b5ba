//! Backend Connection (§4.1): the two transport variants and the shared
//! JSON-RPC plumbing they both sit on. The Shared Manager (`crate::shared`)
//! and Per-User Pool (`crate::pool`) own the lifecycle of these connections;
//! this module only knows how to talk to one backend process or endpoint.

pub mod error;
pub mod http;
pub mod stdio;
pub mod transport;

pub use error::{BackendError, CapacityScope};
pub use http::{HttpConfig, HttpTransport};
pub use stdio::{StdioConfig, StdioTransport};
pub use transport::{ConnectionState, HealthDetail, Transport};
