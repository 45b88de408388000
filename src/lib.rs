//! Multi-tenant session manager for long-lived network identities.
//!
//! Keeps one connection per tenant alive on behalf of the controllers that
//! paired it, persists the credential material each tenant needs to come back
//! after a restart, and evicts tenants whose network identity is gone for good.
//!
//! ## Architecture
//!
//! - **Registries** (`credentials`, `pairing`, `entitlement`, `active`,
//!   `sessions`): durable and in-memory tables, bundled into one injected
//!   [`registry::Registry`] context.
//! - **Lifecycle** (`lifecycle`): the per-tenant state machine and the tasks
//!   that drive it, including reconnection and ghost-session reconciliation.
//! - **Network** (`network`): the binding seam to the external messaging
//!   network plus a newline-delimited JSON gateway implementation.
//! - **Control** (`control`, `protocol`): the command surface controllers talk
//!   to, and its stdin/stdout wire adapter.

pub mod active;
pub mod clock;
pub mod config;
pub mod control;
pub mod credentials;
pub mod entitlement;
pub mod errors;
pub mod ids;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod pairing;
pub mod paths;
pub mod persist;
pub mod protocol;
pub mod registry;
pub mod sessions;
#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "../build/source_rules.rs"]
mod source_rules;

pub use errors::{ControlError, InputError, NetworkError};
pub use ids::{ControllerId, TenantId};

/// Git revision the binary was built from.
pub const BUILD_SHA: &str = env!("SESSIONPOOL_GIT_SHA");
