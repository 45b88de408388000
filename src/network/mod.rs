//! Seam between the session manager and the external messaging network.
//!
//! A [`NetworkBinding`] opens one connection per tenant and hands back a
//! [`SessionHandle`] plus a stream of [`ConnectionUpdate`]s. The lifecycle
//! manager consumes the stream one update at a time, so per-tenant ordering
//! comes from the channel, not from locks.

pub mod gateway;
#[cfg(test)]
pub(crate) mod scripted;

use crate::credentials::CredentialState;
use crate::errors::NetworkError;
use crate::ids::TenantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Close status reported when the socket dropped without a status.
pub const STATUS_TRANSPORT_LOST: u16 = 0;
/// The account was logged out remotely.
pub const STATUS_LOGGED_OUT: u16 = 401;
/// The network refused the account.
pub const STATUS_FORBIDDEN: u16 = 403;
/// The server closed the connection for good.
pub const STATUS_CONNECTION_CLOSED: u16 = 428;

/// Close statuses that end a tenant instead of reconnecting it.
pub const DEFAULT_FATAL_STATUSES: [u16; 3] =
    [STATUS_LOGGED_OUT, STATUS_FORBIDDEN, STATUS_CONNECTION_CLOSED];

/// Events a live connection reports, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionUpdate {
    /// The handshake started.
    Connecting,
    /// The handshake completed. `transport_open` is sampled by the binding
    /// when it saw the handshake finish, not when the update is consumed.
    Open { transport_open: bool },
    /// The connection ended with `status`.
    Closed { status: u16 },
    /// The network rotated the tenant's credentials.
    CredentialsUpdated(CredentialState),
}

/// An opaque request forwarded to a tenant's connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOperation {
    pub op: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// One live connection for one tenant.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Distinguishes this connection from earlier ones for the same tenant.
    fn connection_id(&self) -> Uuid;

    /// Whether the underlying socket is still usable.
    fn is_transport_open(&self) -> bool;

    async fn request_pairing_code(&self) -> Result<String, NetworkError>;

    /// Runs one operation. The control surface never overlaps calls for one tenant.
    async fn execute(&self, operation: SessionOperation) -> Result<serde_json::Value, NetworkError>;

    /// Tears down the connection. Safe to call more than once.
    async fn close(&self);
}

/// A freshly opened connection.
pub struct Connection {
    pub handle: Arc<dyn SessionHandle>,
    pub updates: mpsc::Receiver<ConnectionUpdate>,
}

/// Opens connections to the messaging network.
#[async_trait]
pub trait NetworkBinding: Send + Sync {
    /// Connects `tenant`, resuming from `credentials` when present.
    ///
    /// `dir` is the tenant's credential directory; the binding may keep its
    /// own files there.
    async fn connect(
        &self,
        tenant: &TenantId,
        credentials: Option<CredentialState>,
        dir: &Path,
    ) -> Result<Connection, NetworkError>;
}
