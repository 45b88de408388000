//! Network binding that talks to a messaging gateway over TCP.
//!
//! One TCP connection per tenant, newline-delimited JSON frames both ways:
//! - We send `hello` with the tenant and any stored credentials
//! - The gateway streams `connecting`, `open`, `credentials` and `closed`
//! - Pairing codes and operations are request/response pairs
//!
//! A dropped socket is reported as `closed` with status 0 so the lifecycle
//! manager treats it as transient.

use super::{
    Connection, ConnectionUpdate, NetworkBinding, SessionHandle, SessionOperation,
    STATUS_TRANSPORT_LOST,
};
use crate::credentials::CredentialState;
use crate::errors::NetworkError;
use crate::ids::TenantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Current gateway protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// How long a pairing-code or operation request may wait for its answer.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const UPDATE_BUFFER: usize = 64;

/// Frames we send to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello {
        tenant: TenantId,
        credentials: Option<CredentialState>,
        protocol_version: u32,
    },
    RequestPairingCode,
    Operation {
        id: u64,
        op: String,
        args: serde_json::Value,
    },
    Close,
}

/// Frames the gateway sends us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    Connecting,
    Open,
    Closed {
        status: u16,
    },
    Credentials {
        state: CredentialState,
    },
    PairingCode {
        code: String,
    },
    PairingCodeError {
        message: String,
    },
    OperationResult {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Connects tenants through a gateway at `addr`.
pub struct GatewayBinding {
    addr: String,
    request_timeout: Duration,
}

impl GatewayBinding {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl NetworkBinding for GatewayBinding {
    async fn connect(
        &self,
        tenant: &TenantId,
        credentials: Option<CredentialState>,
        _dir: &Path,
    ) -> Result<Connection, NetworkError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| NetworkError::Connect {
                message: format!("{}: {}", self.addr, e),
            })?;
        let (reader, mut writer) = stream.into_split();

        let hello = ClientFrame::Hello {
            tenant: tenant.clone(),
            credentials,
            protocol_version: PROTOCOL_VERSION,
        };
        write_frame(&mut writer, &hello).await?;

        let shared = Arc::new(Shared::default());
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let reader_task = tokio::spawn(read_frames(
            tenant.clone(),
            BufReader::new(reader),
            shared.clone(),
            updates_tx,
        ));

        let handle = GatewayHandle {
            id: Uuid::new_v4(),
            tenant: tenant.clone(),
            writer: tokio::sync::Mutex::new(writer),
            op_lock: tokio::sync::Mutex::new(()),
            shared,
            next_request: AtomicU64::new(1),
            request_timeout: self.request_timeout,
            reader_task: Mutex::new(Some(reader_task)),
        };

        Ok(Connection {
            handle: Arc::new(handle),
            updates: updates_rx,
        })
    }
}

type PendingOperation = oneshot::Sender<Result<serde_json::Value, NetworkError>>;
type PendingCode = oneshot::Sender<Result<String, NetworkError>>;

/// State shared between a handle and its reader task.
struct Shared {
    open: AtomicBool,
    operations: Mutex<HashMap<u64, PendingOperation>>,
    pairing_code: Mutex<Option<PendingCode>>,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(true),
            operations: Mutex::new(HashMap::new()),
            pairing_code: Mutex::new(None),
        }
    }
}

impl Shared {
    fn operations(&self) -> MutexGuard<'_, HashMap<u64, PendingOperation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pairing_code(&self) -> MutexGuard<'_, Option<PendingCode>> {
        self.pairing_code.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the transport closed and fails every outstanding request.
    fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
        for (_, pending) in self.operations().drain() {
            let _ = pending.send(Err(NetworkError::TransportClosed));
        }
        if let Some(pending) = self.pairing_code().take() {
            let _ = pending.send(Err(NetworkError::TransportClosed));
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &ClientFrame) -> Result<(), NetworkError> {
    let json = serde_json::to_string(frame).map_err(|e| NetworkError::Protocol {
        message: e.to_string(),
    })?;
    writer
        .write_all(format!("{}\n", json).as_bytes())
        .await
        .map_err(|_| NetworkError::TransportClosed)
}

async fn read_frames(
    tenant: TenantId,
    mut reader: BufReader<OwnedReadHalf>,
    shared: Arc<Shared>,
    updates: mpsc::Sender<ConnectionUpdate>,
) {
    let mut line = String::new();
    let mut reported_close = false;

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(tenant = %tenant, error = %e, "gateway read failed");
                break;
            }
        }

        let frame: GatewayFrame = match serde_json::from_str(line.trim()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "ignoring malformed gateway frame");
                continue;
            }
        };

        let update = match frame {
            GatewayFrame::Connecting => Some(ConnectionUpdate::Connecting),
            GatewayFrame::Open => Some(ConnectionUpdate::Open {
                transport_open: shared.open.load(Ordering::SeqCst),
            }),
            GatewayFrame::Credentials { state } => Some(ConnectionUpdate::CredentialsUpdated(state)),
            GatewayFrame::Closed { status } => {
                shared.shut();
                reported_close = true;
                Some(ConnectionUpdate::Closed { status })
            }
            GatewayFrame::PairingCode { code } => {
                if let Some(pending) = shared.pairing_code().take() {
                    let _ = pending.send(Ok(code));
                }
                None
            }
            GatewayFrame::PairingCodeError { message } => {
                if let Some(pending) = shared.pairing_code().take() {
                    let _ = pending.send(Err(NetworkError::Rejected { message }));
                }
                None
            }
            GatewayFrame::OperationResult {
                id,
                ok,
                result,
                error,
            } => {
                if let Some(pending) = shared.operations().remove(&id) {
                    let outcome = if ok {
                        Ok(result)
                    } else {
                        Err(NetworkError::Rejected {
                            message: error.unwrap_or_else(|| "operation failed".to_string()),
                        })
                    };
                    let _ = pending.send(outcome);
                }
                None
            }
        };

        if let Some(update) = update {
            if updates.send(update).await.is_err() || reported_close {
                break;
            }
        }
    }

    shared.shut();
    if !reported_close {
        let _ = updates
            .send(ConnectionUpdate::Closed {
                status: STATUS_TRANSPORT_LOST,
            })
            .await;
    }
}

/// Client side of one gateway connection.
pub struct GatewayHandle {
    id: Uuid,
    tenant: TenantId,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    op_lock: tokio::sync::Mutex<()>,
    shared: Arc<Shared>,
    next_request: AtomicU64,
    request_timeout: Duration,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayHandle {
    async fn send(&self, frame: &ClientFrame) -> Result<(), NetworkError> {
        if !self.is_transport_open() {
            return Err(NetworkError::TransportClosed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut writer, frame).await
    }

    async fn await_reply<T>(
        &self,
        rx: oneshot::Receiver<Result<T, NetworkError>>,
        operation: &'static str,
    ) -> Result<T, NetworkError> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::TransportClosed),
            Err(_) => Err(NetworkError::Timeout { operation }),
        }
    }
}

#[async_trait]
impl SessionHandle for GatewayHandle {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn is_transport_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn request_pairing_code(&self) -> Result<String, NetworkError> {
        let (tx, rx) = oneshot::channel();
        *self.shared.pairing_code() = Some(tx);
        self.send(&ClientFrame::RequestPairingCode).await?;
        self.await_reply(rx, "pairing code request").await
    }

    async fn execute(&self, operation: SessionOperation) -> Result<serde_json::Value, NetworkError> {
        let _serial = self.op_lock.lock().await;

        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.operations().insert(id, tx);

        let frame = ClientFrame::Operation {
            id,
            op: operation.op,
            args: operation.args,
        };
        if let Err(e) = self.send(&frame).await {
            self.shared.operations().remove(&id);
            return Err(e);
        }

        let result = self.await_reply(rx, "operation").await;
        self.shared.operations().remove(&id);
        result
    }

    async fn close(&self) {
        if self.is_transport_open() {
            let _ = self.send(&ClientFrame::Close).await;
        }
        self.shared.shut();
        let _ = self.writer.lock().await.shutdown().await;

        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!(tenant = %self.tenant, "gateway connection closed");
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
