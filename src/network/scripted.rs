//! In-memory binding whose connections are driven by the test.

use super::{Connection, ConnectionUpdate, NetworkBinding, SessionHandle, SessionOperation};
use crate::credentials::CredentialState;
use crate::errors::NetworkError;
use crate::ids::TenantId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A connection the test can push updates into.
pub struct ScriptedConnection {
    pub tenant: TenantId,
    pub credentials: Option<CredentialState>,
    pub dir: PathBuf,
    pub updates: mpsc::Sender<ConnectionUpdate>,
    pub handle: Arc<ScriptedHandle>,
}

impl ScriptedConnection {
    pub async fn send(&self, update: ConnectionUpdate) {
        self.updates.send(update).await.unwrap();
    }
}

pub struct ScriptedBinding {
    connections: mpsc::UnboundedSender<ScriptedConnection>,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
}

impl ScriptedBinding {
    pub fn new() -> (Arc<Self>, ScriptedConnections) {
        let (tx, rx) = mpsc::unbounded_channel();
        let binding = Arc::new(Self {
            connections: tx,
            failing_connects: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        });
        (binding, ScriptedConnections { rx })
    }

    /// Makes the next `count` connects fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkBinding for ScriptedBinding {
    async fn connect(
        &self,
        tenant: &TenantId,
        credentials: Option<CredentialState>,
        dir: &Path,
    ) -> Result<Connection, NetworkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(NetworkError::Connect {
                message: "scripted failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(16);
        let handle = Arc::new(ScriptedHandle::new());
        let _ = self.connections.send(ScriptedConnection {
            tenant: tenant.clone(),
            credentials,
            dir: dir.to_path_buf(),
            updates: tx,
            handle: handle.clone(),
        });
        Ok(Connection {
            handle,
            updates: rx,
        })
    }
}

/// Receiving end for connections opened through a [`ScriptedBinding`].
pub struct ScriptedConnections {
    rx: mpsc::UnboundedReceiver<ScriptedConnection>,
}

impl ScriptedConnections {
    /// Waits for the next connect, failing the test after a few seconds.
    pub async fn next(&mut self) -> ScriptedConnection {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("no connection attempt within 5s")
            .expect("binding dropped")
    }

    /// Returns a pending connect without waiting.
    pub fn try_next(&mut self) -> Option<ScriptedConnection> {
        self.rx.try_recv().ok()
    }
}

pub struct ScriptedHandle {
    id: Uuid,
    closed: AtomicBool,
    code_requests: AtomicUsize,
    executed: Mutex<Vec<SessionOperation>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            closed: AtomicBool::new(false),
            code_requests: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn code_requests(&self) -> usize {
        self.code_requests.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<SessionOperation> {
        self.executed.lock().unwrap().clone()
    }

    /// Highest number of operations ever observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionHandle for ScriptedHandle {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn is_transport_open(&self) -> bool {
        !self.is_closed()
    }

    async fn request_pairing_code(&self) -> Result<String, NetworkError> {
        self.code_requests.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(NetworkError::TransportClosed);
        }
        Ok("ABCD1234".to_string())
    }

    async fn execute(&self, operation: SessionOperation) -> Result<serde_json::Value, NetworkError> {
        if !self.is_transport_open() {
            return Err(NetworkError::TransportClosed);
        }
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.executed.lock().unwrap().push(operation.clone());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "op": operation.op }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
