//! Newline-delimited JSON adapter for the control surface.
//!
//! Each input line is one [`ControlRequest`]; each output line is one
//! [`Outbound`] message, either a reply to a request or an unsolicited notice.
//! Requests run concurrently, so replies may come back out of order; callers
//! correlate them with `request_id`.

use crate::control::{ControlCommand, ControlNotifier, ControlReply, ControlSurface, Notice};
use crate::ids::ControllerId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// One inbound line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub controller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub command: ControlCommand,
}

/// One outbound line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outbound {
    Reply {
        controller: ControllerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        reply: ControlReply,
    },
    Notice {
        controller: ControllerId,
        notice: Notice,
    },
    /// The line could not be understood at all.
    Error { message: String },
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The input closed.
    Eof,
    /// A reconciliation removed ghosts; the process should restart.
    Restart,
}

/// Serializes outbound messages onto one writer, one line each.
pub struct LineWriter<W> {
    inner: tokio::sync::Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(inner),
        }
    }

    pub async fn send(&self, message: &Outbound) -> Result<()> {
        let mut line = serde_json::to_vec(message).context("Failed to serialize outbound message")?;
        line.push(b'\n');

        let mut inner = self.inner.lock().await;
        inner
            .write_all(&line)
            .await
            .context("Failed to write outbound message")?;
        inner.flush().await.context("Failed to flush control channel")?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ControlNotifier for LineWriter<W> {
    async fn notify(&self, controller: &ControllerId, notice: Notice) {
        let message = Outbound::Notice {
            controller: controller.clone(),
            notice,
        };
        if let Err(e) = self.send(&message).await {
            tracing::warn!(controller = %controller, error = ?e, "failed to deliver notice");
        }
    }
}

/// Reads requests from `input` until it closes or a restart is needed.
///
/// Requests still running when the input closes are awaited before returning.
pub async fn serve<R, W>(
    input: R,
    surface: Arc<ControlSurface>,
    output: Arc<LineWriter<W>>,
) -> Result<ServeExit>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(input).lines();
    let (restart_tx, mut restart_rx) = mpsc::channel::<()>(1);
    let mut running = JoinSet::new();

    loop {
        let line = tokio::select! {
            _ = restart_rx.recv() => return Ok(ServeExit::Restart),
            line = lines.next_line() => line.context("Failed to read control channel")?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: ControlRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "malformed control request");
                output
                    .send(&Outbound::Error {
                        message: "malformed request".to_string(),
                    })
                    .await?;
                continue;
            }
        };

        let controller = match ControllerId::parse(&request.controller) {
            Ok(controller) => controller,
            Err(e) => {
                output
                    .send(&Outbound::Error {
                        message: e.to_string(),
                    })
                    .await?;
                continue;
            }
        };

        let surface = surface.clone();
        let output = output.clone();
        let restart_tx = restart_tx.clone();
        running.spawn(async move {
            let reply = surface.handle(&controller, request.command).await;
            let restart = matches!(&reply, ControlReply::Reconciled(report) if report.restart_required);

            let message = Outbound::Reply {
                controller,
                request_id: request.request_id,
                reply,
            };
            if let Err(e) = output.send(&message).await {
                tracing::warn!(error = ?e, "failed to deliver reply");
            }
            if restart {
                let _ = restart_tx.try_send(());
            }
        });

        // Reap finished requests so the set does not grow without bound.
        while running.try_join_next().is_some() {}
    }

    while running.join_next().await.is_some() {}
    if restart_rx.try_recv().is_ok() {
        return Ok(ServeExit::Restart);
    }
    Ok(ServeExit::Eof)
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
