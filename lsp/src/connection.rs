//! Server connection: JSON-RPC plumbing over one transport.
//!
//! Owns the writer and reader tasks, the pending-request table and the
//! spawned child (if any). Notifications are handed to the
//! [`NotificationRouter`]; subscribers must be attached before
//! [`ServerConnection::initialize`] so no setup progress is missed.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameError, FrameReader, FrameWriter};
use crate::error::TransportError;
use crate::protocol::{self, Notification, Request, UNDECODABLE_FRAME_METHOD};
use crate::router::NotificationRouter;
use crate::transport::ServerIo;
use crate::types::TraceLevel;

const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Server requests answered with a `null` result instead of method-not-found.
const ACKNOWLEDGED_SERVER_REQUESTS: &[&str] = &[
    "window/workDoneProgress/create",
    "client/registerCapability",
    "client/unregisterCapability",
];

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: serde_json::Value,
    },
}

fn report_undecodable(router: &NotificationRouter, reason: &str) {
    router.dispatch(
        UNDECODABLE_FRAME_METHOD,
        &serde_json::json!({ "reason": reason }),
    );
}

fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame
                .get("params")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        }),
        _ => None,
    }
}

/// Why the reader task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Server closed its output stream.
    Exited,
    Failed(String),
}

impl CloseReason {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Exited => "server closed the connection".to_string(),
            Self::Failed(reason) => reason.clone(),
        }
    }
}

pub(crate) struct ServerConnection {
    child: Option<Child>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: u64,
    pending: PendingMap,
    closed: Option<oneshot::Receiver<CloseReason>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl ServerConnection {
    /// Start the reader and writer tasks over `io`.
    pub fn spawn(io: ServerIo, router: NotificationRouter) -> Self {
        let ServerIo {
            reader,
            writer,
            child,
        } = io;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("Analysis server write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = writer.close().await;
                        break;
                    }
                }
            }
        });

        let (closed_tx, closed_rx) = oneshot::channel();
        let reader_pending = Arc::clone(&pending);
        let reader_writer_tx = writer_tx.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            let reason = loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_frame(&frame, &reader_pending, &router, &reader_writer_tx)
                            .await;
                    }
                    Ok(None) => {
                        tracing::info!("Analysis server closed its output");
                        break CloseReason::Exited;
                    }
                    // The body was consumed in full, so the stream is still
                    // framed correctly.
                    Err(FrameError::Json(e)) => {
                        tracing::warn!("Skipping undecodable frame from analysis server: {e}");
                        report_undecodable(&router, &e.to_string());
                    }
                    Err(e) => {
                        tracing::warn!("Analysis server read error: {e}");
                        break CloseReason::Failed(e.to_string());
                    }
                }
            };
            // Wake requests still waiting on a response.
            reader_pending.lock().await.clear();
            let _ = closed_tx.send(reason);
        });

        Self {
            child,
            writer_tx,
            next_id: 1,
            pending,
            closed: Some(closed_rx),
            reader_handle,
            writer_handle,
        }
    }

    async fn dispatch_frame(
        frame: &serde_json::Value,
        pending: &Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
        router: &NotificationRouter,
        writer_tx: &mpsc::Sender<WriterCommand>,
    ) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::debug!("Skipping frame that is not a JSON-RPC message");
            report_undecodable(router, "not a JSON-RPC message");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let sender = pending.lock().await.remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(body);
                }
            }
            IncomingFrame::ServerRequest { id, method } => {
                let reply = if ACKNOWLEDGED_SERVER_REQUESTS.contains(&method.as_str()) {
                    tracing::debug!("Server request {method}: acknowledged");
                    protocol::response(&id, serde_json::Value::Null)
                } else {
                    tracing::debug!("Server request {method}: replying method not found");
                    protocol::error_response(
                        &id,
                        protocol::METHOD_NOT_FOUND,
                        &format!("Method not found: {method}"),
                    )
                };
                let _ = writer_tx.send(WriterCommand::Send(reply)).await;
            }
            IncomingFrame::Notification { method, params } => {
                if !router.dispatch(&method, &params) {
                    tracing::trace!("Ignoring notification: {method}");
                }
            }
        }
    }

    /// Take the one-shot close signal. Resolves when the reader task ends.
    pub fn take_closed(&mut self) -> Option<oneshot::Receiver<CloseReason>> {
        self.closed.take()
    }

    /// `initialize` + `initialized`, then `$/setTrace` when tracing is on.
    pub async fn initialize(
        &mut self,
        project_root: Option<&Path>,
        initialization_options: &serde_json::Value,
        trace: TraceLevel,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let root_uri = match project_root {
            Some(root) => Some(
                protocol::path_to_file_uri(root)
                    .map_err(|e| TransportError::Handshake(e.to_string()))?,
            ),
            None => None,
        };

        let params =
            protocol::initialize_params(root_uri.as_ref().map(url::Url::as_str), initialization_options);
        let response = self
            .send_request("initialize", Some(params), timeout)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        if let Some(error) = response.get("error") {
            return Err(TransportError::Handshake(
                error["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string(),
            ));
        }

        self.notify("initialized", Some(serde_json::json!({})))
            .await?;
        if trace != TraceLevel::Off {
            self.notify(protocol::SET_TRACE_METHOD, Some(protocol::set_trace_params(trace)))
                .await?;
        }
        Ok(())
    }

    async fn send_request(
        &mut self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError> {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = Request::new(id, method, params);
        let frame = serde_json::to_value(&request).map_err(|e| TransportError::Send(e.to_string()))?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(TransportError::Send("writer channel closed".to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Closed(format!(
                    "no response to {method}"
                )))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Send(format!(
                    "{method} timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Queue a notification. The returned future doesn't borrow `self`.
    pub fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + 'static {
        let writer_tx = self.writer_tx.clone();
        async move {
            let notification = Notification::new(method, params);
            let frame = serde_json::to_value(&notification)
                .map_err(|e| TransportError::Send(e.to_string()))?;
            writer_tx
                .send(WriterCommand::Send(frame))
                .await
                .map_err(|_| TransportError::Send("writer channel closed".to_string()))
        }
    }

    /// Graceful shutdown request, then forced release. Consumes self.
    pub async fn shutdown(mut self) {
        let timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        if let Ok(response) = self.send_request("shutdown", None, timeout).await
            && response.get("error").is_none()
        {
            let _ = self.notify("exit", None).await;
        }

        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        let _ = tokio::time::timeout(timeout, &mut self.writer_handle).await;

        if let Some(mut child) = self.child.take() {
            if tokio::time::timeout(timeout, child.wait()).await.is_err() {
                tracing::debug!("Analysis server didn't exit in time, killing");
                let _ = child.kill().await;
            }
        }
        self.reader_handle.abort();
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        // Dropping the child (kill_on_drop) ends the process; the tasks
        // would otherwise linger on a half-open socket.
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}
