//! Transports: raw byte streams to the analysis server.
//!
//! A [`Connector`] turns a [`ConnectionSpec`] into a [`ServerIo`]. The
//! default connector spawns the server for local specs and runs the retry
//! driver for remote specs; tests substitute in-memory connectors.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use crate::error::{ProvisionError, SessionError, TransportError};
use crate::provision::{ConnectionSpec, LocalSpec, RemoteSpec};
use crate::retry::{self, AttemptGuard, Dialer, RetryOutcome, TcpDialer};

/// Byte streams to one server instance, plus the child process when we
/// spawned it. Dropping it kills the child.
pub struct ServerIo {
    pub(crate) reader: Box<dyn AsyncRead + Send + Unpin>,
    pub(crate) writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub(crate) child: Option<Child>,
}

impl ServerIo {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }

    #[must_use]
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }
}

impl fmt::Debug for ServerIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIo")
            .field("child", &self.child.as_ref().and_then(Child::id))
            .finish_non_exhaustive()
    }
}

/// Connect future type alias.
pub type ConnectFut<'a> = Pin<Box<dyn Future<Output = Result<ServerIo, SessionError>> + Send + 'a>>;

/// Opens the transport for one start attempt.
///
/// Implementations must return `TransportError::Superseded` (or stop doing
/// work) once `guard` is no longer current.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, spec: &'a ConnectionSpec, guard: &'a AttemptGuard) -> ConnectFut<'a>;
}

/// Spawns local servers and dials remote ones with retry.
pub struct DefaultConnector {
    dialer: Arc<dyn Dialer>,
}

impl DefaultConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_dialer(Arc::new(TcpDialer))
    }

    #[must_use]
    pub fn with_dialer(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }

    async fn connect_remote(
        &self,
        remote: &RemoteSpec,
        guard: &AttemptGuard,
    ) -> Result<ServerIo, SessionError> {
        match retry::connect_with_retry(
            self.dialer.as_ref(),
            &remote.host,
            remote.port,
            &remote.retry,
            guard,
        )
        .await
        {
            RetryOutcome::Connected { io, .. } => Ok(io),
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => Err(TransportError::Exhausted {
                host: remote.host.clone(),
                port: remote.port,
                attempts,
                last_error,
            }
            .into()),
            RetryOutcome::Superseded => Err(TransportError::Superseded.into()),
        }
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for DefaultConnector {
    fn connect<'a>(&'a self, spec: &'a ConnectionSpec, guard: &'a AttemptGuard) -> ConnectFut<'a> {
        Box::pin(async move {
            match spec {
                ConnectionSpec::Local(local) => spawn_local(local).map_err(SessionError::from),
                ConnectionSpec::Remote(remote) => self.connect_remote(remote, guard).await,
            }
        })
    }
}

/// Spawn the server process with piped stdio.
///
/// stderr is forwarded line by line to the diagnostic trace.
pub fn spawn_local(spec: &LocalSpec) -> Result<ServerIo, ProvisionError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let command = spec.program.display().to_string();
    let spawn_error = |reason: &str| ProvisionError::Spawn {
        command: command.clone(),
        reason: reason.to_string(),
    };

    let mut child = cmd.spawn().map_err(|e| spawn_error(&e.to_string()))?;
    let stdout = child.stdout.take().ok_or_else(|| spawn_error("no stdout"))?;
    let stdin = child.stdin.take().ok_or_else(|| spawn_error("no stdin"))?;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(stderr));
    }

    tracing::info!(pid = child.id(), command = %command, "Spawned analysis server");
    Ok(ServerIo::new(stdout, stdin).with_child(child))
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "grails_lsp::server_stderr", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading server stderr: {e}");
                break;
            }
        }
    }
}
