//! Session state machine.
//!
//! A [`Session`] is the owner handle for one actor task. Every operation is
//! a command on the actor's queue, so transitions and transport ownership
//! are serialized on a single logical thread. Work running outside the
//! actor (connecting, the handshake, translated notifications and the
//! connection's close) reports back tagged with its attempt number;
//! anything tagged with a superseded attempt is discarded.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::{CloseReason, ServerConnection};
use crate::error::{SessionError, TransportError};
use crate::protocol::{self, DID_CHANGE_CONFIGURATION_METHOD};
use crate::provision::{self, ConnectionSpec};
use crate::retry::{AttemptCounter, AttemptGuard};
use crate::router::NotificationRouter;
use crate::sink::{EventSink, EventSubscription};
use crate::translator::{self, Attachment, ProgressTranslator, Translated};
use crate::transport::Connector;
use crate::types::{
    MessageSeverity, ProgressEvent, ReadyPolicy, ServerMessage, SessionConfig, SessionState,
};

/// How a `start()` or `restart()` call resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The attempt reached `Running`.
    Running,
    /// The session was already running; nothing was started.
    AlreadyRunning,
    /// The attempt failed. The same error was reported as `StartFailed`.
    Failed(SessionError),
    /// A later stop or restart superseded the attempt.
    Superseded,
}

impl StartOutcome {
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::AlreadyRunning)
    }
}

/// What happened to a settings change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsDelivery {
    /// Sent to the running server.
    Sent,
    /// Stored; sent once a connection is up.
    Deferred,
    /// Stored; withheld until the build tooling becomes available.
    Withheld,
}

enum Command {
    Start(oneshot::Sender<StartOutcome>),
    Stop(oneshot::Sender<()>),
    Restart(oneshot::Sender<StartOutcome>),
    UpdateSettings(serde_json::Value, oneshot::Sender<SettingsDelivery>),
    SetToolingAvailable(bool, oneshot::Sender<SettingsDelivery>),
    Reconfigure(Box<SessionConfig>, oneshot::Sender<()>),
    Dispose(oneshot::Sender<()>),
}

enum Internal {
    Connected {
        attempt: u64,
        connection: ServerConnection,
        attachment: Attachment,
    },
    ConnectFailed {
        attempt: u64,
        error: SessionError,
    },
    Translated {
        attempt: u64,
        event: Translated,
    },
}

/// Owner handle for one session. Dropping it stops the server and ends the
/// actor; [`Session::dispose`] does the same and waits for it.
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    sink: EventSink,
    actor: JoinHandle<()>,
}

impl Session {
    /// Start the actor for a session in `Stopped`. Must be called within a
    /// tokio runtime.
    pub fn spawn(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let sink = EventSink::new();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            config,
            connector,
            sink: sink.clone(),
            counter: AttemptCounter::new(),
            internal_tx,
            state: SessionState::Stopped,
            active: None,
        };
        let actor = tokio::spawn(actor.run(commands_rx, internal_rx));

        Self {
            commands,
            sink,
            actor,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).ok()?;
        rx.await.ok()
    }

    /// Start the server. Resolves when this attempt reaches `Running`,
    /// fails or is superseded. A call while `Starting` joins the in-flight
    /// attempt instead of launching another.
    pub async fn start(&self) -> StartOutcome {
        self.request(Command::Start)
            .await
            .unwrap_or_else(disposed_outcome)
    }

    /// Stop the server. No-op when already stopped.
    pub async fn stop(&self) {
        let _ = self.request(Command::Stop).await;
    }

    /// Stop then start as one operation.
    pub async fn restart(&self) -> StartOutcome {
        self.request(Command::Restart)
            .await
            .unwrap_or_else(disposed_outcome)
    }

    /// Replace the settings forwarded to the server.
    pub async fn update_settings(&self, settings: serde_json::Value) -> Option<SettingsDelivery> {
        self.request(|tx| Command::UpdateSettings(settings, tx))
            .await
    }

    /// Record whether the build tooling prerequisite is available. Becoming
    /// available flushes any withheld settings.
    pub async fn set_tooling_available(&self, available: bool) -> Option<SettingsDelivery> {
        self.request(|tx| Command::SetToolingAvailable(available, tx))
            .await
    }

    /// Replace the configuration used by the next start.
    pub async fn reconfigure(&self, config: SessionConfig) {
        let _ = self
            .request(|tx| Command::Reconfigure(Box::new(config), tx))
            .await;
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.sink.state()
    }

    /// Wait until the current state equals `target`.
    ///
    /// States the session only passes through may be missed; use
    /// [`Session::subscribe`] to observe every transition.
    pub async fn wait_for_state(&self, target: SessionState) -> SessionState {
        let mut rx: watch::Receiver<SessionState> = self.sink.watch_state();
        match rx.wait_for(|state| *state == target).await {
            Ok(state) => *state,
            Err(_) => self.sink.state(),
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.sink.subscribe()
    }

    #[must_use]
    pub fn recent_messages(&self) -> Vec<ServerMessage> {
        self.sink.recent_messages()
    }

    #[must_use]
    pub fn latest_progress(&self, token: &str) -> Option<ProgressEvent> {
        self.sink.latest_progress(token)
    }

    /// Read-only view of the event sink, for collaborators.
    #[must_use]
    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Stop the server and end the actor.
    pub async fn dispose(self) {
        let _ = self.request(Command::Dispose).await;
        let _ = self.actor.await;
    }
}

fn disposed_outcome() -> StartOutcome {
    StartOutcome::Failed(SessionError::Lifecycle(
        "session actor is no longer running".to_string(),
    ))
}

/// Transport state of the current attempt.
struct Active {
    guard: AttemptGuard,
    connect_task: Option<JoinHandle<()>>,
    connection: Option<ServerConnection>,
    attachment: Option<Attachment>,
    /// Readiness arrived before the handshake result.
    ready_pending: bool,
    waiters: Vec<oneshot::Sender<StartOutcome>>,
}

impl Active {
    fn owns(&self, attempt: u64) -> bool {
        self.guard.attempt() == attempt && self.guard.is_current()
    }

    fn resolve(&mut self, outcome: &StartOutcome) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Release everything except the connection, which may need a graceful
    /// shutdown.
    fn release(&mut self) -> Option<ServerConnection> {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(attachment) = self.attachment.take() {
            attachment.detach();
        }
        self.connection.take()
    }
}

/// Inputs for one connection attempt, captured when it starts.
struct AttemptParams {
    spec: ConnectionSpec,
    translator: ProgressTranslator,
    config: SessionConfig,
}

struct Actor {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    sink: EventSink,
    counter: AttemptCounter,
    internal_tx: mpsc::UnboundedSender<Internal>,
    state: SessionState,
    active: Option<Active>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("Session handle dropped, shutting down");
                        self.stop().await;
                        break;
                    };
                    if let Command::Dispose(reply) = command {
                        self.stop().await;
                        let _ = reply.send(());
                        break;
                    }
                    self.handle_command(command).await;
                }
                Some(event) = internal.recv() => self.handle_internal(event).await,
            }
        }
        self.counter.invalidate();
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.sink.state_changed(state);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => self.start(reply),
            Command::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::Restart(reply) => {
                if self.state != SessionState::Stopped {
                    self.set_state(SessionState::Restarting);
                    self.stop().await;
                }
                self.start(reply);
            }
            Command::UpdateSettings(settings, reply) => {
                self.config.settings = Some(settings);
                let delivery = self.push_settings().await;
                let _ = reply.send(delivery);
            }
            Command::SetToolingAvailable(available, reply) => {
                self.config.tooling_available = available;
                tracing::info!(available, "Build tooling availability changed");
                let delivery = self.push_settings().await;
                let _ = reply.send(delivery);
            }
            Command::Reconfigure(config, reply) => {
                self.config = *config;
                tracing::info!("Session configuration replaced; applies to next start");
                let _ = reply.send(());
            }
            // Handled by the run loop.
            Command::Dispose(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn start(&mut self, reply: oneshot::Sender<StartOutcome>) {
        match self.state {
            SessionState::Running => {
                let _ = reply.send(StartOutcome::AlreadyRunning);
                return;
            }
            SessionState::Starting => {
                if let Some(active) = self.active.as_mut() {
                    tracing::debug!("Start requested while starting; joining in-flight attempt");
                    active.waiters.push(reply);
                    return;
                }
                self.report_lifecycle("starting without an in-flight attempt");
            }
            SessionState::Stopped | SessionState::Restarting | SessionState::Stopping => {}
        }

        let guard = self.counter.advance();
        self.sink.clear_progress();
        self.set_state(SessionState::Starting);

        let mut active = Active {
            guard: guard.clone(),
            connect_task: None,
            connection: None,
            attachment: None,
            ready_pending: false,
            waiters: vec![reply],
        };

        let spec = match provision::provision(
            &self.config.server,
            self.config.project_root.as_deref(),
        ) {
            Ok(spec) => spec,
            Err(e) => {
                self.active = Some(active);
                self.fail_start(e.into());
                return;
            }
        };
        tracing::info!(
            attempt = guard.attempt(),
            target = %spec.describe(),
            "Starting analysis server"
        );

        let params = AttemptParams {
            spec,
            translator: ProgressTranslator::new(self.config.progress.clone()),
            config: self.config.clone(),
        };
        active.connect_task = Some(tokio::spawn(run_attempt(
            Arc::clone(&self.connector),
            params,
            guard,
            self.internal_tx.clone(),
        )));
        self.active = Some(active);
    }

    async fn stop(&mut self) {
        if self.state == SessionState::Stopped && self.active.is_none() {
            return;
        }
        self.counter.invalidate();
        self.set_state(SessionState::Stopping);

        let mut released = self.active.take();
        if let Some(connection) = released.as_mut().and_then(Active::release) {
            connection.shutdown().await;
        }
        self.set_state(SessionState::Stopped);
        if let Some(mut active) = released {
            active.resolve(&StartOutcome::Superseded);
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        let attempt = match &event {
            Internal::Connected { attempt, .. }
            | Internal::ConnectFailed { attempt, .. }
            | Internal::Translated { attempt, .. } => *attempt,
        };
        if !self.active.as_ref().is_some_and(|a| a.owns(attempt)) {
            tracing::trace!(attempt, "Discarding event from superseded attempt");
            return;
        }

        match event {
            Internal::Connected {
                connection,
                attachment,
                ..
            } => self.on_connected(connection, attachment).await,
            Internal::ConnectFailed { error, .. } => {
                if self.state == SessionState::Starting {
                    self.fail_start(error);
                }
            }
            Internal::Translated { event, .. } => self.on_translated(event),
        }
    }

    async fn on_connected(&mut self, connection: ServerConnection, attachment: Attachment) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.connection.is_some() {
            drop(connection);
            self.report_lifecycle("second live connection for one attempt");
            return;
        }

        let attempt = active.guard.attempt();
        active.connection = Some(connection);
        active.attachment = Some(attachment);
        active.connect_task = None;
        let ready = active.ready_pending || self.config.ready_policy == ReadyPolicy::OnConnect;
        tracing::info!(attempt, "Analysis server connected");

        self.push_settings().await;
        if ready {
            self.become_running();
        }
    }

    fn on_translated(&mut self, event: Translated) {
        match event {
            Translated::Progress(update) => self.sink.progress(update),
            Translated::Ready(update) => {
                self.sink.progress(update);
                if self.state != SessionState::Starting
                    || self.config.ready_policy != ReadyPolicy::OnProgressEnd
                {
                    return;
                }
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if active.connection.is_some() {
                    self.become_running();
                } else {
                    active.ready_pending = true;
                }
            }
            Translated::Message(message) => self.sink.message(message),
            Translated::Log(text) => self.sink.trace(text),
            Translated::Protocol(error) => {
                tracing::debug!(error = %error, "Protocol error from analysis server");
                self.sink.trace(SessionError::from(error).to_string());
            }
            Translated::Closed(reason) => self.on_closed(&reason),
        }
    }

    fn on_closed(&mut self, reason: &CloseReason) {
        match self.state {
            SessionState::Starting => {
                self.fail_start(TransportError::Closed(reason.describe()).into());
            }
            SessionState::Running => {
                tracing::warn!(reason = %reason.describe(), "Analysis server exited unexpectedly");
                if let Some(mut active) = self.active.take() {
                    drop(active.release());
                }
                self.counter.invalidate();
                self.sink.message(ServerMessage::new(
                    MessageSeverity::Error,
                    format!("Analysis server stopped unexpectedly: {}", reason.describe()),
                ));
                self.set_state(SessionState::Stopped);
            }
            SessionState::Stopped | SessionState::Restarting | SessionState::Stopping => {}
        }
    }

    fn become_running(&mut self) {
        if self.state != SessionState::Starting {
            return;
        }
        self.set_state(SessionState::Running);
        if let Some(active) = self.active.as_mut() {
            active.resolve(&StartOutcome::Running);
        }
    }

    /// Terminal failure of the current attempt: one `StartFailed`, then
    /// back to `Stopped`.
    fn fail_start(&mut self, error: SessionError) {
        self.counter.invalidate();
        let mut released = self.active.take();
        if let Some(active) = released.as_mut() {
            drop(active.release());
        }
        self.sink.start_failed(error.clone());
        self.set_state(SessionState::Stopped);
        if let Some(mut active) = released {
            active.resolve(&StartOutcome::Failed(error));
        }
    }

    async fn push_settings(&mut self) -> SettingsDelivery {
        if !self.config.tooling_available {
            if self.config.settings.is_some() {
                tracing::debug!("Build tooling unavailable; withholding settings");
            }
            return SettingsDelivery::Withheld;
        }
        let send = {
            let Some(settings) = self.config.settings.as_ref() else {
                return SettingsDelivery::Deferred;
            };
            let Some(connection) = self.active.as_ref().and_then(|a| a.connection.as_ref())
            else {
                return SettingsDelivery::Deferred;
            };
            let params = protocol::did_change_configuration_params(settings);
            connection.notify(DID_CHANGE_CONFIGURATION_METHOD, Some(params))
        };

        match send.await {
            Ok(()) => {
                tracing::debug!("Sent configuration to analysis server");
                SettingsDelivery::Sent
            }
            Err(e) => {
                self.sink.trace(e.to_string());
                SettingsDelivery::Deferred
            }
        }
    }

    fn report_lifecycle(&self, what: &str) {
        let error = SessionError::Lifecycle(what.to_string());
        tracing::error!(error = %error, "Session invariant violated");
        self.sink
            .message(ServerMessage::new(error.severity(), error.to_string()));
    }
}

/// Connect, attach the translator, then run the handshake. Everything is
/// reported back to the actor tagged with the attempt number.
async fn run_attempt(
    connector: Arc<dyn Connector>,
    params: AttemptParams,
    guard: AttemptGuard,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let attempt = guard.attempt();
    let AttemptParams {
        spec,
        translator,
        config,
    } = params;

    let io = match connector.connect(&spec, &guard).await {
        Ok(io) => io,
        Err(SessionError::Transport(TransportError::Superseded)) => return,
        Err(error) => {
            let _ = tx.send(Internal::ConnectFailed { attempt, error });
            return;
        }
    };
    if !guard.is_current() {
        return;
    }

    // The server sends nothing before `initialize`, so attaching right
    // after the reader starts loses no setup progress.
    let router = NotificationRouter::new();
    let mut connection = ServerConnection::spawn(io, router.clone());
    let closed = match connection.take_closed() {
        Some(closed) => closed,
        None => {
            let error = SessionError::Lifecycle("connection close signal already taken".to_string());
            let _ = tx.send(Internal::ConnectFailed { attempt, error });
            return;
        }
    };
    let forward = tx.clone();
    let attachment = translator::attach(&router, translator, closed, move |event| {
        forward.send(Internal::Translated { attempt, event }).is_ok()
    });
    // Only the reader task keeps the routes alive from here on.
    drop(router);

    match connection
        .initialize(
            config.project_root.as_deref(),
            &config.initialization_options,
            config.trace,
            config.handshake_timeout,
        )
        .await
    {
        Ok(()) => {
            let _ = tx.send(Internal::Connected {
                attempt,
                connection,
                attachment,
            });
        }
        Err(e) => {
            let _ = tx.send(Internal::ConnectFailed {
                attempt,
                error: e.into(),
            });
        }
    }
}
