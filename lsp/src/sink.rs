//! Event sink: the session's single-writer, multi-reader outlet.
//!
//! Only the session actor writes. Readers either subscribe to the ordered
//! event stream or query the retained snapshots (current state, latest
//! progress per token, recent messages). Delivery never blocks the writer.

use std::collections::{HashMap, VecDeque};
use std::iter;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, watch};

use crate::error::SessionError;
use crate::types::{MessageRoute, ProgressEvent, ProgressUpdate, ServerMessage, SessionState};

/// Messages retained for diagnostics.
pub const MESSAGE_HISTORY_LIMIT: usize = 64;

/// Everything a collaborator can observe about a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Progress(ProgressUpdate),
    /// User-visible message (error-report or status path).
    Message(ServerMessage),
    /// Diagnostic trace line. Never user-facing.
    Trace(String),
    /// Terminal failure of one start attempt. Emitted once per attempt.
    StartFailed(SessionError),
}

#[derive(Default)]
struct Shared {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<SessionEvent>)>,
    latest_progress: HashMap<String, ProgressEvent>,
    history: VecDeque<ServerMessage>,
}

/// Cloneable handle to one session's sink.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<Mutex<Shared>>,
    state: Arc<watch::Sender<SessionState>>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Stopped);
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            state: Arc::new(state),
        }
    }

    fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
        shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(shared: &mut Shared, event: &SessionEvent) {
        shared
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    // -- reader side ------------------------------------------------------

    /// Ordered stream of every event emitted from now on.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = Self::lock(&self.shared);
        let id = shared.next_id;
        shared.next_id += 1;
        shared.subscribers.push((id, tx));
        EventSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
            rx,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that always holds the latest state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn latest_progress(&self, token: &str) -> Option<ProgressEvent> {
        Self::lock(&self.shared).latest_progress.get(token).cloned()
    }

    /// Most recent messages, oldest first.
    #[must_use]
    pub fn recent_messages(&self) -> Vec<ServerMessage> {
        Self::lock(&self.shared).history.iter().cloned().collect()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        Self::lock(&self.shared).subscribers.len()
    }

    // -- writer side (session actor only) ----------------------------------

    pub(crate) fn state_changed(&self, state: SessionState) {
        tracing::info!(state = %state, "Session state changed");
        let mut shared = Self::lock(&self.shared);
        // Updated under the lock so the stream and the watch never disagree
        // on ordering.
        self.state.send_replace(state);
        Self::publish(&mut shared, &SessionEvent::StateChanged(state));
    }

    pub(crate) fn progress(&self, update: ProgressUpdate) {
        tracing::debug!(
            token = %update.token,
            text = update.event.display_text().unwrap_or_default(),
            percentage = update.event.percentage(),
            "Progress"
        );
        let mut shared = Self::lock(&self.shared);
        shared
            .latest_progress
            .insert(update.token.clone(), update.event.clone());
        Self::publish(&mut shared, &SessionEvent::Progress(update));
    }

    /// Report a message on the path its severity selects.
    pub(crate) fn message(&self, message: ServerMessage) {
        let mut shared = Self::lock(&self.shared);
        if shared.history.len() == MESSAGE_HISTORY_LIMIT {
            shared.history.pop_front();
        }
        shared.history.push_back(message.clone());

        match message.route() {
            MessageRoute::ErrorReport => {
                tracing::warn!(severity = message.severity.label(), "{}", message.text);
                Self::publish(&mut shared, &SessionEvent::Message(message));
            }
            MessageRoute::Status => {
                tracing::info!("{}", message.text);
                Self::publish(&mut shared, &SessionEvent::Message(message));
            }
            MessageRoute::Trace => {
                drop(shared);
                self.trace(message.text);
            }
        }
    }

    pub(crate) fn trace(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::debug!(target: "grails_lsp::server_trace", "{text}");
        let mut shared = Self::lock(&self.shared);
        Self::publish(&mut shared, &SessionEvent::Trace(text));
    }

    pub(crate) fn start_failed(&self, error: SessionError) {
        tracing::warn!(error = %error, "Session start failed");
        let mut shared = Self::lock(&self.shared);
        Self::publish(&mut shared, &SessionEvent::StartFailed(error));
    }

    /// Forget per-attempt progress. Called when a new attempt begins.
    pub(crate) fn clear_progress(&self) {
        Self::lock(&self.shared).latest_progress.clear();
    }
}

/// One reader's view of the event stream. Dropping it unsubscribes.
pub struct EventSubscription {
    id: u64,
    shared: Weak<Mutex<Shared>>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventSubscription {
    /// Next event. `None` once the sink is gone and the stream is drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued so far.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        iter::from_fn(|| self.try_recv()).collect()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            EventSink::lock(&shared)
                .subscribers
                .retain(|(id, _)| *id != self.id);
        }
    }
}
