//! Progress protocol translator.
//!
//! Turns raw `$/progress`, `window/showMessage` and `window/logMessage`
//! payloads into session-level events. [`ProgressTranslator`] is pure and
//! lives for exactly one start attempt; [`attach`] wires one to a
//! [`NotificationRouter`] and forwards what it produces.

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::connection::CloseReason;
use crate::error::ProtocolError;
use crate::protocol::{
    LOG_MESSAGE_METHOD, MessageParams, PROGRESS_METHOD, ProgressParams, SHOW_MESSAGE_METHOD,
    UNDECODABLE_FRAME_METHOD,
};
use crate::router::{NotificationRouter, RoutedNotification};
use crate::types::{ProgressUpdate, ServerMessage};

/// Token emitted by the analysis server while it sets itself up.
pub const SERVER_SETUP_TOKEN: &str = "GLS-SERVER-SETUP";
/// Prefix of the server's other long-running tasks.
pub const SERVER_TASK_PREFIX: &str = "grails-";

/// Which progress tokens belong to server setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMatcher {
    tokens: Vec<String>,
    prefixes: Vec<String>,
}

impl Default for TokenMatcher {
    fn default() -> Self {
        Self {
            tokens: vec![SERVER_SETUP_TOKEN.to_string()],
            prefixes: vec![SERVER_TASK_PREFIX.to_string()],
        }
    }
}

impl TokenMatcher {
    #[must_use]
    pub fn new(tokens: Vec<String>, prefixes: Vec<String>) -> Self {
        Self { tokens, prefixes }
    }

    /// Match one exact token only.
    #[must_use]
    pub fn exact(token: impl Into<String>) -> Self {
        Self {
            tokens: vec![token.into()],
            prefixes: Vec::new(),
        }
    }

    #[must_use]
    pub fn matches(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
            || self.prefixes.iter().any(|p| token.starts_with(p.as_str()))
    }
}

/// Result of feeding one `$/progress` payload to the translator.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressOutcome {
    /// Token doesn't belong to server setup.
    Ignored { token: String },
    Update(ProgressUpdate),
    /// First End for a matched token in this attempt.
    Ready(ProgressUpdate),
    Malformed(ProtocolError),
}

/// Per-attempt progress state.
#[derive(Debug, Clone)]
pub struct ProgressTranslator {
    matcher: TokenMatcher,
    ready: bool,
}

impl ProgressTranslator {
    #[must_use]
    pub fn new(matcher: TokenMatcher) -> Self {
        Self {
            matcher,
            ready: false,
        }
    }

    pub fn on_progress(&mut self, raw: &serde_json::Value) -> ProgressOutcome {
        let params: ProgressParams = match serde_json::from_value(raw.clone()) {
            Ok(params) => params,
            Err(e) => {
                return ProgressOutcome::Malformed(ProtocolError::Malformed {
                    method: PROGRESS_METHOD.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let token = params.token.into_string();
        if !self.matcher.matches(&token) {
            return ProgressOutcome::Ignored { token };
        }

        let event = match params.value.into_event(&token) {
            Ok(event) => event,
            Err(e) => return ProgressOutcome::Malformed(e),
        };

        let update = ProgressUpdate { token, event };
        if update.event.is_end() && !self.ready {
            self.ready = true;
            ProgressOutcome::Ready(update)
        } else {
            ProgressOutcome::Update(update)
        }
    }
}

/// Decode a `window/showMessage` payload.
pub fn route_message(raw: &serde_json::Value) -> Result<ServerMessage, ProtocolError> {
    decode_message(SHOW_MESSAGE_METHOD, raw)
}

fn decode_message(method: &str, raw: &serde_json::Value) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_value::<MessageParams>(raw.clone())
        .map(MessageParams::into_message)
        .map_err(|e| ProtocolError::Malformed {
            method: method.to_string(),
            reason: e.to_string(),
        })
}

/// What an attached translator forwards to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Translated {
    Progress(ProgressUpdate),
    Ready(ProgressUpdate),
    Message(ServerMessage),
    /// `window/logMessage` text. Diagnostic trace only.
    Log(String),
    Protocol(ProtocolError),
    /// The connection ended. Always the last event forwarded.
    Closed(CloseReason),
}

/// A translator wired to a router. Dropping it detaches all routes.
pub struct Attachment {
    task: JoinHandle<()>,
}

impl Attachment {
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Subscribe `translator` to `router` and forward translated events.
///
/// The routes are registered before this returns, so attach before the
/// server is asked to initialize. Once the router is gone and every queued
/// notification has been forwarded, the reason from `closed` is forwarded
/// as [`Translated::Closed`]. Forwarding stops once `forward` returns
/// `false`.
pub fn attach<F>(
    router: &NotificationRouter,
    mut translator: ProgressTranslator,
    closed: oneshot::Receiver<CloseReason>,
    forward: F,
) -> Attachment
where
    F: Fn(Translated) -> bool + Send + 'static,
{
    let mut notifications = router.subscribe_many(&[
        PROGRESS_METHOD,
        SHOW_MESSAGE_METHOD,
        LOG_MESSAGE_METHOD,
        UNDECODABLE_FRAME_METHOD,
    ]);

    let task = tokio::spawn(async move {
        while let Some(routed) = notifications.recv().await {
            let Some(translated) = translate(&mut translator, &routed) else {
                continue;
            };
            if !forward(translated) {
                return;
            }
        }
        notifications.unsubscribe();

        let reason = closed
            .await
            .unwrap_or_else(|_| CloseReason::Failed("connection dropped".to_string()));
        forward(Translated::Closed(reason));
    });

    Attachment { task }
}

fn translate(translator: &mut ProgressTranslator, routed: &RoutedNotification) -> Option<Translated> {
    let translated = match routed.method.as_str() {
        PROGRESS_METHOD => match translator.on_progress(&routed.params) {
            ProgressOutcome::Ignored { token } => {
                tracing::trace!(token = %token, "Ignoring progress for unrelated token");
                return None;
            }
            ProgressOutcome::Update(update) => Translated::Progress(update),
            ProgressOutcome::Ready(update) => Translated::Ready(update),
            ProgressOutcome::Malformed(e) => Translated::Protocol(e),
        },
        SHOW_MESSAGE_METHOD => match route_message(&routed.params) {
            Ok(message) => Translated::Message(message),
            Err(e) => Translated::Protocol(e),
        },
        LOG_MESSAGE_METHOD => match decode_message(LOG_MESSAGE_METHOD, &routed.params) {
            Ok(message) => Translated::Log(message.text),
            Err(e) => Translated::Protocol(e),
        },
        UNDECODABLE_FRAME_METHOD => Translated::Protocol(ProtocolError::Malformed {
            method: "frame".to_string(),
            reason: routed.params["reason"]
                .as_str()
                .unwrap_or("undecodable frame")
                .to_string(),
        }),
        _ => return None,
    };
    Some(translated)
}
