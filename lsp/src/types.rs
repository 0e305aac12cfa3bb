//! Public types shared between the session core and its collaborators.
//!
//! The controller builds a [`SessionConfig`], collaborators read
//! [`SessionState`], [`ProgressUpdate`] and [`ServerMessage`] values off the
//! event sink. Nothing here performs I/O.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::provision::ServerSettings;
use crate::translator::TokenMatcher;

/// Lifecycle state of a session. Owned by the session actor; collaborators
/// only ever observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Stopped,
    Starting,
    Running,
    Restarting,
    Stopping,
}

impl SessionState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
        }
    }

    /// Whether a live or in-flight transport belongs to this state.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One work-done progress notification, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Begin {
        title: String,
        message: Option<String>,
        percentage: Option<u32>,
    },
    Report {
        message: Option<String>,
        percentage: Option<u32>,
    },
    End {
        message: Option<String>,
    },
}

impl ProgressEvent {
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End { .. })
    }

    /// Text a status line should show for this event.
    ///
    /// Begin prefers `message` over `title`; End falls back to "Server ready".
    #[must_use]
    pub fn display_text(&self) -> Option<&str> {
        match self {
            Self::Begin { title, message, .. } => Some(message.as_deref().unwrap_or(title)),
            Self::Report { message, .. } => message.as_deref(),
            Self::End { message } => Some(message.as_deref().unwrap_or("Server ready")),
        }
    }

    #[must_use]
    pub fn percentage(&self) -> Option<u32> {
        match self {
            Self::Begin { percentage, .. } | Self::Report { percentage, .. } => *percentage,
            Self::End { .. } => Some(100),
        }
    }
}

/// A progress event together with the token it was reported under.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub token: String,
    pub event: ProgressEvent,
}

/// Severity of a message surfaced through the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageSeverity {
    /// Internal invariant violation; never produced by the server.
    Critical = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Log = 4,
}

impl MessageSeverity {
    /// Convert from the protocol's `window/showMessage` type
    /// (1=Error, 2=Warning, 3=Info, 4=Log).
    ///
    /// Returns `None` for anything else; the translator decides the fallback.
    #[must_use]
    pub fn from_lsp(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Info),
            4 => Some(Self::Log),
            _ => None,
        }
    }

    /// Which reporting path a message of this severity takes.
    #[must_use]
    pub fn route(self) -> MessageRoute {
        match self {
            Self::Critical | Self::Error | Self::Warning => MessageRoute::ErrorReport,
            Self::Info => MessageRoute::Status,
            Self::Log => MessageRoute::Trace,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Log => "log",
        }
    }
}

/// Reporting path for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRoute {
    /// User-visible problem, handled by the error-reporting collaborator.
    ErrorReport,
    /// User-visible status update.
    Status,
    /// Diagnostic trace only. Never shown as a notification.
    Trace,
}

/// A message from the analysis server (or from the session itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub severity: MessageSeverity,
    pub text: String,
}

impl ServerMessage {
    pub fn new(severity: MessageSeverity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn route(&self) -> MessageRoute {
        self.severity.route()
    }
}

/// When a session leaves `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyPolicy {
    /// Wait for the End event of the expected setup token.
    #[default]
    OnProgressEnd,
    /// Treat a completed `initialize` handshake as readiness. For servers
    /// that never report setup progress.
    OnConnect,
}

/// Protocol trace level, forwarded to the server via `$/setTrace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceLevel {
    #[default]
    Off,
    Messages,
    Verbose,
}

impl TraceLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Messages => "messages",
            Self::Verbose => "verbose",
        }
    }
}

/// Everything a session needs to (re)start. Re-read on every `start()`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server: ServerSettings,
    /// Which progress tokens belong to server setup.
    pub progress: TokenMatcher,
    pub ready_policy: ReadyPolicy,
    pub trace: TraceLevel,
    /// Project root supplied by the workspace collaborator.
    pub project_root: Option<PathBuf>,
    /// Opaque `initializationOptions` for the `initialize` request.
    pub initialization_options: serde_json::Value,
    /// Opaque settings sent as `workspace/didChangeConfiguration`.
    pub settings: Option<serde_json::Value>,
    /// Whether the build tooling prerequisite is available. Configuration
    /// notifications are withheld while it is not.
    pub tooling_available: bool,
    /// Bound on the `initialize` round trip.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            progress: TokenMatcher::default(),
            ready_policy: ReadyPolicy::default(),
            trace: TraceLevel::default(),
            project_root: None,
            initialization_options: serde_json::Value::Null,
            settings: None,
            tooling_available: true,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}
