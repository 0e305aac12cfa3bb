//! Lifecycle manager for a Grails analysis-server session.
//!
//! Owns at most one live connection to the server, drives it through
//! `Stopped → Starting → Running` using the server's setup progress, and
//! publishes state, progress and messages on an [`EventSink`].

pub mod codec;
pub mod error;
pub mod provision;
pub mod retry;
pub mod router;
pub mod sink;
pub mod translator;
pub mod transport;
pub mod types;

pub(crate) mod connection;
pub(crate) mod protocol;

mod session;

pub use connection::CloseReason;
pub use error::{ProtocolError, ProvisionError, SessionError, TransportError};
pub use provision::{ConnectionSpec, DebugAgent, LocalSpec, RemoteSpec, ServerSettings};
pub use retry::{AttemptCounter, AttemptGuard, Backoff, Dialer, RetryPolicy, TcpDialer};
pub use session::{Session, SettingsDelivery, StartOutcome};
pub use sink::{EventSink, EventSubscription, SessionEvent};
pub use translator::TokenMatcher;
pub use transport::{Connector, DefaultConnector, ServerIo};
pub use types::{
    MessageRoute, MessageSeverity, ProgressEvent, ProgressUpdate, ReadyPolicy, ServerMessage,
    SessionConfig, SessionState, TraceLevel,
};
