//! Transport retry driver for remote (socket) connections.
//!
//! # Policy
//!
//! - `max_attempts` total attempts (1 = no retry)
//! - `delay` between attempts, fixed or doubling up to a cap
//! - each attempt bounded by `per_attempt_timeout` (zero = unbounded)
//!
//! Every attempt is logged; only the final [`RetryOutcome`] reaches the
//! session. The driver carries an [`AttemptGuard`] and checks it before each
//! attempt and after each delay, so a superseded start abandons its pending
//! retries without touching the session.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::transport::ServerIo;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    #[default]
    Fixed,
    /// Double the delay after every failed attempt, capped at `max_delay`.
    Exponential { max_delay: Duration },
}

/// Retry configuration for remote connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub delay: Duration,
    /// Bound on a single attempt. Zero disables the bound.
    pub per_attempt_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(5000),
            per_attempt_timeout: Duration::from_millis(5000),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `failed_attempt`-th attempt (1-based) failed.
    #[must_use]
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => {
                let step = failed_attempt.saturating_sub(1).min(16);
                self.delay.saturating_mul(1 << step).min(max_delay)
            }
        }
    }
}

/// Monotonic per-session attempt counter.
///
/// Every start and every stop advances it. Work captured under an older
/// value is stale and must not act.
#[derive(Debug, Clone, Default)]
pub struct AttemptCounter {
    current: Arc<AtomicU64>,
}

impl AttemptCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the counter and return a guard for the new attempt.
    pub fn advance(&self) -> AttemptGuard {
        let attempt = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        AttemptGuard {
            attempt,
            current: Arc::clone(&self.current),
        }
    }

    /// Advance the counter without starting a new attempt.
    pub fn invalidate(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }
}

/// An attempt number captured at start, checked before acting.
#[derive(Debug, Clone)]
pub struct AttemptGuard {
    attempt: u64,
    current: Arc<AtomicU64>,
}

impl AttemptGuard {
    #[must_use]
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Whether no newer start or stop has happened since capture.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.attempt
    }
}

/// Dial future type alias.
pub type DialFut<'a> = Pin<Box<dyn Future<Output = io::Result<ServerIo>> + Send + 'a>>;

/// Opens one raw connection. Implemented over TCP in production and by
/// scripted fakes in tests.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> DialFut<'a>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, host: &'a str, port: u16) -> DialFut<'a> {
        Box::pin(async move {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok(ServerIo::new(reader, writer))
        })
    }
}

/// Final result of a retried connection.
#[derive(Debug)]
pub enum RetryOutcome {
    Connected { io: ServerIo, attempts: u32 },
    /// Every attempt failed; `last_error` describes the final one.
    Exhausted { attempts: u32, last_error: String },
    /// A newer start or stop invalidated this driver.
    Superseded,
}

/// Dial `host:port` under `policy`, abandoning as soon as `guard` goes stale.
pub async fn connect_with_retry(
    dialer: &dyn Dialer,
    host: &str,
    port: u16,
    policy: &RetryPolicy,
    guard: &AttemptGuard,
) -> RetryOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if !guard.is_current() {
            tracing::debug!(attempt, "Connection attempt superseded before dialing");
            return RetryOutcome::Superseded;
        }

        tracing::info!(attempt, max_attempts, host, port, "Connecting to analysis server");
        match dial_once(dialer, host, port, policy.per_attempt_timeout).await {
            Ok(io) => {
                if !guard.is_current() {
                    tracing::debug!(attempt, "Dropping connection for superseded attempt");
                    return RetryOutcome::Superseded;
                }
                tracing::info!(attempt, host, port, "Connected to analysis server");
                return RetryOutcome::Connected {
                    io,
                    attempts: attempt,
                };
            }
            Err(e) => {
                tracing::warn!(attempt, max_attempts, error = %e, "Connection attempt failed");
                last_error = e.to_string();
            }
        }

        if attempt < max_attempts {
            let delay = policy.delay_after(attempt);
            tracing::debug!(delay_ms = delay.as_millis(), "Retrying connection");
            tokio::time::sleep(delay).await;
        }
    }

    RetryOutcome::Exhausted {
        attempts: max_attempts,
        last_error,
    }
}

async fn dial_once(
    dialer: &dyn Dialer,
    host: &str,
    port: u16,
    timeout: Duration,
) -> io::Result<ServerIo> {
    if timeout.is_zero() {
        return dialer.dial(host, port).await;
    }
    match tokio::time::timeout(timeout, dialer.dial(host, port)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timed out after {}ms", timeout.as_millis()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` dials, then hands out in-memory pipes.
    struct ScriptedDialer {
        failures: u32,
        dials: AtomicU32,
    }

    impl ScriptedDialer {
        fn failing(failures: u32) -> Self {
            Self {
                failures,
                dials: AtomicU32::new(0),
            }
        }

        fn dials(&self) -> u32 {
            self.dials.load(Ordering::SeqCst)
        }
    }

    impl Dialer for ScriptedDialer {
        fn dial<'a>(&'a self, _host: &'a str, _port: u16) -> DialFut<'a> {
            let n = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if n <= self.failures {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    ));
                }
                let (client, _server) = tokio::io::duplex(64);
                let (reader, writer) = tokio::io::split(client);
                Ok(ServerIo::new(reader, writer))
            })
        }
    }

    /// Never completes a dial.
    struct HangingDialer {
        dials: AtomicU32,
    }

    impl Dialer for HangingDialer {
        fn dial<'a>(&'a self, _host: &'a str, _port: u16) -> DialFut<'a> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::pending())
        }
    }

    fn policy(max_attempts: u32, delay_ms: u64, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(delay_ms),
            per_attempt_timeout: Duration::from_millis(timeout_ms),
            backoff: Backoff::Fixed,
        }
    }

    #[tokio::test]
    async fn always_failing_transport_is_dialed_exactly_max_attempts() {
        let dialer = ScriptedDialer::failing(u32::MAX);
        let guard = AttemptCounter::new().advance();

        let outcome = connect_with_retry(&dialer, "localhost", 5007, &policy(3, 0, 50), &guard).await;

        match outcome {
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("refused"));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(dialer.dials(), 3);
    }

    #[tokio::test]
    async fn success_on_third_attempt_stops_retrying() {
        let dialer = ScriptedDialer::failing(2);
        let guard = AttemptCounter::new().advance();

        let outcome = connect_with_retry(&dialer, "localhost", 5007, &policy(5, 0, 50), &guard).await;

        assert!(matches!(outcome, RetryOutcome::Connected { attempts: 3, .. }));
        assert_eq!(dialer.dials(), 3);
    }

    #[tokio::test]
    async fn single_attempt_policy_never_retries() {
        let dialer = ScriptedDialer::failing(u32::MAX);
        let guard = AttemptCounter::new().advance();

        let outcome = connect_with_retry(&dialer, "localhost", 5007, &policy(1, 0, 0), &guard).await;

        assert!(matches!(outcome, RetryOutcome::Exhausted { attempts: 1, .. }));
        assert_eq!(dialer.dials(), 1);
    }

    #[tokio::test]
    async fn per_attempt_timeout_counts_as_failure() {
        let dialer = HangingDialer {
            dials: AtomicU32::new(0),
        };
        let guard = AttemptCounter::new().advance();

        let outcome = connect_with_retry(&dialer, "localhost", 5007, &policy(2, 0, 50), &guard).await;

        match outcome {
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out after 50ms"));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_guard_never_dials() {
        let dialer = ScriptedDialer::failing(0);
        let counter = AttemptCounter::new();
        let guard = counter.advance();
        counter.invalidate();

        let outcome = connect_with_retry(&dialer, "localhost", 5007, &policy(3, 0, 50), &guard).await;

        assert!(matches!(outcome, RetryOutcome::Superseded));
        assert_eq!(dialer.dials(), 0);
    }

    #[tokio::test]
    async fn invalidation_during_delay_abandons_pending_retry() {
        let dialer = Arc::new(ScriptedDialer::failing(u32::MAX));
        let counter = AttemptCounter::new();
        let guard = counter.advance();

        let task_dialer = Arc::clone(&dialer);
        let task = tokio::spawn(async move {
            connect_with_retry(
                task_dialer.as_ref(),
                "localhost",
                5007,
                &policy(5, 200, 50),
                &guard,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        counter.invalidate();

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, RetryOutcome::Superseded));
        assert_eq!(dialer.dials(), 1);
    }

    #[test]
    fn fixed_backoff_keeps_delay() {
        let policy = policy(5, 5000, 5000);
        assert_eq!(policy.delay_after(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_after(4), Duration::from_millis(5000));
    }

    #[test]
    fn exponential_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential {
                max_delay: Duration::from_millis(3000),
            },
            ..policy(5, 1000, 0)
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_after(30), Duration::from_millis(3000));
    }

    #[test]
    fn zero_delay_is_legal() {
        assert_eq!(policy(3, 0, 0).delay_after(1), Duration::ZERO);
    }

    #[test]
    fn guards_go_stale_on_advance_and_invalidate() {
        let counter = AttemptCounter::new();
        let first = counter.advance();
        assert!(first.is_current());

        let second = counter.advance();
        assert!(!first.is_current());
        assert!(second.is_current());
        assert_eq!(second.attempt(), first.attempt() + 1);

        counter.invalidate();
        assert!(!second.is_current());
        assert_eq!(counter.advance().attempt(), second.attempt() + 2);
    }
}
