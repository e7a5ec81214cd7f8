//! Shared Kubernetes utilities using kube-rs

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::time::Instant;
use tracing::trace;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path with default timeouts
///
/// Falls back to in-cluster / `KUBECONFIG` inference when no path is given.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Whether a kube error is a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Whether a kube error is a 409 AlreadyExists/Conflict from the API server
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

/// Result of [`poll_until`]
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check produced a value before the deadline
    Ready(T),
    /// The deadline passed without the check producing a value
    TimedOut,
}

/// Poll until a check produces a value, fails, or the timeout elapses
///
/// The first check runs immediately. `Ok(None)` keeps polling, `Ok(Some(v))`
/// stops with [`PollOutcome::Ready`], and `Err` stops immediately and is
/// returned as-is; errors are terminal, not retried. A check still running
/// at the deadline is dropped, so a timed-out poll returns at the deadline
/// regardless of how long individual checks take.
pub async fn poll_until<T, E, F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    mut check_fn: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, check_fn()).await {
            Ok(result) => {
                if let Some(value) = result? {
                    return Ok(PollOutcome::Ready(value));
                }
            }
            Err(_) => {
                trace!("Polling check still running at deadline, abandoning it");
                return Ok(PollOutcome::TimedOut);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(PollOutcome::TimedOut);
        }

        trace!("Polling condition not yet met, retrying...");
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} error"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classifies_api_errors() {
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(409, "AlreadyExists")));
        assert!(is_conflict(&api_error(409, "AlreadyExists")));
        assert!(!is_conflict(&api_error(500, "InternalError")));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_returns_ready_value() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome: Result<PollOutcome<u32>, ()> = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n == 3 { Some(n) } else { None })
            },
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::Ready(3)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_stops_on_first_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome: Result<PollOutcome<()>, &str> = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("gone")
            },
        )
        .await;

        assert_eq!(outcome, Err("gone"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_at_deadline() {
        let start = Instant::now();
        let outcome: Result<PollOutcome<()>, ()> = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(3),
            || async { Ok(None) },
        )
        .await;

        let elapsed = start.elapsed();
        assert_eq!(outcome, Ok(PollOutcome::TimedOut));
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed <= Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_check_is_cut_off_at_deadline() {
        let start = Instant::now();
        let outcome: Result<PollOutcome<()>, ()> = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(None)
            },
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::TimedOut));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn check_finishing_before_deadline_still_counts() {
        let outcome: Result<PollOutcome<u32>, ()> = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            || async {
                tokio::time::sleep(Duration::from_secs(9)).await;
                Ok(Some(7))
            },
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::Ready(7)));
    }
}
