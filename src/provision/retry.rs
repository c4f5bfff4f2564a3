//! Bounded retry for flaky provisioning steps.
//!
//! Only failure kinds listed by the caller are retried; each suppressed
//! failure is logged. The last failure is handed back so the caller decides
//! whether to proceed anyway.

use std::future::Future;

use tracing::{info, warn};

use crate::task::{FailureKind, TaskError};

/// Kinds worth another attempt: the command ran and failed, or hung.
pub const TRANSIENT: &[FailureKind] = &[FailureKind::Process, FailureKind::Timeout];

/// Run `attempt` up to `times` times, stopping at the first success.
///
/// A failure whose kind is not in `retry_on` ends the loop immediately.
pub async fn attempts<F, Fut>(
    times: u32,
    what: &str,
    retry_on: &[FailureKind],
    mut attempt: F,
) -> Result<(), TaskError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TaskError>>,
{
    let mut last = None;
    for n in 1..=times {
        match attempt().await {
            Ok(()) => {
                if n > 1 {
                    info!("{} succeeded on attempt {}/{}", what, n, times);
                }
                return Ok(());
            }
            Err(err) if retry_on.contains(&err.kind()) => {
                warn!(
                    attempt = n,
                    kind = %err.kind(),
                    "{} failed on attempt {}/{}: {}",
                    what,
                    n,
                    times,
                    err
                );
                last = Some(err);
            }
            Err(err) => {
                warn!(kind = %err.kind(), "{} failed, not retrying: {}", what, err);
                return Err(err);
            }
        }
    }
    Err(last.unwrap_or_else(|| TaskError::failed_with(what, "no attempts made")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn stops_at_first_success() {
        let calls = Cell::new(0);
        let out = attempts(3, "up", TRANSIENT, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 2 {
                    Err(TaskError::process("up", 1))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(out.is_ok());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn returns_last_failure_after_exhausting_attempts() {
        let calls = Cell::new(0);
        let err = attempts(3, "up", TRANSIENT, || {
            calls.set(calls.get() + 1);
            let code = calls.get();
            async move { Err(TaskError::process("up", code)) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.get(), 3);
        assert_eq!(err.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn other_kinds_are_not_retried() {
        let calls = Cell::new(0);
        let err = attempts(3, "up", TRANSIENT, || {
            calls.set(calls.get() + 1);
            async { Err(TaskError::failed("up")) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert_eq!(err.kind(), FailureKind::Failed);
    }

    #[tokio::test]
    async fn zero_attempts_is_a_failure() {
        let err = attempts(0, "up", TRANSIENT, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no attempts made"));
    }
}
