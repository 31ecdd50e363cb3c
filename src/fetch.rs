//! Timeout guard for upstream calls.
//!
//! Upstream clients offer no cooperative cancellation, so the guarded
//! operation is spawned onto the runtime and only the *wait* is bounded. When
//! the budget elapses the caller gets `ProfileError::Timeout` and the task is
//! left to finish on its own; its result is dropped.

use std::future::Future;
use std::time::Duration;

use crate::error::ProfileError;
use crate::sources::SourceError;

/// Run `operation` with a deadline of `budget`, tagging failures with `label`.
pub async fn guard<T, F>(operation: F, budget: Duration, label: &str) -> Result<T, ProfileError>
where
    F: Future<Output = Result<T, SourceError>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(operation);

    match tokio::time::timeout(budget, handle).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(ProfileError::SourceUnavailable {
            label: label.to_string(),
            message: e.to_string(),
        }),
        Ok(Err(join_err)) => Err(ProfileError::SourceUnavailable {
            label: label.to_string(),
            message: format!("task failed: {join_err}"),
        }),
        Err(_) => {
            log::debug!("{label}: no response within {} ms, detaching", budget.as_millis());
            Err(ProfileError::Timeout {
                label: label.to_string(),
                budget_ms: budget.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_guard_passes_through_value() {
        let result = guard(async { Ok::<_, SourceError>(7) }, Duration::from_secs(1), "fast").await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_guard_maps_source_error() {
        let result: Result<(), _> = guard(
            async { Err(SourceError::Unavailable("503".into())) },
            Duration::from_secs(1),
            "documents",
        )
        .await;
        match result {
            Err(ProfileError::SourceUnavailable { label, message }) => {
                assert_eq!(label, "documents");
                assert!(message.contains("503"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out_without_cancelling() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let result: Result<(), _> = guard(
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(2_500),
            "meetings",
        )
        .await;

        assert_eq!(
            result,
            Err(ProfileError::Timeout {
                label: "meetings".into(),
                budget_ms: 2_500
            })
        );
        assert!(!finished.load(Ordering::SeqCst));

        // The detached task keeps running and completes later.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_guard_reports_panicking_task() {
        let explode = true;
        let result: Result<(), _> = guard(
            async move {
                if explode {
                    panic!("client bug");
                }
                Ok::<(), SourceError>(())
            },
            Duration::from_secs(1),
            "directory",
        )
        .await;
        assert!(matches!(result, Err(ProfileError::SourceUnavailable { .. })));
    }
}
