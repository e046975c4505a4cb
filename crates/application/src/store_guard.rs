use std::future::Future;
use std::time::Duration;

use fleetguard_core::{AppError, AppResult};

/// Runs a store call with an upper bound on its duration.
///
/// A timeout surfaces as [`AppError::StoreUnavailable`] so callers apply the
/// same failure policy as for a refused connection.
pub(crate) async fn with_store_timeout<T, F>(
    timeout: Duration,
    operation: &'static str,
    future: F,
) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(AppError::StoreUnavailable(format!(
            "{operation} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
