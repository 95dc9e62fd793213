use std::future::Future;

use crate::error::Result;

/// Retry an async operation with exponential backoff for transient errors.
/// Non-transient errors are returned immediately.
pub async fn with_retry<F, Fut, T>(max_retries: usize, base_delay_ms: u64, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= max_retries {
                    return Err(e);
                }
                let delay = base_delay_ms.saturating_mul(2u64.saturating_pow(attempt as u32));
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay,
                    error = %e,
                    "transient error, retrying"
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}
