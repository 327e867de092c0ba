//! Retry with exponential backoff for remote cache requests.
//!
//! 4xx responses are terminal: retrying an auth failure only burns time.
//! 5xx and transport errors get up to `max_retries` additional attempts,
//! doubling the delay each time.

use std::{future::Future, time::Duration};

use crate::Error;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
const BASE_DELAY: Duration = Duration::from_millis(250);

pub async fn retry_future<T, F, Fut>(max_retries: u32, mut future_factory: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match future_factory().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                attempt += 1;
                let delay = BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                tracing::debug!(
                    "retrying remote cache request (attempt {attempt}/{max_retries}) after {delay:?}: {err}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
