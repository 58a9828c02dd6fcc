/// Bounded, delay-free retries for link and store operations
use log::warn;
use std::fmt::Display;
use std::future::Future;

/// Run `op` up to `attempts` times while its error is `retryable`
///
/// At least one attempt is always made. Each failure is logged with its
/// 1-based attempt number, and the last error is returned unchanged once the
/// attempts run out or a non-retryable error shows up.
pub async fn retry_if<T, E, F, Fut, P>(
    attempts: usize,
    what: &str,
    retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                if attempt >= attempts || !retryable(&e) {
                    return Err(e);
                }
            }
        }
        attempt += 1;
    }
}

/// Run `op` up to `attempts` times, retrying every error
pub async fn retry<T, E, F, Fut>(attempts: usize, what: &str, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_if(attempts, what, |_| true, op).await
}
