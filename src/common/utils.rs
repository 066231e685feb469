//! Utility functions for fleetconf

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Generate a new record key (users, apps, configs)
pub fn generate_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Validate a user-supplied name (must be non-empty, reasonable length)
pub fn validate_name(field: &str, name: &str) -> crate::Result<()> {
    if name.trim().is_empty() {
        return Err(crate::Error::InvalidRequest(format!(
            "{} cannot be empty",
            field
        )));
    }

    if name.len() > 256 {
        return Err(crate::Error::InvalidRequest(format!(
            "{} too long (max 256 bytes)",
            field
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidRequest(format!(
            "{} contains invalid characters",
            field
        )));
    }

    Ok(())
}

/// Next delay of an exponential backoff, with up to 10% jitter, capped at `max`
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    let doubled = current.saturating_mul(2).min(max);
    let jitter_ms = (doubled.as_millis() as u64 / 10).max(1);
    let jitter = Duration::from_millis(rand::random::<u64>() % jitter_ms);
    doubled.saturating_sub(jitter).max(current.min(max))
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}
