// src/utils/http.rs

//! HTTP client utilities shared by the platform adapters.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};

use crate::error::{FetchError, Result};
use crate::models::HttpConfig;

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &HttpConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    Ok(client)
}

/// Pass successful responses through; turn everything else into the
/// matching `FetchError` category.
pub async fn check_response(response: Response) -> std::result::Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let hint = retry_after(response.headers(), Utc::now());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, hint, &body))
}

/// Map a non-success status to an error category.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> FetchError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status {
        StatusCode::UNAUTHORIZED => FetchError::Auth(detail),
        StatusCode::FORBIDDEN => FetchError::Permission(detail),
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => FetchError::Transient(detail),
        s if s.is_server_error() => FetchError::Transient(detail),
        _ => FetchError::Protocol(detail),
    }
}

/// Parse a `Retry-After` header given either as seconds or as an HTTP date.
pub fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    (at.with_timezone(&Utc) - now).to_std().ok()
}

/// Duration until an epoch-seconds reset time, zero if already past.
pub fn until_epoch(reset_epoch_secs: i64, now: DateTime<Utc>) -> Duration {
    let secs = reset_epoch_secs.saturating_sub(now.timestamp());
    Duration::from_secs(secs.max(0) as u64)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            FetchError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, ""),
            FetchError::Permission(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, ""),
            FetchError::Protocol(_)
        ));
        assert_eq!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(30)),
                ""
            ),
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
        );
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(
            retry_after(&headers, Utc::now()),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:29:30 GMT"),
        );
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_retry_after_missing_or_garbage() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers, Utc::now()), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers, Utc::now()), None);
    }

    #[test]
    fn test_until_epoch() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        assert_eq!(until_epoch(1_060, now), Duration::from_secs(60));
        assert_eq!(until_epoch(900, now), Duration::ZERO);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
