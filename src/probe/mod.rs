//! Probe executor: single HTTP checks with normalized outcomes.

mod http;

pub use http::run_probe;

use thiserror::Error;

use crate::db::TickStatus;

#[derive(Error, Debug)]
#[error("invalid URL: {0}")]
pub struct InvalidUrl(String);

/// Result of one probe. A failed check is a recorded outcome, not an error.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: TickStatus,
    pub response_time_ms: i64,
    pub error_detail: Option<String>,
}

impl ProbeOutcome {
    pub fn up(response_time_ms: i64) -> Self {
        Self {
            status: TickStatus::Up,
            response_time_ms,
            error_detail: None,
        }
    }

    pub fn down(response_time_ms: i64, detail: impl Into<String>) -> Self {
        Self {
            status: TickStatus::Down,
            response_time_ms,
            error_detail: Some(detail.into()),
        }
    }
}

/// Normalize a user-supplied URL: bare hostnames get an `https://` prefix,
/// and the result must parse as an absolute http(s) URL.
pub fn normalize_url(raw: &str) -> Result<String, InvalidUrl> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvalidUrl(raw.to_string()));
    }

    let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = reqwest::Url::parse(&candidate).map_err(|_| InvalidUrl(raw.to_string()))?;
    if parsed.host_str().is_none() {
        return Err(InvalidUrl(raw.to_string()));
    }

    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url_prefixes_https() {
        assert_eq!(
            normalize_url("example.com").unwrap(),
            "https://example.com"
        );
        assert_eq!(
            normalize_url("  example.com/path  ").unwrap(),
            "https://example.com/path"
        );
    }

    #[test]
    fn test_normalize_url_keeps_explicit_scheme() {
        assert_eq!(
            normalize_url("http://example.com").unwrap(),
            "http://example.com"
        );
        assert_eq!(
            normalize_url("https://example.com").unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn test_normalize_url_rejects_garbage() {
        assert!(normalize_url("").is_err());
        assert!(normalize_url("   ").is_err());
        assert!(normalize_url("ht tp://bad url").is_err());
    }
}
