//! HTTP probe implementation.

use std::time::{Duration, Instant};

use super::ProbeOutcome;

/// Run one HTTP check against the given URL.
///
/// `up` iff the endpoint answers within `timeout` with a 2xx/3xx status;
/// timeouts, connection/DNS/TLS failures and other status codes are `down`
/// with a short reason. Never retries internally.
pub async fn run_probe(client: &reqwest::Client, url: &str, timeout: Duration) -> ProbeOutcome {
    let start = Instant::now();

    let response = client.get(url).timeout(timeout).send().await;

    match response {
        Ok(res) => {
            let elapsed_ms = start.elapsed().as_millis() as i64;
            let status = res.status();
            if status.is_success() || status.is_redirection() {
                ProbeOutcome::up(elapsed_ms)
            } else {
                ProbeOutcome::down(elapsed_ms, format!("http_{}", status.as_u16()))
            }
        }
        Err(e) => {
            let elapsed_ms = start.elapsed().as_millis() as i64;
            ProbeOutcome::down(elapsed_ms, classify_error(&e))
        }
    }
}

fn classify_error(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        return "timeout";
    }
    if e.is_connect() {
        // reqwest folds DNS and TLS failures into the connect error chain.
        let chain = format!("{:?}", e);
        if chain.contains("dns") || chain.contains("resolve") {
            return "dns";
        }
        if chain.contains("tls") || chain.contains("certificate") {
            return "tls";
        }
        return "connect";
    }
    "network"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TickStatus;

    #[tokio::test]
    async fn test_probe_failure_is_down_not_error() {
        let client = reqwest::Client::new();
        // Unroutable host: must resolve to a down outcome with a detail,
        // never a panic or an Err.
        let outcome =
            run_probe(&client, "http://nonexistent.invalid", Duration::from_millis(500)).await;
        assert_eq!(outcome.status, TickStatus::Down);
        assert!(outcome.error_detail.is_some());
    }
}
