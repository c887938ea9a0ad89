use std::{error::Error, time::Duration};

use tracing::{debug, instrument, warn};

use crate::models::AccessTestResult;

/// Probes `url` with a GET bounded by `timeout`.
///
/// No response within the bound is a `Timeout`; a response with a non-success status is
/// `Error(status)`, and a failed connection is `Error(0)`.
#[instrument(level = "debug", ret)]
pub async fn test_access(url: &str, timeout: Duration) -> AccessTestResult {
    let client = match reqwest::Client::builder()
        .user_agent(crate::USER_AGENT)
        .connect_timeout(timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = &e as &dyn Error, "Failed to build HTTP client for access test");
            return AccessTestResult::Error(0);
        }
    };

    // The bound covers connecting and receiving the response headers
    match tokio::time::timeout(timeout, client.get(url).send()).await {
        Err(_) => AccessTestResult::Timeout,
        Ok(Err(e)) if e.is_timeout() => AccessTestResult::Timeout,
        Ok(Err(e)) => {
            debug!(error = &e as &dyn Error, "Access test request failed");
            AccessTestResult::Error(e.status().map_or(0, |s| s.as_u16()))
        }
        Ok(Ok(response)) if response.status().is_success() => AccessTestResult::Ok,
        Ok(Ok(response)) => AccessTestResult::Error(response.status().as_u16()),
    }
}
