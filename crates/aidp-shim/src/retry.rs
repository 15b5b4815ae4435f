// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded retry for outbound HTTP.
//!
//! Authorization failures are never retried; an attacker probing the
//! plane must see every denial. Only transport errors and 5xx responses
//! qualify, with exponential backoff and a small attempt cap.

use aidp_error::{AidpError, ErrorCode};
use std::time::Duration;
use tracing::warn;

const BASE_BACKOFF_MS: u64 = 100;

/// Send `request`, retrying transport errors and 5xx responses up to
/// `max_retries` additional times.
///
/// # Errors
///
/// `TRANSPORT_FAILED` when every attempt failed. Non-5xx responses are
/// returned to the caller untouched (including 4xx).
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    max_retries: u32,
) -> Result<reqwest::Response, AidpError> {
    let mut attempt = 0u32;
    loop {
        let cloned = request.try_clone().ok_or_else(|| {
            AidpError::new(ErrorCode::Internal, "request body is not retryable")
        })?;

        let outcome = cloned.send().await;
        let retryable = match &outcome {
            Ok(response) => response.status().is_server_error(),
            Err(_) => true,
        };

        if !retryable {
            return Ok(outcome.expect("non-retryable implies success"));
        }
        if attempt >= max_retries {
            return match outcome {
                Ok(response) => Ok(response),
                Err(err) => Err(AidpError::new(
                    ErrorCode::TransportFailed,
                    "request failed after retries",
                )
                .with_context("attempts", attempt + 1)
                .with_source(err)),
            };
        }

        let backoff = Duration::from_millis(BASE_BACKOFF_MS << attempt);
        warn!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying request");
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}
