//! Log and upload requests
//!
//! Both are plain-text POSTs. The upload reply is handed back to the
//! supervisor, bounded to [`MAX_RESPONSE_LEN`] bytes.

use crate::config::NetworkConfig;
use crate::error::WorkerError;
use std::io::Read;
use std::time::Duration;
use tracing::debug;

/// Longest server reply forwarded from an upload.
pub const MAX_RESPONSE_LEN: usize = 127;

const CONTENT_TYPE: &str = "text/plain; charset=utf-8";

fn post(url: &str, timeout: Duration, body: &str) -> Result<ureq::Response, WorkerError> {
    ureq::post(url)
        .timeout(timeout)
        .set("Content-Type", CONTENT_TYPE)
        .send_string(body)
        .map_err(|e| WorkerError::Network(e.to_string()))
}

/// Send one log line to the log endpoint.
pub fn send_log(config: &NetworkConfig, line: &str) -> Result<(), WorkerError> {
    let response = post(
        &config.log_url,
        Duration::from_millis(config.timeout_ms),
        line,
    )?;
    debug!("Log endpoint answered {}", response.status());
    Ok(())
}

/// Upload the summary and return the start of the server's reply.
pub fn upload(config: &NetworkConfig, summary: &str) -> Result<Vec<u8>, WorkerError> {
    let response = post(
        &config.upload_url,
        Duration::from_millis(config.timeout_ms),
        summary,
    )?;
    debug!("Upload endpoint answered {}", response.status());

    let mut reply = Vec::with_capacity(MAX_RESPONSE_LEN);
    response
        .into_reader()
        .take(MAX_RESPONSE_LEN as u64)
        .read_to_end(&mut reply)
        .map_err(|e| WorkerError::Network(format!("reading response: {e}")))?;
    Ok(reply)
}
