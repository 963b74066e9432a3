//! Server-sent-events streaming
//!
//! The streaming variant of the forwarder: connect with a generous dial
//! timeout, then relay every chunk the moment it arrives. The stream has
//! no overall deadline; the origin decides when it ends.

use crate::forwarder::{flatten_headers, Forwarder, ForwardError};
use futures_util::StreamExt;
use localrun_proto::{Frame, RequestPayload, SseChunkPayload, SseEndPayload, SseStartPayload};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Timeout for establishing the stream (connect + response headers).
pub const SSE_DIAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Why an SSE hand-off failed, and whether `sse-start` already went out.
pub(crate) struct SseFailure {
    pub error: ForwardError,
    pub started: bool,
}

/// Stream one SSE request. Emits `sse-start`, then one `sse-chunk` per
/// origin read, then `sse-end`. No retries; the caller records failures
/// against the circuit breaker.
pub(crate) async fn stream(
    forwarder: &Forwarder,
    request: &RequestPayload,
) -> Result<(), SseFailure> {
    let client = forwarder.origin_client().await.map_err(|error| SseFailure {
        error,
        started: false,
    })?;

    let method = Method::from_bytes(request.method.as_bytes()).map_err(|_| SseFailure {
        error: ForwardError::Setup(format!("Invalid HTTP method '{}'", request.method)),
        started: false,
    })?;

    let url = format!("{}{}", forwarder.config().origin_base(), request.path);
    let mut builder = client.request(method, &url);
    for (name, value) in &request.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(header_name), Ok(header_value)) => {
                builder = builder.header(header_name, header_value);
            }
            _ => warn!("Skipping invalid request header '{}'", name),
        }
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = match timeout(SSE_DIAL_TIMEOUT, builder.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            return Err(SseFailure {
                error: ForwardError::Http(e),
                started: false,
            })
        }
        Err(_) => {
            return Err(SseFailure {
                error: ForwardError::DialTimeout,
                started: false,
            })
        }
    };

    // Connected: that alone counts as origin success.
    forwarder.record_breaker_success().await;

    let status = response.status().as_u16();
    let headers = flatten_headers(response.headers());
    debug!("SSE stream for {} opened with status {}", request.path, status);

    forwarder.send_frame(Frame::SseStart(SseStartPayload {
        request_id: request.id.clone(),
        status,
        headers,
    }));

    let mut body = response.bytes_stream();
    while let Some(next) = body.next().await {
        match next {
            Ok(bytes) => {
                forwarder.send_frame(Frame::SseChunk(SseChunkPayload {
                    request_id: request.id.clone(),
                    chunk: String::from_utf8_lossy(&bytes).into_owned(),
                }));
            }
            Err(e) => {
                forwarder.send_frame(Frame::SseEnd(SseEndPayload {
                    request_id: request.id.clone(),
                    reason: Some("stream_error".to_string()),
                }));
                return Err(SseFailure {
                    error: ForwardError::Http(e),
                    started: true,
                });
            }
        }
    }

    debug!("SSE stream for {} ended cleanly", request.path);
    forwarder.send_frame(Frame::SseEnd(SseEndPayload {
        request_id: request.id.clone(),
        reason: Some("stream_ended".to_string()),
    }));

    Ok(())
}
