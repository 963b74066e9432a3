//! Request forwarding to the local origin
//!
//! Each inbound `request` frame is handled by one forwarding unit: gate on
//! the circuit breaker, dial the origin with an adaptive timeout, retry
//! transport failures, and emit exactly one `response` frame on every path
//! so the broker is never left waiting.

use crate::config::TunnelConfig;
use crate::health::{CircuitBreaker, HealthProber, BreakerTransition, BREAKER_COOLDOWN};
use crate::{sse, TunnelEvent};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use localrun_proto::{Frame, RequestPayload, ResponsePayload};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::HashMap;
use std::error::Error as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex, OnceCell};
use tracing::{debug, warn};

/// Retry count at which the health probe runs again before dialling.
const HEALTH_RECHECK_RETRY: u32 = 3;

/// Bodies above this size stretch the request timeout.
const LARGE_BODY_BYTES: usize = 50_000;

/// Transport failure classes, mapped from error kinds rather than message
/// substrings so the taxonomy survives localization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Timeout,
    ConnectionRefused,
    HostNotFound,
    ConnectionReset,
    NetworkUnreachable,
    Other,
}

impl ErrorClass {
    pub fn status(&self) -> u16 {
        match self {
            ErrorClass::Timeout => 504,
            ErrorClass::Other => 500,
            _ => 502,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::ConnectionRefused => "connection-refused",
            ErrorClass::HostNotFound => "host-not-found",
            ErrorClass::ConnectionReset => "connection-reset",
            ErrorClass::NetworkUnreachable => "network-unreachable",
            ErrorClass::Other => "unknown-error",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Other)
    }

    fn message(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "Request to local server timed out",
            ErrorClass::ConnectionRefused => "Local server refused the connection",
            ErrorClass::HostNotFound => "Local server host could not be resolved",
            ErrorClass::ConnectionReset => "Local server reset the connection",
            ErrorClass::NetworkUnreachable => "Local server network is unreachable",
            ErrorClass::Other => "Failed to forward request to local server",
        }
    }
}

/// Internal failure carrier for one forwarding attempt.
#[derive(Debug)]
pub(crate) enum ForwardError {
    Http(reqwest::Error),
    Setup(String),
    Unhealthy,
    DialTimeout,
}

impl ForwardError {
    pub(crate) fn class(&self) -> ErrorClass {
        match self {
            ForwardError::Http(e) => classify_error(e),
            ForwardError::Setup(_) => ErrorClass::Other,
            ForwardError::Unhealthy => ErrorClass::ConnectionRefused,
            ForwardError::DialTimeout => ErrorClass::Timeout,
        }
    }

    pub(crate) fn details(&self) -> String {
        match self {
            ForwardError::Http(e) => e.to_string(),
            ForwardError::Setup(msg) => msg.clone(),
            ForwardError::Unhealthy => "origin failed health check".to_string(),
            ForwardError::DialTimeout => "timed out connecting to origin".to_string(),
        }
    }
}

/// Map a reqwest failure onto the tunnel's error taxonomy.
pub fn classify_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        return ErrorClass::Timeout;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            match io_err.kind() {
                ErrorKind::ConnectionRefused => return ErrorClass::ConnectionRefused,
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe => return ErrorClass::ConnectionReset,
                ErrorKind::TimedOut => return ErrorClass::Timeout,
                ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                    return ErrorClass::NetworkUnreachable
                }
                _ => {}
            }
        }
        source = cause.source();
    }

    // DNS failures carry no dedicated io::ErrorKind; the resolver message
    // is the only remaining signal.
    let chain = error_chain_text(err);
    if chain.contains("dns error") || chain.contains("failed to lookup address") {
        return ErrorClass::HostNotFound;
    }
    ErrorClass::Other
}

fn error_chain_text(err: &reqwest::Error) -> String {
    let mut text = err.to_string().to_ascii_lowercase();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push(' ');
        text.push_str(&cause.to_string().to_ascii_lowercase());
        source = cause.source();
    }
    text
}

/// Timeout for one attempt, adapted to the request shape.
pub fn adaptive_timeout(
    base: Duration,
    method: &str,
    path: &str,
    retry: u32,
    body_len: usize,
) -> Duration {
    let base_ms = base.as_millis() as u64;
    let method = method.to_ascii_uppercase();

    let mut ms = if path.contains("/api/") && method == "GET" {
        base_ms.min(60_000)
    } else if method == "POST" || method == "PUT" || path.contains("/upload") {
        (base_ms * 2).min(180_000)
    } else if retry > 0 {
        ((base_ms as f64) * 1.5f64.powi(retry as i32)).min(60_000.0) as u64
    } else {
        base_ms
    };

    if body_len > LARGE_BODY_BYTES {
        let factor = (1.0 + body_len as f64 / 500_000.0).min(2.0);
        ms = ((ms as f64 * factor) as u64).min(180_000);
    }

    Duration::from_millis(ms)
}

/// Backoff before retry number `retry` (1-indexed). Timeouts back off more
/// gently but for longer.
pub fn retry_delay(class: ErrorClass, retry: u32) -> Duration {
    let n = retry.max(1);
    let ms = if class == ErrorClass::Timeout {
        ((2000.0 * 1.5f64.powi(n as i32 - 1)) as u64).min(8_000)
    } else {
        1000u64
            .saturating_mul(1u64 << (n - 1).min(16))
            .min(5_000)
    };
    Duration::from_millis(ms)
}

/// A request is server-sent events iff it asks for the event-stream media
/// type, targets an `/sse` path, or carries `Cache-Control: no-cache`.
pub fn is_sse_request(request: &RequestPayload) -> bool {
    if let Some(accept) = header_get(&request.headers, "accept") {
        if accept.to_ascii_lowercase().contains("text/event-stream") {
            return true;
        }
    }
    if request.path.contains("/sse") {
        return true;
    }
    header_get(&request.headers, "cache-control")
        .map(|v| v.eq_ignore_ascii_case("no-cache"))
        .unwrap_or(false)
}

/// Case-insensitive lookup in a flat header map.
pub fn header_get<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Deflate,
    Brotli,
    Unknown,
}

fn parse_encoding(content_encoding: Option<&str>) -> Compression {
    let Some(raw) = content_encoding else {
        return Compression::None;
    };

    let tokens: Vec<String> = raw
        .split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty() && t != "identity")
        .collect();

    match tokens.as_slice() {
        [] => Compression::None,
        [single] => match single.as_str() {
            "gzip" | "x-gzip" => Compression::Gzip,
            "deflate" => Compression::Deflate,
            "br" => Compression::Brotli,
            _ => Compression::Unknown,
        },
        // Stacked encodings are treated as opaque.
        _ => Compression::Unknown,
    }
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Content types carried as base64 regardless of encoding.
pub fn is_binary_content_type(content_type: &str) -> bool {
    let mt = media_type(content_type);
    mt.starts_with("image/")
        || mt.starts_with("video/")
        || mt.starts_with("audio/")
        || mt == "application/octet-stream"
        || mt == "application/pdf"
}

/// Content types safe to ship as decompressed UTF-8 text.
pub fn is_text_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    const TEXT_KINDS: [&str; 7] = [
        "text/",
        "application/json",
        "application/javascript",
        "application/x-javascript",
        "text/javascript",
        "application/xml",
        "application/xhtml+xml",
    ];
    TEXT_KINDS.iter().any(|kind| ct.contains(kind))
}

fn decompress(data: &[u8], compression: Compression) -> std::io::Result<Vec<u8>> {
    use std::io::Read;

    let mut out = Vec::new();
    match compression {
        Compression::Gzip => {
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
        }
        Compression::Deflate => {
            flate2::read::DeflateDecoder::new(data).read_to_end(&mut out)?;
        }
        Compression::Brotli => {
            brotli::Decompressor::new(data, 4096).read_to_end(&mut out)?;
        }
        Compression::None | Compression::Unknown => {
            out.extend_from_slice(data);
        }
    }
    Ok(out)
}

/// How a response body travels inside the frame.
#[derive(Debug, PartialEq, Eq)]
pub struct EncodedBody {
    pub body: String,
    pub is_base64: bool,
    /// True when the body was decompressed and the encoding headers no
    /// longer describe it.
    pub strip_encoding_headers: bool,
}

/// Decide the frame encoding for an origin response body.
pub fn encode_body(
    bytes: &[u8],
    content_type: &str,
    content_encoding: Option<&str>,
) -> EncodedBody {
    if is_binary_content_type(content_type) {
        return EncodedBody {
            body: BASE64.encode(bytes),
            is_base64: true,
            strip_encoding_headers: false,
        };
    }

    match parse_encoding(content_encoding) {
        Compression::None => EncodedBody {
            body: String::from_utf8_lossy(bytes).into_owned(),
            is_base64: false,
            strip_encoding_headers: false,
        },
        Compression::Unknown => EncodedBody {
            body: BASE64.encode(bytes),
            is_base64: true,
            strip_encoding_headers: false,
        },
        compression => {
            if !is_text_content_type(content_type) {
                return EncodedBody {
                    body: BASE64.encode(bytes),
                    is_base64: true,
                    strip_encoding_headers: false,
                };
            }
            match decompress(bytes, compression) {
                Ok(decompressed) => EncodedBody {
                    body: String::from_utf8_lossy(&decompressed).into_owned(),
                    is_base64: false,
                    strip_encoding_headers: true,
                },
                Err(e) => {
                    // Ship the compressed bytes untouched; the headers still
                    // describe them.
                    warn!("Decompression failed, passing body through as base64: {}", e);
                    EncodedBody {
                        body: BASE64.encode(bytes),
                        is_base64: true,
                        strip_encoding_headers: false,
                    }
                }
            }
        }
    }
}

/// Flatten a header map, joining repeated headers with `", "`. reqwest
/// normalizes names to lowercase.
pub fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        flat.insert(name.as_str().to_string(), joined);
    }
    flat
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-session forwarder shared by all in-flight request units.
pub struct Forwarder {
    config: TunnelConfig,
    client: OnceCell<reqwest::Client>,
    health: Arc<Mutex<HealthProber>>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    outbound: mpsc::UnboundedSender<Frame>,
    events: mpsc::UnboundedSender<TunnelEvent>,
}

impl Forwarder {
    pub fn new(
        config: TunnelConfig,
        health: Arc<Mutex<HealthProber>>,
        breaker: Arc<Mutex<CircuitBreaker>>,
        outbound: mpsc::UnboundedSender<Frame>,
        events: mpsc::UnboundedSender<TunnelEvent>,
    ) -> Self {
        Self {
            config,
            client: OnceCell::new(),
            health,
            breaker,
            outbound,
            events,
        }
    }

    pub(crate) fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Handle one inbound request end to end. Always emits exactly one
    /// answer on the outbound channel, whether a proxied response, a
    /// synthesized error, or an SSE frame sequence.
    pub async fn handle(&self, request: RequestPayload) {
        self.emit(TunnelEvent::Request {
            method: request.method.clone(),
            path: request.path.clone(),
            headers: request.headers.clone(),
        });

        if self.breaker.lock().await.is_open() {
            debug!(
                "Circuit breaker open, rejecting {} {}",
                request.method, request.path
            );
            self.send_frame(Frame::Response(self.circuit_open_response(&request.id)));
            return;
        }

        if is_sse_request(&request) {
            debug!("Streaming {} {} as SSE", request.method, request.path);
            match sse::stream(self, &request).await {
                Ok(()) => {}
                Err(failure) => {
                    warn!(
                        "SSE stream for {} failed: {}",
                        request.path,
                        failure.error.details()
                    );
                    self.record_breaker_error().await;
                    if !failure.started {
                        let class = failure.error.class();
                        self.send_frame(Frame::Response(self.error_response(
                            &request.id,
                            class,
                            &failure.error.details(),
                        )));
                    }
                }
            }
            return;
        }

        match self.forward_with_retries(&request).await {
            Ok(response) => {
                self.record_breaker_success().await;
                self.send_frame(Frame::Response(response));
            }
            Err(err) => {
                let class = err.class();
                warn!(
                    "Failed to forward {} {}: {}",
                    request.method,
                    request.path,
                    err.details()
                );
                self.record_breaker_error().await;
                self.send_frame(Frame::Response(self.error_response(
                    &request.id,
                    class,
                    &err.details(),
                )));
            }
        }
    }

    async fn forward_with_retries(
        &self,
        request: &RequestPayload,
    ) -> Result<ResponsePayload, ForwardError> {
        let mut attempt: u32 = 0;
        loop {
            match self.attempt_once(request, attempt).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let class = err.class();
                    if !class.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = retry_delay(class, attempt);
                    debug!(
                        "Retry {} for {} {} in {:?} ({})",
                        attempt,
                        request.method,
                        request.path,
                        delay,
                        class.error_type()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        request: &RequestPayload,
        attempt: u32,
    ) -> Result<ResponsePayload, ForwardError> {
        // Probe on the first attempt, and again once retries suggest the
        // origin may have gone away mid-request.
        if attempt == 0 || attempt >= HEALTH_RECHECK_RETRY {
            let healthy = self.health.lock().await.check().await;
            if !healthy {
                return Err(ForwardError::Unhealthy);
            }
        }
        self.dial(request, attempt).await
    }

    async fn dial(
        &self,
        request: &RequestPayload,
        attempt: u32,
    ) -> Result<ResponsePayload, ForwardError> {
        let client = self.origin_client().await?;

        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ForwardError::Setup(format!("Invalid HTTP method '{}'", request.method)))?;
        let body_len = request.body.as_ref().map(|b| b.len()).unwrap_or(0);
        let timeout = adaptive_timeout(
            self.config.request_timeout,
            &request.method,
            &request.path,
            attempt,
            body_len,
        );

        let url = format!("{}{}", self.config.origin_base(), request.path);
        let mut builder = client.request(method, &url).timeout(timeout);
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

        let response = builder.send().await.map_err(ForwardError::Http)?;

        let status = response.status().as_u16();
        let mut headers = flatten_headers(response.headers());
        let bytes = response.bytes().await.map_err(ForwardError::Http)?;

        let content_type = headers.get("content-type").cloned().unwrap_or_default();
        let content_encoding = headers.get("content-encoding").cloned();
        let encoded = encode_body(&bytes, &content_type, content_encoding.as_deref());
        if encoded.strip_encoding_headers {
            headers.remove("content-encoding");
            headers.remove("content-length");
        }

        debug!(
            "Origin answered {} {} with status {} ({} body bytes)",
            request.method,
            request.path,
            status,
            bytes.len()
        );

        Ok(ResponsePayload {
            id: request.id.clone(),
            status,
            headers,
            body: encoded.body,
            is_base64: encoded.is_base64,
        })
    }

    /// Origin HTTP client, built lazily so unreadable TLS files fail the
    /// request rather than session construction. Shares its construction
    /// with the health prober so both agree on TLS settings.
    pub(crate) async fn origin_client(&self) -> Result<&reqwest::Client, ForwardError> {
        self.client
            .get_or_try_init(|| async {
                crate::origin::build_client(&self.config)
                    .await
                    .map_err(ForwardError::Setup)
            })
            .await
    }

    pub(crate) fn send_frame(&self, frame: Frame) {
        if self.outbound.send(frame).is_err() {
            debug!("Outbound channel closed, dropping frame");
        }
    }

    pub(crate) fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn record_breaker_error(&self) {
        if let Some(BreakerTransition::Opened { consecutive_errors }) =
            self.breaker.lock().await.record_error()
        {
            self.emit(TunnelEvent::CircuitBreakerOpen {
                consecutive_errors,
                cooldown: BREAKER_COOLDOWN,
            });
        }
    }

    pub(crate) async fn record_breaker_success(&self) {
        if let Some(BreakerTransition::Closed) = self.breaker.lock().await.record_success() {
            self.emit(TunnelEvent::CircuitBreakerClosed);
        }
    }

    /// Synthesized 503 while the breaker is open; the origin is not dialled.
    fn circuit_open_response(&self, request_id: &str) -> ResponsePayload {
        let retry_after = BREAKER_COOLDOWN.as_secs();
        let body = serde_json::json!({
            "error": "Local server is temporarily unavailable",
            "errorType": "circuit-breaker-open",
            "requestId": request_id,
            "retryAfterSeconds": retry_after,
            "timestamp": now_millis(),
        });

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert(
            "X-Error-Type".to_string(),
            "circuit-breaker-open".to_string(),
        );
        headers.insert("Retry-After".to_string(), retry_after.to_string());

        ResponsePayload {
            id: request_id.to_string(),
            status: 503,
            headers,
            body: body.to_string(),
            is_base64: false,
        }
    }

    /// Synthesized error response after retry exhaustion or a
    /// non-retryable failure.
    pub(crate) fn error_response(
        &self,
        request_id: &str,
        class: ErrorClass,
        details: &str,
    ) -> ResponsePayload {
        let local_server = self.config.origin_authority();
        let body = serde_json::json!({
            "error": class.message(),
            "errorType": class.error_type(),
            "requestId": request_id,
            "localServer": local_server,
            "timestamp": now_millis(),
            "details": details,
        });

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("X-Error-Type".to_string(), class.error_type().to_string());
        headers.insert("X-Local-Server".to_string(), local_server);

        ResponsePayload {
            id: request_id.to_string(),
            status: class.status(),
            headers,
            body: body.to_string(),
            is_base64: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASE: Duration = Duration::from_millis(15_000);

    #[test]
    fn test_adaptive_timeout_api_get_capped() {
        assert_eq!(
            adaptive_timeout(BASE, "GET", "/api/users", 0, 0),
            Duration::from_millis(15_000)
        );
        assert_eq!(
            adaptive_timeout(Duration::from_millis(90_000), "GET", "/api/users", 0, 0),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn test_adaptive_timeout_write_methods_doubled() {
        assert_eq!(
            adaptive_timeout(BASE, "POST", "/submit", 0, 0),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            adaptive_timeout(BASE, "GET", "/upload/file", 0, 0),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            adaptive_timeout(Duration::from_millis(100_000), "PUT", "/x", 0, 0),
            Duration::from_millis(180_000)
        );
    }

    #[test]
    fn test_adaptive_timeout_grows_with_retries() {
        assert_eq!(
            adaptive_timeout(BASE, "GET", "/page", 1, 0),
            Duration::from_millis(22_500)
        );
        assert_eq!(
            adaptive_timeout(BASE, "GET", "/page", 2, 0),
            Duration::from_millis(33_750)
        );
        // Capped at one minute regardless of retry count.
        assert_eq!(
            adaptive_timeout(BASE, "GET", "/page", 10, 0),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn test_adaptive_timeout_large_body_multiplier() {
        // 250 KB body: factor 1.5.
        assert_eq!(
            adaptive_timeout(BASE, "GET", "/page", 0, 250_000),
            Duration::from_millis(22_500)
        );
        // Factor is capped at 2.
        assert_eq!(
            adaptive_timeout(BASE, "GET", "/page", 0, 5_000_000),
            Duration::from_millis(30_000)
        );
        // Small bodies leave the timeout alone.
        assert_eq!(
            adaptive_timeout(BASE, "GET", "/page", 0, 10_000),
            Duration::from_millis(15_000)
        );
    }

    #[test]
    fn test_retry_delay_schedules() {
        assert_eq!(
            retry_delay(ErrorClass::ConnectionRefused, 1),
            Duration::from_millis(1000)
        );
        assert_eq!(
            retry_delay(ErrorClass::ConnectionRefused, 2),
            Duration::from_millis(2000)
        );
        assert_eq!(
            retry_delay(ErrorClass::ConnectionRefused, 4),
            Duration::from_millis(5000)
        );

        assert_eq!(retry_delay(ErrorClass::Timeout, 1), Duration::from_millis(2000));
        assert_eq!(retry_delay(ErrorClass::Timeout, 2), Duration::from_millis(3000));
        assert_eq!(retry_delay(ErrorClass::Timeout, 5), Duration::from_millis(8000));
    }

    #[test]
    fn test_error_class_mapping() {
        let cases = [
            (ErrorClass::Timeout, 504, "timeout"),
            (ErrorClass::ConnectionRefused, 502, "connection-refused"),
            (ErrorClass::HostNotFound, 502, "host-not-found"),
            (ErrorClass::ConnectionReset, 502, "connection-reset"),
            (ErrorClass::NetworkUnreachable, 502, "network-unreachable"),
            (ErrorClass::Other, 500, "unknown-error"),
        ];
        for (class, status, error_type) in cases {
            assert_eq!(class.status(), status);
            assert_eq!(class.error_type(), error_type);
        }
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(!ErrorClass::Other.is_retryable());
    }

    #[test]
    fn test_sse_detection() {
        let mut request = RequestPayload {
            id: "r1".to_string(),
            method: "GET".to_string(),
            path: "/events".to_string(),
            headers: HashMap::new(),
            body: None,
        };
        assert!(!is_sse_request(&request));

        request
            .headers
            .insert("Accept".to_string(), "text/event-stream".to_string());
        assert!(is_sse_request(&request));

        request.headers.clear();
        request.path = "/sse/updates".to_string();
        assert!(is_sse_request(&request));

        request.path = "/plain".to_string();
        request
            .headers
            .insert("Cache-Control".to_string(), "no-cache".to_string());
        assert!(is_sse_request(&request));

        request
            .headers
            .insert("Cache-Control".to_string(), "max-age=0".to_string());
        assert!(!is_sse_request(&request));
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_encode_body_plain_text() {
        let encoded = encode_body(b"hello", "text/plain", None);
        assert_eq!(encoded.body, "hello");
        assert!(!encoded.is_base64);
        assert!(!encoded.strip_encoding_headers);
    }

    #[test]
    fn test_encode_body_binary_content_type() {
        let png = [0x89u8, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        let encoded = encode_body(&png, "image/png", None);
        assert!(encoded.is_base64);
        assert_eq!(encoded.body, BASE64.encode(png));

        // Binary wins even when compressed.
        let encoded = encode_body(&png, "application/pdf", Some("gzip"));
        assert!(encoded.is_base64);
        assert!(!encoded.strip_encoding_headers);
    }

    #[test]
    fn test_encode_body_gzip_text_decompressed() {
        let html = "<html><body>héllo</body></html>";
        let encoded = encode_body(&gzip(html.as_bytes()), "text/html; charset=utf-8", Some("gzip"));

        assert_eq!(encoded.body, html);
        assert!(!encoded.is_base64);
        assert!(encoded.strip_encoding_headers);
    }

    #[test]
    fn test_encode_body_gzip_nontext_base64() {
        let compressed = gzip(b"opaque");
        let encoded = encode_body(&compressed, "application/wasm", Some("gzip"));

        assert_eq!(encoded.body, BASE64.encode(&compressed));
        assert!(encoded.is_base64);
        assert!(!encoded.strip_encoding_headers);
    }

    #[test]
    fn test_encode_body_unknown_encoding_base64() {
        let encoded = encode_body(b"mystery", "text/plain", Some("zstd"));
        assert!(encoded.is_base64);
        assert!(!encoded.strip_encoding_headers);
    }

    #[test]
    fn test_encode_body_corrupt_gzip_falls_back() {
        let encoded = encode_body(b"definitely not gzip", "text/html", Some("gzip"));

        assert_eq!(encoded.body, BASE64.encode(b"definitely not gzip"));
        assert!(encoded.is_base64);
        // Headers keep describing the (still compressed) bytes.
        assert!(!encoded.strip_encoding_headers);
    }

    #[test]
    fn test_encode_body_brotli_text() {
        let mut compressed = Vec::new();
        {
            let mut writer =
                brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            writer.write_all(b"{\"ok\":true}").unwrap();
        }
        let encoded = encode_body(&compressed, "application/json", Some("br"));

        assert_eq!(encoded.body, "{\"ok\":true}");
        assert!(!encoded.is_base64);
        assert!(encoded.strip_encoding_headers);
    }

    #[test]
    fn test_flatten_headers_joins_repeats() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let flat = flatten_headers(&headers);
        assert_eq!(flat["set-cookie"], "a=1, b=2");
        assert_eq!(flat["content-type"], "text/plain");
    }

    #[test]
    fn test_parse_encoding_tokens() {
        assert_eq!(parse_encoding(None), Compression::None);
        assert_eq!(parse_encoding(Some("identity")), Compression::None);
        assert_eq!(parse_encoding(Some("gzip")), Compression::Gzip);
        assert_eq!(parse_encoding(Some("x-gzip")), Compression::Gzip);
        assert_eq!(parse_encoding(Some("BR")), Compression::Brotli);
        assert_eq!(parse_encoding(Some("deflate")), Compression::Deflate);
        assert_eq!(parse_encoding(Some("zstd")), Compression::Unknown);
        assert_eq!(parse_encoding(Some("gzip, br")), Compression::Unknown);
    }
}
