//! Broker registration
//!
//! One HTTP exchange per session: ask the broker for a tunnel, get back the
//! public URL and the id used to derive the control WebSocket address.

use crate::config::TunnelConfig;
use crate::TunnelError;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Timeout for the registration call and the WebSocket handshake.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Tunnel identity assigned by the broker. Read-only after registration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TunnelInfo {
    /// Opaque tunnel id.
    pub id: String,
    /// Publicly reachable URL.
    pub url: String,
    /// Optional CDN-fronted URL.
    #[serde(default)]
    pub cached_url: Option<String>,
    /// Port the broker reports for this tunnel.
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct BrokerErrorBody {
    message: Option<String>,
}

/// Register with the broker: `POST {host}/api/tunnels` when a subdomain was
/// requested, `GET {host}/?new` otherwise. Not retried; a failure here
/// fails `open()`.
pub async fn register(config: &TunnelConfig) -> Result<TunnelInfo, TunnelError> {
    let client = reqwest::Client::builder()
        .timeout(REGISTER_TIMEOUT)
        .build()
        .map_err(|e| TunnelError::Registration(format!("Failed to build HTTP client: {}", e)))?;

    let host = config.broker_url.trim_end_matches('/');
    debug!("Registering with broker at {}", host);

    let response = match &config.subdomain {
        Some(subdomain) => {
            client
                .post(format!("{}/api/tunnels", host))
                .json(&serde_json::json!({ "subdomain": subdomain }))
                .send()
                .await
        }
        None => client.get(format!("{}/?new", host)).send().await,
    }
    .map_err(|e| TunnelError::Registration(format!("Broker unreachable: {}", e)))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let message = response
            .json::<BrokerErrorBody>()
            .await
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| format!("Broker returned status {}", status.as_u16()));
        return Err(TunnelError::Registration(message));
    }

    let info: TunnelInfo = response
        .json()
        .await
        .map_err(|e| TunnelError::Registration(format!("Invalid broker response: {}", e)))?;

    info!("Registered tunnel {} at {}", info.id, info.url);
    Ok(info)
}

/// Derive the control WebSocket URL from the broker base URL:
/// `https -> wss`, `http -> ws`, path `/api/tunnels/{id}/ws`.
pub fn websocket_url(broker_url: &str, tunnel_id: &str) -> Result<String, TunnelError> {
    let parsed = Url::parse(broker_url)
        .map_err(|e| TunnelError::Registration(format!("Invalid broker URL: {}", e)))?;

    let ws_scheme = match parsed.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(TunnelError::Registration(format!(
                "Unsupported broker URL scheme '{}'",
                other
            )))
        }
    };

    let host = parsed
        .host_str()
        .ok_or_else(|| TunnelError::Registration("Broker URL has no host".to_string()))?;

    let mut ws_url = format!("{}://{}", ws_scheme, host);
    if let Some(port) = parsed.port() {
        ws_url.push_str(&format!(":{}", port));
    }
    ws_url.push_str(parsed.path().trim_end_matches('/'));
    ws_url.push_str(&format!("/api/tunnels/{}/ws", tunnel_id));

    Ok(ws_url)
}
