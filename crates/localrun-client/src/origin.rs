//! HTTP client construction for the local origin
//!
//! The forwarder and the health prober talk to the same origin, so both
//! build their clients here and agree on what "reachable" means: same TLS
//! identity, same trust roots, same verification mode. Decompression is
//! off so the tunnel sees the origin's raw bytes and encoding headers.
//! TLS material is read from disk at build time; unreadable files surface
//! as errors at the call site, not at session construction.

use crate::config::TunnelConfig;

pub(crate) async fn build_client(config: &TunnelConfig) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder().no_gzip().no_brotli().no_deflate();

    let tls = &config.tls;
    if tls.allow_invalid_cert {
        builder = builder.danger_accept_invalid_certs(true);
    } else if tls.use_tls {
        if let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) {
            let mut pem = tokio::fs::read(cert_path).await.map_err(|e| {
                format!(
                    "Failed to read certificate {}: {}",
                    cert_path.display(),
                    e
                )
            })?;
            let key = tokio::fs::read(key_path)
                .await
                .map_err(|e| format!("Failed to read key {}: {}", key_path.display(), e))?;
            pem.extend_from_slice(&key);

            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| format!("Invalid client certificate: {}", e))?;
            builder = builder.identity(identity);

            if let Some(ca_path) = &tls.ca_path {
                let ca = tokio::fs::read(ca_path).await.map_err(|e| {
                    format!("Failed to read CA bundle {}: {}", ca_path.display(), e)
                })?;
                let ca_cert = reqwest::Certificate::from_pem(&ca)
                    .map_err(|e| format!("Invalid CA bundle: {}", e))?;
                builder = builder.add_root_certificate(ca_cert);
            }
        }
    }

    builder
        .build()
        .map_err(|e| format!("Failed to build origin client: {}", e))
}
