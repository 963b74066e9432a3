//! localrun client library - Public API
//!
//! Registers with a tunnel broker, receives HTTP requests over a single
//! persistent WebSocket, forwards them to a local origin server, and
//! returns the responses on the same socket.
//!
//! ```no_run
//! use localrun_client::{Tunnel, TunnelConfig, TunnelEvent};
//!
//! # async fn run() -> Result<(), localrun_client::TunnelError> {
//! let config = TunnelConfig::builder(3000).build()?;
//! let mut tunnel = Tunnel::open(config).await?;
//! println!("public url: {}", tunnel.url());
//!
//! while let Some(event) = tunnel.next_event().await {
//!     if let TunnelEvent::Request { method, path, .. } = event {
//!         println!("{} {}", method, path);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod forwarder;
pub mod health;
pub(crate) mod origin;
pub mod session;
pub mod sse;

pub use broker::TunnelInfo;
pub use config::{ConfigError, TlsOptions, TunnelConfig, DEFAULT_BROKER_URL};
pub use forwarder::{ErrorClass, Forwarder};
pub use health::{BreakerTransition, CircuitBreaker, HealthProber};

use localrun_proto::{ChunkAssembler, Frame};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// How long `graceful_shutdown` waits for in-flight chunk assemblies.
pub const GRACEFUL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunnel errors surfaced from `open()`.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registration failed: {0}")]
    Registration(String),
}

/// Everything observable about a running tunnel.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The tunnel (re)connected and is reachable at this URL.
    Url(String),
    /// A request arrived from the broker.
    Request {
        method: String,
        path: String,
        headers: HashMap<String, String>,
    },
    /// A non-fatal or fatal session error.
    Error(String),
    /// Forwarding is suspended after repeated origin failures.
    CircuitBreakerOpen {
        consecutive_errors: u32,
        cooldown: Duration,
    },
    /// Forwarding resumed.
    CircuitBreakerClosed,
    /// The session reached its terminal state. Emitted exactly once.
    Closed,
}

/// Handle to a live tunnel session.
#[derive(Debug)]
pub struct Tunnel {
    info: TunnelInfo,
    events: mpsc::UnboundedReceiver<TunnelEvent>,
    closed_tx: watch::Sender<bool>,
    assembler: Arc<StdMutex<ChunkAssembler>>,
    _join: JoinHandle<()>,
}

impl Tunnel {
    /// Register with the broker and start the session. Registration is a
    /// single attempt; failures surface here rather than being retried.
    pub async fn open(config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;

        let info = broker::register(&config).await?;
        let ws_url = broker::websocket_url(&config.broker_url, &info.id)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Frame>();
        let (closed_tx, closed_rx) = watch::channel(false);
        let assembler = Arc::new(StdMutex::new(ChunkAssembler::new()));

        let health = Arc::new(Mutex::new(HealthProber::new(&config)));
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new()));
        let forwarder = Arc::new(Forwarder::new(
            config,
            health,
            breaker,
            frame_tx.clone(),
            event_tx.clone(),
        ));

        let session = session::Session {
            info: info.clone(),
            ws_url,
            events: event_tx,
            closed: closed_rx,
            assembler: assembler.clone(),
            forwarder,
            frame_rx,
            frame_tx,
        };
        let join = tokio::spawn(session.run());

        Ok(Self {
            info,
            events: event_rx,
            closed_tx,
            assembler,
            _join: join,
        })
    }

    /// Broker-assigned identity of this tunnel.
    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    /// Publicly reachable URL.
    pub fn url(&self) -> &str {
        &self.info.url
    }

    /// Next observable event; `None` once the session has fully wound down.
    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        self.events.recv().await
    }

    /// Stop the session. Idempotent: repeated calls are no-ops and exactly
    /// one [`TunnelEvent::Closed`] is emitted.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    /// Wait up to [`GRACEFUL_DRAIN_TIMEOUT`] for in-flight chunk
    /// assemblies to drain, then close.
    pub async fn graceful_shutdown(&self) {
        let deadline = Instant::now() + GRACEFUL_DRAIN_TIMEOUT;
        loop {
            if self.assembler.lock().unwrap().is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                debug!("Graceful shutdown drain timed out");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.close();
    }

    /// Drain events until the session ends.
    pub async fn wait(mut self) {
        while self.events.recv().await.is_some() {}
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        // A dropped handle must not leave the session task running.
        let _ = self.closed_tx.send(true);
    }
}
