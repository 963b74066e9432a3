//! Origin health probing and the circuit breaker
//!
//! The prober answers "is the origin up?" from a short-lived cache so the
//! hot path rarely pays for a probe. The breaker counts consecutive
//! forwarding failures and short-circuits requests once the origin looks
//! dead, with a cooldown before traffic is let through again.

use crate::config::TunnelConfig;
use crate::origin;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How long one probe result stays valid.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(10);

/// Per-probe network timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive errors before the breaker opens.
pub const BREAKER_THRESHOLD: u32 = 5;

/// How long an open breaker stays open without new errors.
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Which path last produced a usable probe result. Sticky across checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePath {
    Health,
    Root,
}

impl ProbePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbePath::Health => "/health",
            ProbePath::Root => "/",
        }
    }
}

struct CachedHealth {
    healthy: bool,
    checked_at: Instant,
}

/// Cached reachability check against the origin. The probe client is
/// built like the forwarder's so a probe and a dial agree on TLS identity
/// and trust.
pub struct HealthProber {
    config: TunnelConfig,
    client: OnceCell<reqwest::Client>,
    cached: Option<CachedHealth>,
    probe_path: Option<ProbePath>,
}

impl HealthProber {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            config: config.clone(),
            client: OnceCell::new(),
            cached: None,
            probe_path: None,
        }
    }

    /// The sticky probe path, once one has produced a usable result.
    pub fn probe_path(&self) -> Option<ProbePath> {
        self.probe_path
    }

    /// Is the origin reachable? Served from cache within the TTL window.
    pub async fn check(&mut self) -> bool {
        if let Some(cached) = &self.cached {
            if cached.checked_at.elapsed() < HEALTH_CACHE_TTL {
                return cached.healthy;
            }
        }

        let healthy = self.probe().await;
        self.cached = Some(CachedHealth {
            healthy,
            checked_at: Instant::now(),
        });
        healthy
    }

    /// Forget the cached result so the next check hits the network.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    async fn probe(&mut self) -> bool {
        // A sticky root path means `/health` already proved unusable.
        if self.probe_path == Some(ProbePath::Root) {
            return self.probe_root().await;
        }

        match self.head(ProbePath::Health).await {
            Ok(status) if (200..300).contains(&status) => {
                self.probe_path = Some(ProbePath::Health);
                true
            }
            Ok(status) => {
                debug!("Health probe /health returned {}", status);
                if self.probe_path.is_none() {
                    self.probe_root().await
                } else {
                    false
                }
            }
            Err(e) => {
                debug!("Health probe /health failed: {}", e);
                self.probe_root().await
            }
        }
    }

    /// Fallback probe: anything below 500 means a server is listening.
    async fn probe_root(&mut self) -> bool {
        match self.head(ProbePath::Root).await {
            Ok(status) if (200..500).contains(&status) => {
                self.probe_path = Some(ProbePath::Root);
                true
            }
            Ok(status) => {
                debug!("Health probe / returned {}", status);
                false
            }
            Err(e) => {
                debug!("Health probe / failed: {}", e);
                false
            }
        }
    }

    async fn head(&self, path: ProbePath) -> Result<u16, String> {
        let client = self
            .client
            .get_or_try_init(|| origin::build_client(&self.config))
            .await?;
        let response = client
            .head(format!("{}{}", self.config.origin_base(), path.as_str()))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

/// Breaker transition worth telling the embedding program about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened { consecutive_errors: u32 },
    Closed,
}

/// Consecutive-failure gate in front of the origin.
#[derive(Default)]
pub struct CircuitBreaker {
    consecutive_errors: u32,
    last_error: Option<Instant>,
    open: bool,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Record one failed request. Returns the open transition when this
    /// error crosses the threshold.
    pub fn record_error(&mut self) -> Option<BreakerTransition> {
        self.consecutive_errors += 1;
        self.last_error = Some(Instant::now());

        if !self.open && self.consecutive_errors >= BREAKER_THRESHOLD {
            self.open = true;
            warn!(
                "Circuit breaker opened after {} consecutive errors",
                self.consecutive_errors
            );
            return Some(BreakerTransition::Opened {
                consecutive_errors: self.consecutive_errors,
            });
        }
        None
    }

    /// Record one successful request. Returns the close transition when the
    /// breaker had been open.
    pub fn record_success(&mut self) -> Option<BreakerTransition> {
        let was_open = self.open;
        self.consecutive_errors = 0;
        self.last_error = None;
        self.open = false;

        if was_open {
            debug!("Circuit breaker closed after successful request");
            Some(BreakerTransition::Closed)
        } else {
            None
        }
    }

    /// Whether requests should be short-circuited. Self-resets once the
    /// cooldown elapses without new errors.
    pub fn is_open(&mut self) -> bool {
        if self.open {
            if let Some(last_error) = self.last_error {
                if last_error.elapsed() > BREAKER_COOLDOWN {
                    debug!("Circuit breaker cooldown elapsed, resetting");
                    self.open = false;
                    self.consecutive_errors = 0;
                    self.last_error = None;
                }
            }
        }
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new();

        for _ in 0..4 {
            assert!(breaker.record_error().is_none());
            assert!(!breaker.is_open());
        }

        let transition = breaker.record_error();
        assert_eq!(
            transition,
            Some(BreakerTransition::Opened {
                consecutive_errors: 5
            })
        );
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_resets_breaker() {
        let mut breaker = CircuitBreaker::new();

        for _ in 0..5 {
            breaker.record_error();
        }
        assert!(breaker.is_open());

        assert_eq!(breaker.record_success(), Some(BreakerTransition::Closed));
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_errors(), 0);

        // Success while closed stays silent.
        assert!(breaker.record_success().is_none());
    }

    #[test]
    fn test_success_mid_streak_resets_count() {
        let mut breaker = CircuitBreaker::new();

        for _ in 0..4 {
            breaker.record_error();
        }
        breaker.record_success();

        for _ in 0..4 {
            assert!(breaker.record_error().is_none());
        }
        assert!(!breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_cooldown_self_reset() {
        let mut breaker = CircuitBreaker::new();

        for _ in 0..5 {
            breaker.record_error();
        }
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.is_open());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_errors(), 0);
    }
}
