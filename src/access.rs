//! Accept-time admission policy: network allow-list and per-IP rate windows

use ipnetwork::IpNetwork;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::AccessConfig;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("invalid network range '{0}': {1}")]
    InvalidNetwork(String, ipnetwork::IpNetworkError),
}

/// Sliding-window limits applied per source IP
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub threshold: usize,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            threshold: 100,
        }
    }
}

pub struct AccessGate {
    allowed: Vec<IpNetwork>,
    policy: RateLimitPolicy,
    windows: HashMap<IpAddr, VecDeque<Instant>>,
}

impl AccessGate {
    pub fn new(allowed: Vec<IpNetwork>, policy: RateLimitPolicy) -> Self {
        Self {
            allowed,
            policy,
            windows: HashMap::new(),
        }
    }

    pub fn from_config(config: &AccessConfig) -> Result<Self, AccessError> {
        let allowed = config
            .allowed_networks
            .iter()
            .map(|net| {
                net.trim()
                    .parse::<IpNetwork>()
                    .map_err(|e| AccessError::InvalidNetwork(net.clone(), e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let policy = RateLimitPolicy {
            window: Duration::from_secs(config.rate_limit_window_secs),
            threshold: config.rate_limit_threshold,
        };

        Ok(Self::new(allowed, policy))
    }

    /// True iff `ip` falls inside at least one allowed network
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.allowed.iter().any(|net| net.contains(ip))
    }

    pub fn rate_limit_exceeded(&mut self, ip: IpAddr) -> bool {
        self.rate_limit_exceeded_at(ip, Instant::now())
    }

    /// Prunes the window for `ip`, then either refuses (at/over threshold,
    /// nothing recorded) or records `now` and admits.
    pub fn rate_limit_exceeded_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        let window = self.policy.window;
        let timestamps = self.windows.entry(ip.to_canonical()).or_default();
        prune(timestamps, now, window);

        if timestamps.len() >= self.policy.threshold {
            return true;
        }
        timestamps.push_back(now);
        false
    }

    /// Drops every IP with no admission inside the window. Returns how many went.
    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let window = self.policy.window;
        let before = self.windows.len();
        self.windows.retain(|_, timestamps| {
            prune(timestamps, now, window);
            !timestamps.is_empty()
        });
        let evicted = before - self.windows.len();
        if evicted > 0 {
            debug!("Evicted {} idle rate windows, {} still tracked", evicted, self.tracked_ips());
        }
        evicted
    }

    pub fn tracked_ips(&self) -> usize {
        self.windows.len()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
