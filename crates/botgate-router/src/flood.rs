//! Admission control for creating workers for new tokens, keyed by source address.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// At most `max_events` admissions per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodLimit {
    pub period: Duration,
    pub max_events: usize,
}

impl FloodLimit {
    pub const fn new(period: Duration, max_events: usize) -> Self {
        Self { period, max_events }
    }
}

/// 20 new workers a minute and 600 an hour per source address.
pub const DEFAULT_FLOOD_LIMITS: [FloodLimit; 2] = [
    FloodLimit::new(Duration::from_secs(60), 20),
    FloodLimit::new(Duration::from_secs(60 * 60), 600),
];

#[derive(Debug)]
struct Tier {
    limit: FloodLimit,
    // Admission times, oldest first. Only the newest `max_events` matter.
    events: VecDeque<Instant>,
}

impl Tier {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.events.front() {
            if now.saturating_duration_since(oldest) >= self.limit.period {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn wakeup_at(&self) -> Option<Instant> {
        let max = self.limit.max_events.max(1);
        if self.events.len() < max {
            return None;
        }
        Some(self.events[self.events.len() - max] + self.limit.period)
    }

    fn record(&mut self, now: Instant) {
        self.events.push_back(now);
        while self.events.len() > self.limit.max_events.max(1) {
            self.events.pop_front();
        }
    }
}

/// Limiter state for one key; every tier must admit an event.
#[derive(Debug)]
pub struct FloodControl {
    tiers: Vec<Tier>,
}

impl FloodControl {
    pub fn new(limits: &[FloodLimit]) -> Self {
        Self {
            tiers: limits
                .iter()
                .map(|&limit| Tier {
                    limit,
                    events: VecDeque::new(),
                })
                .collect(),
        }
    }

    /// Earliest instant at which a new event would be admitted, if it is currently blocked.
    pub fn wakeup_at(&self) -> Option<Instant> {
        self.tiers.iter().filter_map(Tier::wakeup_at).max()
    }

    /// Admits and records an event at `now`, or returns how long to wait. Rejected attempts are
    /// not recorded.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        for tier in &mut self.tiers {
            tier.prune(now);
        }
        if let Some(wakeup_at) = self.wakeup_at() {
            if wakeup_at > now {
                return Err(wakeup_at - now);
            }
        }
        for tier in &mut self.tiers {
            tier.record(now);
        }
        Ok(())
    }

    fn is_idle(&mut self, now: Instant) -> bool {
        self.tiers.iter_mut().all(|tier| {
            tier.prune(now);
            tier.events.is_empty()
        })
    }
}

/// Per-source-address limiter states, created lazily.
#[derive(Debug)]
pub struct FloodControlTable {
    limits: Vec<FloodLimit>,
    keys: HashMap<String, FloodControl>,
}

impl FloodControlTable {
    pub fn new(limits: Vec<FloodLimit>) -> Self {
        Self {
            limits,
            keys: HashMap::new(),
        }
    }

    /// Admits one worker creation for `key`, or returns the retry-after hint in whole seconds.
    pub fn admit(&mut self, key: &str, now: Instant) -> Result<(), u64> {
        let limits = &self.limits;
        let control = self
            .keys
            .entry(key.to_owned())
            .or_insert_with(|| FloodControl::new(limits));
        control.try_acquire(now).map_err(retry_after_secs)
    }

    /// Drops keys with no recorded event inside any window. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, control| !control.is_idle(now));
        before - self.keys.len()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Rounds a wait up to whole seconds, never below one.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

/// Canonicalizes a transport-reported source address into a flood-control key.
///
/// Ports, brackets and IPv6 scope qualifiers are stripped and IPv4-mapped IPv6 addresses are
/// folded into IPv4, so equivalent spellings share one limiter. Returns `None` for empty or
/// unparseable addresses, which bypass admission control.
pub fn normalize_peer_address(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr.ip().to_canonical().to_string());
    }
    let host = raw
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map_or(raw, |(host, _port)| host);
    let host = host.split_once('%').map_or(host, |(host, _scope)| host);
    host.parse::<IpAddr>()
        .ok()
        .map(|ip| ip.to_canonical().to_string())
}
