//! Probe results and the debounced up/down transition rule.
//!
//! [`HealthTracker`] owns every piece of mutable monitor state. Probe
//! outcomes enter through [`HealthTracker::record`]; connectivity changes
//! enter through [`HealthTracker::set_offline`] / [`HealthTracker::set_online`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use canto_core::{HealthOptions, HealthStatus};

use crate::schedule::next_backoff;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    /// The backend answered and reported itself healthy.
    Healthy,
    /// The backend answered but did not report healthy.
    Unhealthy,
    /// The probe could not complete (connection error, timeout, non-2xx).
    Failed,
}

impl ProbeResult {
    /// Whether the backend reported itself healthy.
    pub fn is_ok(self) -> bool {
        self == ProbeResult::Healthy
    }

    /// Whether the probe never got a usable answer.
    pub fn is_network_error(self) -> bool {
        self == ProbeResult::Failed
    }
}

/// Streak counters, backoff interval and connectivity for one backend.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    /// Debounced verdict.
    down: bool,
    consecutive_oks: u32,
    consecutive_fails: u32,
    /// Start of the current ok streak.
    ok_since: Option<Instant>,
    /// Start of the current fail streak.
    fail_since: Option<Instant>,
    /// Live polling interval while unhealthy.
    current_down_interval: Duration,
    net_offline: bool,
    /// When the client went offline. `None` while offline means "since boot".
    offline_since: Option<Instant>,
    last_result: Option<ProbeResult>,

    ok_threshold: u32,
    fail_threshold: u32,
    interval_down: Duration,
    interval_up: Duration,
    sustained_down: Duration,
    sustained_up: Duration,
    backoff_factor: f64,
    backoff_max: Duration,
    offline_grace: Duration,
}

impl HealthTracker {
    /// Create a tracker in the `up` state.
    pub fn new(opts: &HealthOptions) -> Self {
        Self {
            down: false,
            consecutive_oks: 0,
            consecutive_fails: 0,
            ok_since: None,
            fail_since: None,
            current_down_interval: opts.interval_down(),
            net_offline: false,
            offline_since: None,
            last_result: None,

            ok_threshold: opts.ok_threshold,
            fail_threshold: opts.fail_threshold,
            interval_down: opts.interval_down(),
            interval_up: opts.interval_up(),
            sustained_down: opts.sustained_down(),
            sustained_up: opts.sustained_up(),
            backoff_factor: opts.down_backoff_factor,
            backoff_max: opts.down_backoff_max(),
            offline_grace: opts.offline_grace(),
        }
    }

    /// Record a completed probe at `now` and return the verdict.
    pub fn record(&mut self, result: ProbeResult, now: Instant) -> HealthStatus {
        self.last_result = Some(result);

        if result.is_ok() && !self.net_offline {
            self.consecutive_oks += 1;
            self.consecutive_fails = 0;
            let ok_since = *self.ok_since.get_or_insert(now);
            self.fail_since = None;

            self.current_down_interval = self.interval_down;

            if self.down
                && self.consecutive_oks >= self.ok_threshold
                && now.saturating_duration_since(ok_since) >= self.sustained_up
            {
                info!(
                    successes = self.consecutive_oks,
                    "backend recovered, marking up"
                );
                self.down = false;
            }
        } else {
            self.consecutive_oks = 0;
            self.consecutive_fails += 1;
            let fail_since = *self.fail_since.get_or_insert(now);
            self.ok_since = None;

            self.current_down_interval =
                next_backoff(self.current_down_interval, self.backoff_factor, self.backoff_max);

            let offline_blocking = self.offline_blocking(now);
            let sustained =
                now.saturating_duration_since(fail_since) >= self.sustained_down;

            if !self.down
                && !offline_blocking
                && self.consecutive_fails >= self.fail_threshold
                && sustained
            {
                warn!(
                    failures = self.consecutive_fails,
                    threshold = self.fail_threshold,
                    "backend marked down"
                );
                self.down = true;
            } else if offline_blocking && self.consecutive_fails >= self.fail_threshold {
                debug!(
                    failures = self.consecutive_fails,
                    "down transition suppressed inside offline grace window"
                );
            }
        }

        self.status()
    }

    /// The client lost connectivity.
    pub fn set_offline(&mut self, now: Instant) {
        self.net_offline = true;
        self.offline_since = Some(now);
    }

    /// Start out offline with no known start time. Down verdicts stay
    /// suppressed until connectivity is reported back.
    pub fn assume_offline(&mut self) {
        self.net_offline = true;
        self.offline_since = None;
    }

    /// The client regained connectivity. Backoff restarts from base.
    pub fn set_online(&mut self) {
        self.net_offline = false;
        self.offline_since = None;
        self.current_down_interval = self.interval_down;
    }

    fn offline_blocking(&self, now: Instant) -> bool {
        self.net_offline
            && self
                .offline_since
                .is_none_or(|since| now.saturating_duration_since(since) < self.offline_grace)
    }

    /// Whether the next probe should use the down cadence.
    pub fn is_bad(&self) -> bool {
        self.down
            || self.net_offline
            || !self.last_result.is_some_and(ProbeResult::is_ok)
    }

    /// Unjittered delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        if self.is_bad() {
            self.current_down_interval
        } else {
            self.interval_up
        }
    }

    /// Raw "last probe was bad" signal. Never true while a probe is in flight.
    pub fn is_unhealthy(&self, fetching: bool) -> bool {
        if fetching {
            return false;
        }
        if self.net_offline {
            return true;
        }
        self.last_result.is_some_and(|r| !r.is_ok())
    }

    /// Whether foreground progress indicators should be held back.
    pub fn progress_suspended(&self) -> bool {
        self.down || self.net_offline
    }

    /// Current health status.
    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_down(self.down)
    }

    /// Whether the backend is considered down.
    pub fn is_down(&self) -> bool {
        self.down
    }

    /// Whether the client is offline.
    pub fn net_offline(&self) -> bool {
        self.net_offline
    }

    /// Current number of consecutive passing probes.
    pub fn consecutive_oks(&self) -> u32 {
        self.consecutive_oks
    }

    /// Current number of consecutive failing probes.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_fails
    }

    /// Start of the current ok streak.
    pub fn ok_since(&self) -> Option<Instant> {
        self.ok_since
    }

    /// Start of the current fail streak.
    pub fn fail_since(&self) -> Option<Instant> {
        self.fail_since
    }

    /// Polling interval used while unhealthy, including backoff.
    pub fn current_down_interval(&self) -> Duration {
        self.current_down_interval
    }

    /// Result of the most recent completed probe.
    pub fn last_result(&self) -> Option<ProbeResult> {
        self.last_result
    }
}
