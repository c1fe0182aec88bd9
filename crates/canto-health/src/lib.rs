//! canto-health: backend health monitoring for Canto.
//!
//! Decides, from a noisy stream of probe results plus a client
//! connectivity signal, whether the backend should be treated as down.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor::spawn() → MonitorHandle
//!   └── single polling task
//!       ├── HealthProbe::probe() → ProbeResult   (one in flight at most)
//!       ├── HealthTracker::record()              (streaks, backoff, verdict)
//!       ├── jittered_delay()                     (next wake-up)
//!       └── ProgressGate::set_suspended()        (down || offline)
//! ```
//!
//! # Debouncing
//!
//! The backend is declared down only after `fail_threshold` consecutive
//! failures spanning at least `sustained_down_ms`, and never inside the
//! offline grace window. Recovery is symmetric with `ok_threshold` and
//! `sustained_up_ms`. While unhealthy the probe interval backs off
//! geometrically up to `down_backoff_max_ms`; a single online success
//! resets it.

pub mod checker;
pub mod monitor;
pub mod probe;
pub mod progress;
pub mod schedule;

pub use checker::{HealthTracker, ProbeResult};
pub use monitor::{BoxFuture, HealthCallback, HealthMonitor, HealthSnapshot, MonitorHandle};
pub use probe::{HealthProbe, HttpProbe, ProbeError};
pub use progress::{ProgressGate, ProgressGuard, RequestMeta};
pub use schedule::{Jitter, NoJitter, RandomJitter};
