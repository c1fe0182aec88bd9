//! Health monitor: the background task that polls the backend.
//!
//! A [`HealthMonitor`] is configured once and spawned into a single tokio
//! task that owns the [`HealthTracker`]. Consumers talk to it through a
//! [`MonitorHandle`]: commands (re-check, connectivity, focus) go in over a
//! channel and [`HealthSnapshot`]s come out over a `watch` channel. Only
//! the task mutates state, and it never has more than one probe in flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use canto_core::{HealthOptions, HealthStatus};

use crate::checker::{HealthTracker, ProbeResult};
use crate::probe::HealthProbe;
use crate::progress::ProgressGate;
use crate::schedule::{jittered_delay, Jitter, RandomJitter};

/// Callback invoked when the debounced verdict flips.
pub type HealthCallback = Arc<dyn Fn(HealthStatus) -> BoxFuture + Send + Sync>;

/// Future returned by a [`HealthCallback`].
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Read-only view of the monitor published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Debounced verdict; the only signal that should drive a maintenance notice.
    pub is_down: bool,
    /// Last probe was bad or the client is offline.
    pub is_unhealthy: bool,
    /// A probe is in flight.
    pub is_fetching: bool,
    /// The client reported itself offline.
    pub net_offline: bool,
    /// Current number of consecutive passing probes.
    pub consecutive_oks: u32,
    /// Current number of consecutive failing probes.
    pub consecutive_failures: u32,
    /// Polling interval used while unhealthy, including backoff.
    pub current_down_interval_ms: u64,
    /// Result of the most recent completed probe.
    pub last_result: Option<ProbeResult>,
}

impl HealthSnapshot {
    fn capture(tracker: &HealthTracker, fetching: bool) -> Self {
        Self {
            is_down: tracker.is_down(),
            is_unhealthy: tracker.is_unhealthy(fetching),
            is_fetching: fetching,
            net_offline: tracker.net_offline(),
            consecutive_oks: tracker.consecutive_oks(),
            consecutive_failures: tracker.consecutive_failures(),
            current_down_interval_ms: tracker.current_down_interval().as_millis() as u64,
            last_result: tracker.last_result(),
        }
    }

    /// Verdict as a [`HealthStatus`].
    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_down(self.is_down)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Refetch,
    Online,
    Offline,
    Focus,
}

/// Configured, not yet running, backend health monitor.
pub struct HealthMonitor {
    options: HealthOptions,
    probe: Arc<dyn HealthProbe>,
    jitter: Box<dyn Jitter>,
    gate: Option<ProgressGate>,
    on_status_change: Option<HealthCallback>,
    start_offline: bool,
}

impl HealthMonitor {
    /// Create a monitor with entropy-seeded jitter.
    pub fn new(options: HealthOptions, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            options,
            probe,
            jitter: Box::new(RandomJitter::from_entropy()),
            gate: None,
            on_status_change: None,
            start_offline: false,
        }
    }

    /// Replace the jitter source.
    pub fn with_jitter(mut self, jitter: impl Jitter + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    /// Gate to suspend while the backend is down or the client offline.
    pub fn with_progress_gate(mut self, gate: ProgressGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Set a callback for verdict changes.
    pub fn with_callback(mut self, callback: HealthCallback) -> Self {
        self.on_status_change = Some(callback);
        self
    }

    /// Start in the offline state, as when the client boots without a network.
    pub fn start_offline(mut self, offline: bool) -> Self {
        self.start_offline = offline;
        self
    }

    /// Spawn the polling task. Must be called inside a tokio runtime.
    ///
    /// The first probe runs immediately.
    pub fn spawn(self) -> MonitorHandle {
        let mut tracker = HealthTracker::new(&self.options);
        if self.start_offline {
            tracker.assume_offline();
        }

        let (status_tx, status_rx) = watch::channel(HealthSnapshot::capture(&tracker, false));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor_loop = MonitorLoop {
            tracker,
            probe: self.probe,
            jitter: self.jitter,
            jitter_pct: self.options.jitter_pct,
            focus_refetch: self.options.focus_refetch,
            fetching: false,
            gate: self.gate,
            callback: self.on_status_change,
            status_tx,
        };
        monitor_loop.sync_gate();

        let task = tokio::spawn(monitor_loop.run(command_rx, shutdown_rx));

        info!(
            fail_threshold = self.options.fail_threshold,
            ok_threshold = self.options.ok_threshold,
            interval_up_ms = self.options.interval_up_ms,
            "health monitor started"
        );

        MonitorHandle {
            status: status_rx,
            commands: command_tx,
            shutdown_tx,
            task: Some(task),
        }
    }
}

/// Consumer side of a running monitor. Dropping it stops the monitor.
pub struct MonitorHandle {
    status: watch::Receiver<HealthSnapshot>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Latest published snapshot.
    pub fn snapshot(&self) -> HealthSnapshot {
        self.status.borrow().clone()
    }

    /// Whether the backend is considered down.
    pub fn is_down(&self) -> bool {
        self.status.borrow().is_down
    }

    pub fn is_unhealthy(&self) -> bool {
        self.status.borrow().is_unhealthy
    }

    pub fn is_fetching(&self) -> bool {
        self.status.borrow().is_fetching
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.status.clone()
    }

    /// Probe now instead of waiting for the timer. A no-op while a probe is
    /// already in flight.
    pub fn refetch(&self) {
        self.send(Command::Refetch);
    }

    /// Report client connectivity.
    pub fn set_online(&self, online: bool) {
        self.send(if online { Command::Online } else { Command::Offline });
    }

    /// Report that the client regained focus.
    pub fn focus(&self) {
        self.send(Command::Focus);
    }

    /// Stop the monitor and wait for its task to finish. A probe in flight
    /// is abandoned and its result never recorded, and a status callback
    /// still running is dropped.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("health monitor shut down");
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(?command, "health monitor no longer running");
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State owned by the polling task.
struct MonitorLoop {
    tracker: HealthTracker,
    probe: Arc<dyn HealthProbe>,
    jitter: Box<dyn Jitter>,
    jitter_pct: f64,
    focus_refetch: bool,
    fetching: bool,
    gate: Option<ProgressGate>,
    callback: Option<HealthCallback>,
    status_tx: watch::Sender<HealthSnapshot>,
}

impl MonitorLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!("health loop starting");

        'poll: loop {
            self.set_fetching(true);
            let probe = Arc::clone(&self.probe);
            let mut in_flight = probe.probe();

            let result = loop {
                tokio::select! {
                    result = &mut in_flight => break Some(result),
                    command = commands.recv() => match command {
                        Some(Command::Refetch | Command::Focus) => {
                            debug!("probe already in flight, ignoring re-check");
                        }
                        Some(command) => self.apply_connectivity(command),
                        None => break None,
                    },
                    _ = shutdown.changed() => break None,
                }
            };
            let Some(result) = result else {
                debug!("health loop stopping with a probe in flight, discarding it");
                break;
            };

            if !self.complete(result, &mut shutdown).await {
                debug!("health loop stopping during status callback");
                break;
            }

            let mut deadline = Instant::now() + self.next_delay();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    command = commands.recv() => match command {
                        Some(Command::Refetch) => {
                            debug!("manual re-check requested");
                            break;
                        }
                        Some(Command::Focus) if self.focus_refetch => {
                            debug!("focus regained, re-checking");
                            break;
                        }
                        Some(Command::Focus) => {}
                        Some(Command::Online) => {
                            self.apply_connectivity(Command::Online);
                            break;
                        }
                        Some(command) => {
                            self.apply_connectivity(command);
                            deadline = Instant::now() + self.next_delay();
                        }
                        None => break 'poll,
                    },
                    _ = shutdown.changed() => break 'poll,
                }
            }
        }

        debug!("health loop stopped");
    }

    /// Record a finished probe. Returns `false` if shutdown arrived while the
    /// status callback was still running.
    async fn complete(
        &mut self,
        result: ProbeResult,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let previous = self.tracker.status();
        let status = self.tracker.record(result, Instant::now());
        self.fetching = false;

        debug!(
            ?result,
            oks = self.tracker.consecutive_oks(),
            failures = self.tracker.consecutive_failures(),
            down_interval_ms = self.tracker.current_down_interval().as_millis() as u64,
            "health probe completed"
        );
        self.publish();

        if status != previous {
            if let Some(cb) = &self.callback {
                tokio::select! {
                    _ = cb(status) => {}
                    _ = shutdown.changed() => return false,
                }
            }
        }
        true
    }

    fn apply_connectivity(&mut self, command: Command) {
        match command {
            Command::Online => {
                info!("client back online");
                self.tracker.set_online();
            }
            Command::Offline => {
                warn!("client went offline");
                self.tracker.set_offline(Instant::now());
            }
            Command::Refetch | Command::Focus => return,
        }
        self.publish();
    }

    fn next_delay(&mut self) -> std::time::Duration {
        jittered_delay(self.tracker.next_interval(), self.jitter_pct, self.jitter.as_mut())
    }

    fn set_fetching(&mut self, fetching: bool) {
        self.fetching = fetching;
        self.publish();
    }

    fn publish(&self) {
        self.status_tx
            .send_replace(HealthSnapshot::capture(&self.tracker, self.fetching));
        self.sync_gate();
    }

    fn sync_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.set_suspended(self.tracker.progress_suspended());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::probe::ProbeFuture;
    use crate::schedule::NoJitter;

    /// Probe that replays a script, then repeats a fallback result.
    struct ScriptedProbe {
        script: Mutex<VecDeque<ProbeResult>>,
        fallback: ProbeResult,
        latency: Duration,
        calls: AtomicUsize,
        completed: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(script: &[ProbeResult], fallback: ProbeResult, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().copied().collect()),
                fallback,
                latency,
                calls: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn always(result: ProbeResult) -> Arc<Self> {
            Self::new(&[], result, Duration::ZERO)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl HealthProbe for ScriptedProbe {
        fn probe(&self) -> ProbeFuture<'_> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.completed.fetch_add(1, Ordering::SeqCst);
                let next = self.script.lock().unwrap().pop_front();
                next.unwrap_or(self.fallback)
            })
        }
    }

    fn test_options() -> HealthOptions {
        HealthOptions {
            ok_threshold: 2,
            fail_threshold: 2,
            interval_down_ms: 3_000,
            interval_up_ms: 60_000,
            sustained_down_ms: 10_000,
            sustained_up_ms: 5_000,
            down_backoff_factor: 1.6,
            down_backoff_max_ms: 60_000,
            jitter_pct: 0.0,
            offline_grace_ms: 10_000,
            focus_refetch: false,
            timeout_ms: 5_000,
        }
    }

    fn spawn(opts: HealthOptions, probe: Arc<ScriptedProbe>) -> MonitorHandle {
        HealthMonitor::new(opts, probe).with_jitter(NoJitter).spawn()
    }

    async fn wait_until(
        rx: &mut watch::Receiver<HealthSnapshot>,
        condition: impl FnMut(&HealthSnapshot) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(600), rx.wait_for(condition))
            .await
            .expect("condition not reached in time")
            .expect("monitor stopped");
    }

    fn recorder() -> (HealthCallback, Arc<Mutex<Vec<HealthStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: HealthCallback = Arc::new(move |status: HealthStatus| -> BoxFuture {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(status);
            })
        });
        (callback, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn first_probe_runs_immediately() {
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let handle = spawn(test_options(), probe.clone());
        let mut rx = handle.subscribe();

        wait_until(&mut rx, |s| s.last_result.is_some()).await;
        assert_eq!(probe.calls(), 1);
        assert!(!handle.is_down());
        assert!(!handle.is_unhealthy());
        assert!(!handle.is_fetching());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_backend_polls_at_up_interval() {
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let handle = spawn(test_options(), probe.clone());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(probe.calls(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(probe.calls(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_failures_mark_down_and_suspend_progress() {
        let probe = ScriptedProbe::always(ProbeResult::Failed);
        let gate = ProgressGate::new("/health");
        let (callback, seen) = recorder();
        let start = Instant::now();

        let handle = HealthMonitor::new(test_options(), probe.clone())
            .with_jitter(NoJitter)
            .with_progress_gate(gate.clone())
            .with_callback(callback)
            .spawn();
        let mut rx = handle.subscribe();

        wait_until(&mut rx, |s| s.is_down).await;
        // Fails at 0s, 4.8s (backed off from 3s) and 12.48s.
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(probe.calls(), 3);
        assert!(gate.is_suspended());
        assert_eq!(*seen.lock().unwrap(), vec![HealthStatus::Down]);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.consecutive_failures, 3);
        assert_eq!(snapshot.current_down_interval_ms, 12_288);
        assert!(snapshot.is_unhealthy);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_sustained_oks() {
        let probe = ScriptedProbe::new(
            &[ProbeResult::Failed, ProbeResult::Failed, ProbeResult::Failed],
            ProbeResult::Healthy,
            Duration::ZERO,
        );
        let gate = ProgressGate::new("/health");
        let (callback, seen) = recorder();
        let handle = HealthMonitor::new(test_options(), probe.clone())
            .with_jitter(NoJitter)
            .with_progress_gate(gate.clone())
            .with_callback(callback)
            .spawn();
        let mut rx = handle.subscribe();

        wait_until(&mut rx, |s| s.is_down).await;
        let down_at = Instant::now();

        wait_until(&mut rx, |s| !s.is_down).await;
        // First ok at +12.288s, then two more at the 3s base interval.
        let recovery = down_at.elapsed();
        assert!(recovery >= Duration::from_millis(18_288), "{recovery:?}");
        assert!(recovery < Duration::from_secs(19), "{recovery:?}");
        assert_eq!(probe.calls(), 6);
        assert!(!gate.is_suspended());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![HealthStatus::Down, HealthStatus::Up]
        );
        assert_eq!(handle.snapshot().current_down_interval_ms, 3_000);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_while_in_flight_is_deduplicated() {
        let probe = ScriptedProbe::new(&[], ProbeResult::Healthy, Duration::from_secs(1));
        let handle = spawn(test_options(), probe.clone());
        let mut rx = handle.subscribe();

        wait_until(&mut rx, |s| s.is_fetching).await;
        handle.refetch();
        handle.refetch();
        handle.refetch();
        wait_until(&mut rx, |s| !s.is_fetching && s.last_result.is_some()).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(probe.calls(), 1);

        // Idle: a refetch starts exactly one new probe.
        handle.refetch();
        wait_until(&mut rx, |s| s.is_fetching).await;
        wait_until(&mut rx, |s| !s.is_fetching).await;
        assert_eq!(probe.calls(), 2);
        assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_in_flight_probe() {
        let probe = ScriptedProbe::new(&[], ProbeResult::Failed, Duration::from_secs(10));
        let handle = spawn(test_options(), probe.clone());
        let mut rx = handle.subscribe();

        wait_until(&mut rx, |s| s.is_fetching).await;
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let last = rx.borrow().clone();
        assert_eq!(last.last_result, None);
        assert_eq!(last.consecutive_failures, 0);
        assert_eq!(probe.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_polling() {
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let handle = spawn(test_options(), probe.clone());
        let mut rx = handle.subscribe();
        wait_until(&mut rx, |s| s.last_result.is_some()).await;

        drop(handle);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_grace_defers_down_verdict() {
        let probe = ScriptedProbe::new(&[ProbeResult::Healthy], ProbeResult::Failed, Duration::ZERO);
        let opts = HealthOptions {
            interval_down_ms: 1_000,
            down_backoff_factor: 1.0,
            sustained_down_ms: 1_000,
            ..test_options()
        };
        let gate = ProgressGate::new("/health");
        let handle = HealthMonitor::new(opts, probe.clone())
            .with_jitter(NoJitter)
            .with_progress_gate(gate.clone())
            .spawn();
        let mut rx = handle.subscribe();
        wait_until(&mut rx, |s| s.last_result.is_some()).await;

        let offline_at = Instant::now();
        handle.set_online(false);
        wait_until(&mut rx, |s| s.net_offline).await;
        assert!(gate.is_suspended());
        assert!(handle.is_unhealthy());
        assert!(!handle.is_down());

        wait_until(&mut rx, |s| s.is_down).await;
        assert!(offline_at.elapsed() >= Duration::from_secs(10));
        assert!(handle.snapshot().consecutive_failures >= 10);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn starting_offline_blocks_until_reconnect() {
        let probe = ScriptedProbe::always(ProbeResult::Failed);
        let opts = HealthOptions {
            sustained_down_ms: 1_000,
            ..test_options()
        };
        let handle = HealthMonitor::new(opts, probe.clone())
            .with_jitter(NoJitter)
            .start_offline(true)
            .spawn();
        let mut rx = handle.subscribe();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!handle.is_down());
        assert!(handle.snapshot().net_offline);
        let calls_before = probe.calls();
        assert!(calls_before >= 3);

        // Reconnect probes straight away and the kept fail streak flips down.
        let online_at = Instant::now();
        handle.set_online(true);
        wait_until(&mut rx, |s| s.is_down).await;
        assert!(online_at.elapsed() < Duration::from_secs(1));
        assert_eq!(probe.calls(), calls_before + 1);
        assert!(!handle.snapshot().net_offline);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn focus_only_refetches_when_enabled() {
        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let handle = spawn(test_options(), probe.clone());
        let mut rx = handle.subscribe();
        wait_until(&mut rx, |s| s.last_result.is_some()).await;

        handle.focus();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.calls(), 1);
        handle.shutdown().await;

        let probe = ScriptedProbe::always(ProbeResult::Healthy);
        let opts = HealthOptions {
            focus_refetch: true,
            ..test_options()
        };
        let handle = spawn(opts, probe.clone());
        let mut rx = handle.subscribe();
        wait_until(&mut rx, |s| s.last_result.is_some()).await;

        handle.focus();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.calls(), 2);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_not_blocked_by_a_stalled_callback() {
        let probe = ScriptedProbe::always(ProbeResult::Failed);
        let opts = HealthOptions {
            fail_threshold: 1,
            sustained_down_ms: 0,
            ..test_options()
        };
        let stalled: HealthCallback =
            Arc::new(|_status: HealthStatus| -> BoxFuture { Box::pin(std::future::pending()) });
        let handle = HealthMonitor::new(opts, probe.clone())
            .with_jitter(NoJitter)
            .with_callback(stalled)
            .spawn();
        let mut rx = handle.subscribe();
        wait_until(&mut rx, |s| s.is_down).await;

        tokio::time::timeout(Duration::from_secs(60), handle.shutdown())
            .await
            .expect("shutdown waited on the status callback");
        assert_eq!(probe.calls(), 1);
    }
}
