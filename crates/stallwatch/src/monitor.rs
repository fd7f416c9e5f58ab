//! Stall monitor: background polling thread and episode state machine.
//!
//! Every poll tick the monitor reads the probe's (phase, timestamp) pair
//! and feeds it to a [`StallDetector`].  A contiguous `Processing` span is
//! one *episode*; an episode that outlives the configured threshold is a
//! stall.  The detector classifies the stall the first tick it crosses the
//! threshold and emits exactly one [`StallEvent`] per episode when the
//! episode closes, carrying the full measured duration (the primary thread
//! timestamps its own transitions, so the recovery snapshot bounds the
//! episode precisely rather than to poll resolution).
//!
//! Detection resolution is bounded by the poll interval: a stall that both
//! starts and resolves between two ticks is never observed.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{RecvTimeoutError, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::MonotonicClock;
use crate::error::{ConfigError, Result};
use crate::probe::{EventLoopProbe, LoopPhase};

// =============================================================================
// Configuration
// =============================================================================

/// Stall monitor configuration.  Immutable for the monitor's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How often the monitor thread wakes to sample the probe (ms).
    pub poll_interval_ms: u64,
    /// A `Processing` span at least this long is a stall (ms).  Must be
    /// strictly greater than the poll interval.
    pub stall_threshold_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            stall_threshold_ms: 400,
        }
    }
}

impl MonitorConfig {
    /// Reject configurations that would trigger on a single sample.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.stall_threshold_ms <= self.poll_interval_ms {
            return Err(ConfigError::ThresholdNotAbovePoll {
                threshold_ms: self.stall_threshold_ms,
                poll_ms: self.poll_interval_ms,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }
}

// =============================================================================
// Stall events
// =============================================================================

/// One confirmed stall episode, emitted at most once per episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallEvent {
    /// Total time the primary thread spent in the episode's `Processing`
    /// span.
    pub duration: Duration,
    /// When the episode began, as an offset on the monitor's clock.
    pub episode_started: Duration,
    /// Whether the primary thread was observed to recover.  `false` only
    /// for an episode still open when the monitor was stopped.
    pub recovered: bool,
}

// =============================================================================
// Detector state machine
// =============================================================================

/// Detector state visible per poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// No episode open; the loop processed its previous iteration.
    Idle,
    /// Episode open, threshold not yet crossed.
    Watching,
    /// Episode open and past threshold; event pending episode closure.
    Stalled,
}

#[derive(Debug, Clone, Copy)]
struct Episode {
    started: Duration,
    stalled: bool,
}

/// Pure per-tick stall classification.
///
/// Owns no thread and reads no clock; the caller supplies each observation.
/// This is what the property tests drive directly.
#[derive(Debug)]
pub struct StallDetector {
    threshold: Duration,
    episode: Option<Episode>,
}

impl StallDetector {
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            episode: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> DetectorState {
        match self.episode {
            None => DetectorState::Idle,
            Some(Episode { stalled: false, .. }) => DetectorState::Watching,
            Some(Episode { stalled: true, .. }) => DetectorState::Stalled,
        }
    }

    /// Feed one (phase, timestamp) observation taken at `now`.
    ///
    /// Returns the closing event when an episode that crossed the threshold
    /// ends — either because the phase left `Processing`, or because the
    /// timestamp moved while the phase stayed `Processing` (the loop
    /// completed at least one full iteration between two ticks).
    pub fn observe(
        &mut self,
        phase: LoopPhase,
        stamp: Duration,
        now: Duration,
    ) -> Option<StallEvent> {
        if phase != LoopPhase::Processing {
            // The primary thread advanced; close any open episode.  For a
            // recovered episode the snapshot timestamp is the moment the
            // thread itself recorded leaving Processing, so the duration is
            // exact.
            return self.close(stamp, true);
        }

        match self.episode {
            Some(ref mut episode) if episode.started == stamp => {
                let elapsed = now.saturating_sub(stamp);
                if !episode.stalled && elapsed >= self.threshold {
                    episode.stalled = true;
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        threshold_ms = self.threshold.as_millis() as u64,
                        "primary thread stall in progress"
                    );
                }
                None
            }
            Some(_) => {
                // Same phase, new timestamp: an iteration boundary fell
                // between ticks.  Close the old episode and open a new one.
                let event = self.close(stamp, true);
                self.open(stamp, now);
                event
            }
            None => {
                self.open(stamp, now);
                None
            }
        }
    }

    /// Close any still-open episode at shutdown.  A stalled episode that
    /// never recovered is flushed with `recovered = false` and duration
    /// measured to `now`.
    pub fn finish(&mut self, now: Duration) -> Option<StallEvent> {
        self.close(now, false)
    }

    fn open(&mut self, stamp: Duration, now: Duration) {
        // The monitor may have started (or the episode rolled over) with
        // the threshold already exceeded.
        let stalled = now.saturating_sub(stamp) >= self.threshold;
        self.episode = Some(Episode {
            started: stamp,
            stalled,
        });
    }

    fn close(&mut self, end: Duration, recovered: bool) -> Option<StallEvent> {
        let episode = self.episode.take()?;
        if !episode.stalled {
            return None;
        }
        let event = StallEvent {
            duration: end.saturating_sub(episode.started),
            episode_started: episode.started,
            recovered,
        };
        debug!(
            duration_ms = event.duration.as_millis() as u64,
            recovered, "stall episode closed"
        );
        Some(event)
    }
}

// =============================================================================
// Monitor thread
// =============================================================================

/// Handle returned by [`spawn_monitor`] to control the polling thread.
///
/// Dropping the handle stops the monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signal the monitor to stop and wait for the thread to exit.  The
    /// stop signal is observed within one poll interval; a stalled episode
    /// still open at that point is flushed before the thread exits.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn the stall-monitor thread.
///
/// The monitor polls `probe` every `config.poll_interval_ms` and sends at
/// most one [`StallEvent`] per stall episode on `events`.  Sends never
/// block: if the consumer falls behind and the channel fills, the event is
/// dropped with a warning rather than delaying the next poll tick.  The
/// thread exits when the handle is stopped/dropped or when every receiver
/// of `events` is gone.
pub fn spawn_monitor(
    probe: Arc<EventLoopProbe>,
    clock: Arc<dyn MonotonicClock>,
    config: MonitorConfig,
    events: Sender<StallEvent>,
) -> Result<MonitorHandle> {
    config.validate()?;
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let poll = config.poll_interval();
    let threshold = config.stall_threshold();

    let thread = std::thread::Builder::new()
        .name("stallwatch-monitor".into())
        .spawn(move || {
            let mut detector = StallDetector::new(threshold);
            loop {
                match stop_rx.recv_timeout(poll) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                let (phase, stamp) = probe.snapshot();
                if let Some(event) = detector.observe(phase, stamp, clock.now()) {
                    if !deliver(&events, event) {
                        return;
                    }
                }
            }
            if let Some(event) = detector.finish(clock.now()) {
                deliver(&events, event);
            }
        })?;

    Ok(MonitorHandle {
        stop_tx,
        thread: Some(thread),
    })
}

/// Non-blocking event delivery.  Returns `false` when the consumer is gone.
fn deliver(events: &Sender<StallEvent>, event: StallEvent) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            warn!(
                duration_ms = event.duration.as_millis() as u64,
                "stall event dropped: reporter queue full"
            );
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    const MS: Duration = Duration::from_millis(1);

    fn detector() -> StallDetector {
        StallDetector::new(200 * MS)
    }

    #[test]
    fn default_config_is_valid() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.stall_threshold_ms, 400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn threshold_equal_to_poll_is_rejected() {
        let config = MonitorConfig {
            poll_interval_ms: 50,
            stall_threshold_ms: 50,
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ThresholdNotAbovePoll {
                threshold_ms: 50,
                poll_ms: 50,
            })
        );
    }

    #[test]
    fn threshold_below_poll_is_rejected() {
        let config = MonitorConfig {
            poll_interval_ms: 100,
            stall_threshold_ms: 50,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = MonitorConfig {
            poll_interval_ms: 0,
            stall_threshold_ms: 400,
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroPollInterval));
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = MonitorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: MonitorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.poll_interval_ms, config.poll_interval_ms);
        assert_eq!(parsed.stall_threshold_ms, config.stall_threshold_ms);
    }

    #[test]
    fn idle_phases_produce_nothing() {
        let mut det = detector();
        for tick in 0..100_u64 {
            let now = Duration::from_millis(tick * 50);
            assert_eq!(det.observe(LoopPhase::BeforeIteration, now, now), None);
            assert_eq!(det.state(), DetectorState::Idle);
        }
    }

    #[test]
    fn short_span_never_reports() {
        let mut det = detector();
        // Processing for 100 ms, under the 200 ms threshold.
        assert_eq!(det.observe(LoopPhase::Processing, 0 * MS, 50 * MS), None);
        assert_eq!(det.state(), DetectorState::Watching);
        assert_eq!(det.observe(LoopPhase::Processing, 0 * MS, 100 * MS), None);
        assert_eq!(
            det.observe(LoopPhase::AfterIteration, 100 * MS, 150 * MS),
            None
        );
        assert_eq!(det.state(), DetectorState::Idle);
    }

    #[test]
    fn crossing_classifies_then_recovery_reports_exact_duration() {
        let mut det = detector();
        assert_eq!(det.observe(LoopPhase::Processing, 0 * MS, 50 * MS), None);
        assert_eq!(det.observe(LoopPhase::Processing, 0 * MS, 250 * MS), None);
        assert_eq!(det.state(), DetectorState::Stalled);

        // The loop recovered at t=500 (its own timestamp), observed at 510.
        let event = det
            .observe(LoopPhase::AfterIteration, 500 * MS, 510 * MS)
            .expect("episode must close with a report");
        assert_eq!(event.duration, 500 * MS);
        assert_eq!(event.episode_started, Duration::ZERO);
        assert!(event.recovered);
        assert_eq!(det.state(), DetectorState::Idle);
    }

    #[test]
    fn stalled_episode_reports_only_once() {
        let mut det = detector();
        det.observe(LoopPhase::Processing, 0 * MS, 250 * MS);
        // Many more ticks while still stalled: nothing is emitted.
        for tick in 6..20_u64 {
            assert_eq!(
                det.observe(LoopPhase::Processing, 0 * MS, Duration::from_millis(tick * 50)),
                None
            );
        }
        assert!(
            det.observe(LoopPhase::BeforeIteration, 1000 * MS, 1010 * MS)
                .is_some()
        );
        // Idle ticks after closure stay quiet.
        assert_eq!(
            det.observe(LoopPhase::BeforeIteration, 1000 * MS, 1060 * MS),
            None
        );
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let mut det = detector();
        det.observe(LoopPhase::Processing, 0 * MS, 200 * MS);
        assert_eq!(det.state(), DetectorState::Stalled);
    }

    #[test]
    fn timestamp_change_while_processing_closes_episode() {
        let mut det = detector();
        det.observe(LoopPhase::Processing, 0 * MS, 250 * MS);
        assert_eq!(det.state(), DetectorState::Stalled);

        // Next tick the phase is still Processing but with a new timestamp:
        // the loop finished an iteration and started another between polls.
        let event = det
            .observe(LoopPhase::Processing, 400 * MS, 450 * MS)
            .expect("old episode must close");
        assert_eq!(event.duration, 400 * MS);
        assert!(event.recovered);
        // And a fresh episode is already open.
        assert_eq!(det.state(), DetectorState::Watching);
    }

    #[test]
    fn monitor_started_mid_stall_classifies_immediately() {
        let mut det = detector();
        // First observation is already 300 ms into a Processing span.
        det.observe(LoopPhase::Processing, 0 * MS, 300 * MS);
        assert_eq!(det.state(), DetectorState::Stalled);
        let event = det
            .observe(LoopPhase::AfterIteration, 350 * MS, 360 * MS)
            .unwrap();
        assert_eq!(event.duration, 350 * MS);
    }

    #[test]
    fn finish_flushes_unrecovered_stall() {
        let mut det = detector();
        det.observe(LoopPhase::Processing, 100 * MS, 400 * MS);
        let event = det.finish(700 * MS).expect("open stall must flush");
        assert_eq!(event.duration, 600 * MS);
        assert!(!event.recovered);
        assert_eq!(det.state(), DetectorState::Idle);
    }

    #[test]
    fn finish_without_stall_is_quiet() {
        let mut det = detector();
        assert_eq!(det.finish(100 * MS), None);
        det.observe(LoopPhase::Processing, 0 * MS, 50 * MS);
        assert_eq!(det.finish(100 * MS), None, "sub-threshold span must not flush");
    }

    #[test]
    fn spawned_monitor_reports_over_channel() {
        let clock: Arc<dyn MonotonicClock> = Arc::new(SystemClock::new());
        let probe = Arc::new(EventLoopProbe::new(Arc::clone(&clock)));
        let (tx, rx) = bounded(8);
        let config = MonitorConfig {
            poll_interval_ms: 10,
            stall_threshold_ms: 40,
        };
        let handle = spawn_monitor(Arc::clone(&probe), clock, config, tx).unwrap();

        probe.iteration_will_begin();
        std::thread::sleep(Duration::from_millis(120));
        probe.iteration_did_end();

        let event = rx
            .recv_timeout(Duration::from_millis(500))
            .expect("stall must be reported after recovery");
        assert!(event.recovered);
        assert!(event.duration >= Duration::from_millis(40));
        handle.stop();
    }

    #[test]
    fn stop_flushes_open_stall() {
        let clock: Arc<dyn MonotonicClock> = Arc::new(SystemClock::new());
        let probe = Arc::new(EventLoopProbe::new(Arc::clone(&clock)));
        let (tx, rx) = bounded(8);
        let config = MonitorConfig {
            poll_interval_ms: 10,
            stall_threshold_ms: 40,
        };
        let handle = spawn_monitor(Arc::clone(&probe), clock, config, tx).unwrap();

        probe.iteration_will_begin();
        std::thread::sleep(Duration::from_millis(100));
        handle.stop();

        let event = rx.try_recv().expect("flush event expected at stop");
        assert!(!event.recovered);
        assert!(event.duration >= Duration::from_millis(40));
    }

    #[test]
    fn monitor_exits_when_consumer_disconnects() {
        let clock: Arc<dyn MonotonicClock> = Arc::new(SystemClock::new());
        let probe = Arc::new(EventLoopProbe::new(Arc::clone(&clock)));
        let (tx, rx) = bounded(1);
        let config = MonitorConfig {
            poll_interval_ms: 5,
            stall_threshold_ms: 20,
        };
        let handle = spawn_monitor(Arc::clone(&probe), clock, config, tx).unwrap();
        drop(rx);

        probe.iteration_will_begin();
        std::thread::sleep(Duration::from_millis(60));
        probe.iteration_did_end();
        // Stop must not hang even though the receiver is gone.
        handle.stop();
    }

    #[test]
    fn spawn_rejects_invalid_config() {
        let clock: Arc<dyn MonotonicClock> = Arc::new(SystemClock::new());
        let probe = Arc::new(EventLoopProbe::new(Arc::clone(&clock)));
        let (tx, _rx) = bounded(1);
        let config = MonitorConfig {
            poll_interval_ms: 50,
            stall_threshold_ms: 50,
        };
        assert!(spawn_monitor(probe, clock, config, tx).is_err());
    }
}
