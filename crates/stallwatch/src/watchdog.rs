//! Watchdog façade: owns the stall monitor's lifecycle and forwards
//! enriched reports to the diagnostics sink.
//!
//! `start()`/`stop()` are idempotent.  Stall events flow from the monitor
//! thread over a bounded channel to a dedicated reporter thread, which
//! queries the context provider and calls the sink.  Sink calls may be slow
//! (network I/O); running them on their own thread means they can never
//! delay detection of the next episode.  `stop()` joins the monitor and
//! then the reporter, so no report is delivered after it returns.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{MonotonicClock, SystemClock};
use crate::error::Result;
use crate::monitor::{MonitorConfig, MonitorHandle, StallEvent, spawn_monitor};
use crate::probe::EventLoopProbe;
use crate::report::{AttrValue, Attributes, ContextProvider, DiagnosticsSink};

/// Report kind recorded to the sink for a confirmed stall.
pub const STALL_REPORT_KIND: &str = "main_thread_stall";

// =============================================================================
// Configuration
// =============================================================================

/// Watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Stall monitor thresholds.
    pub monitor: MonitorConfig,
    /// Capacity of the monitor → reporter event queue.  Events beyond this
    /// are dropped rather than blocking the monitor.
    pub event_queue_depth: usize,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            event_queue_depth: 8,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// An enriched stall report, built by the reporter thread at emission time
/// and handed to the sink.
#[derive(Debug, Clone)]
pub struct StallReport {
    /// Measured stall duration.
    pub duration: Duration,
    /// Attributes forwarded to the sink.
    pub attributes: Attributes,
}

impl StallReport {
    fn build(event: &StallEvent, context: &dyn ContextProvider) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(
            "blocking_time_ms".into(),
            AttrValue::from(event.duration.as_millis() as u64),
        );
        attributes.insert("recovered".into(), AttrValue::from(i64::from(event.recovered)));
        let label = context.current_context_label();
        if !label.is_empty() {
            attributes.insert("context".into(), AttrValue::from(label));
        }
        Self {
            duration: event.duration,
            attributes,
        }
    }
}

// =============================================================================
// Watchdog
// =============================================================================

struct Running {
    monitor: MonitorHandle,
    reporter: JoinHandle<()>,
}

/// Main-thread watchdog.
///
/// One instance is constructed and owned by whatever component manages the
/// application's lifecycle; there is no hidden global.  The host obtains
/// the probe via [`probe`](Self::probe) and wires its event loop to it.
pub struct Watchdog {
    config: WatchdogConfig,
    clock: Arc<dyn MonotonicClock>,
    probe: Arc<EventLoopProbe>,
    context: Arc<dyn ContextProvider>,
    sink: Arc<dyn DiagnosticsSink>,
    running: Mutex<Option<Running>>,
}

impl Watchdog {
    /// Create a watchdog with the system monotonic clock.
    ///
    /// Fails fast on an invalid configuration (threshold not strictly
    /// greater than the poll interval).
    pub fn new(
        config: WatchdogConfig,
        context: Arc<dyn ContextProvider>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self> {
        Self::with_clock(config, context, sink, Arc::new(SystemClock::new()))
    }

    /// Create a watchdog with an explicit clock (tests use [`ManualClock`]
    /// here).
    ///
    /// [`ManualClock`]: crate::clock::ManualClock
    pub fn with_clock(
        config: WatchdogConfig,
        context: Arc<dyn ContextProvider>,
        sink: Arc<dyn DiagnosticsSink>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Result<Self> {
        config.monitor.validate()?;
        let probe = Arc::new(EventLoopProbe::new(Arc::clone(&clock)));
        Ok(Self {
            config,
            clock,
            probe,
            context,
            sink,
            running: Mutex::new(None),
        })
    }

    /// The probe the host event loop must invoke around each iteration.
    #[must_use]
    pub fn probe(&self) -> Arc<EventLoopProbe> {
        Arc::clone(&self.probe)
    }

    /// Whether the monitor is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Start monitoring.  No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.lock_running();
        if running.is_some() {
            debug!("watchdog already started");
            return Ok(());
        }

        let (events_tx, events_rx) = bounded(self.config.event_queue_depth.max(1));
        let monitor = spawn_monitor(
            Arc::clone(&self.probe),
            Arc::clone(&self.clock),
            self.config.monitor.clone(),
            events_tx,
        )?;
        let reporter = spawn_reporter(events_rx, Arc::clone(&self.context), Arc::clone(&self.sink))?;

        *running = Some(Running { monitor, reporter });
        info!(
            poll_ms = self.config.monitor.poll_interval_ms,
            threshold_ms = self.config.monitor.stall_threshold_ms,
            "watchdog started"
        );
        Ok(())
    }

    /// Stop monitoring and wait for both background threads to terminate.
    /// No report is delivered after this returns.  No-op if not running.
    pub fn stop(&self) {
        let running = self.lock_running().take();
        let Some(running) = running else {
            return;
        };
        // Joining the monitor drops the event sender, which lets the
        // reporter drain the queue and exit.
        running.monitor.stop();
        let _ = running.reporter.join();
        info!("watchdog stopped");
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the reporter thread: enrichment and sink delivery, off the
/// monitor's timing loop.
fn spawn_reporter(
    events: Receiver<StallEvent>,
    context: Arc<dyn ContextProvider>,
    sink: Arc<dyn DiagnosticsSink>,
) -> Result<JoinHandle<()>> {
    let thread = std::thread::Builder::new()
        .name("stallwatch-reporter".into())
        .spawn(move || {
            for event in &events {
                let report = StallReport::build(&event, context.as_ref());
                sink.record(STALL_REPORT_KIND, &report.attributes);
            }
        })?;
    Ok(thread)
}

// =============================================================================
// Tests
// =============================================================================
