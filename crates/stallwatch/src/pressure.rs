//! Device pressure monitoring: memory utilization and thermal state.
//!
//! A background sampler classifies system memory use and the device thermal
//! reading into severity tiers and records tier escalations to the
//! diagnostics sink, enriched with the same context label as stall reports.
//!
//! - **Linux**: reads `/proc/meminfo`, `/proc/self/status` (VmRSS) and
//!   `/sys/class/thermal`
//! - **macOS**: reads memory stats via `sysctl`/`vm_stat` and RSS via `ps`
//! - **Other**: inert (always `Green`/`Nominal`)

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{RecvTimeoutError, Sender, bounded};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, Result};
use crate::report::{AttrValue, Attributes, ContextProvider, DiagnosticsSink};

/// Report kind recorded to the sink when memory pressure escalates.
pub const MEMORY_REPORT_KIND: &str = "memory_pressure";
/// Report kind recorded to the sink when the thermal state escalates.
pub const THERMAL_REPORT_KIND: &str = "thermal_state";

// =============================================================================
// Tiers
// =============================================================================

/// Memory pressure severity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressureTier {
    /// Memory utilization below the warning threshold.
    Green,
    /// Moderate pressure.
    Yellow,
    /// High pressure.
    Orange,
    /// Critical pressure.
    Red,
}

impl std::fmt::Display for MemoryPressureTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Green => write!(f, "green"),
            Self::Yellow => write!(f, "yellow"),
            Self::Orange => write!(f, "orange"),
            Self::Red => write!(f, "red"),
        }
    }
}

/// Device thermal state, coarsest-to-hottest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl std::fmt::Display for ThermalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nominal => write!(f, "nominal"),
            Self::Fair => write!(f, "fair"),
            Self::Serious => write!(f, "serious"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Device pressure monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Sample interval in milliseconds.
    pub sample_interval_ms: u64,
    /// Memory-used percentage for `Yellow`.
    pub yellow_threshold: f64,
    /// Memory-used percentage for `Orange`.
    pub orange_threshold: f64,
    /// Memory-used percentage for `Red`.
    pub red_threshold: f64,
    /// Temperature (°C) for `Fair`.
    pub thermal_fair_c: f64,
    /// Temperature (°C) for `Serious`.
    pub thermal_serious_c: f64,
    /// Temperature (°C) for `Critical`.
    pub thermal_critical_c: f64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 10_000,
            yellow_threshold: 70.0,
            orange_threshold: 85.0,
            red_threshold: 95.0,
            thermal_fair_c: 60.0,
            thermal_serious_c: 75.0,
            thermal_critical_c: 85.0,
        }
    }
}

impl PressureConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::ZeroSampleInterval);
        }
        Ok(())
    }

    fn classify_memory(&self, used_percent: f64) -> MemoryPressureTier {
        if used_percent >= self.red_threshold {
            MemoryPressureTier::Red
        } else if used_percent >= self.orange_threshold {
            MemoryPressureTier::Orange
        } else if used_percent >= self.yellow_threshold {
            MemoryPressureTier::Yellow
        } else {
            MemoryPressureTier::Green
        }
    }

    fn classify_thermal(&self, celsius: Option<f64>) -> ThermalState {
        match celsius {
            Some(c) if c >= self.thermal_critical_c => ThermalState::Critical,
            Some(c) if c >= self.thermal_serious_c => ThermalState::Serious,
            Some(c) if c >= self.thermal_fair_c => ThermalState::Fair,
            _ => ThermalState::Nominal,
        }
    }
}

// =============================================================================
// Samples
// =============================================================================

/// One device pressure sample.
#[derive(Debug, Clone)]
pub struct PressureSample {
    /// System memory utilization percentage (0-100).
    pub used_percent: f64,
    /// Total system memory in KB (0 when unavailable).
    pub total_kb: u64,
    /// Available system memory in KB.
    pub available_kb: u64,
    /// This process's resident set size in KB, when readable.
    pub process_rss_kb: Option<u64>,
    /// Classified memory tier.
    pub memory_tier: MemoryPressureTier,
    /// Classified thermal state.
    pub thermal: ThermalState,
}

// =============================================================================
// Monitor
// =============================================================================

struct Running {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// Background sampler for memory and thermal pressure.
///
/// Escalations (a tier rising above its previous value) are recorded to the
/// sink once per escalation; steady elevated state is only logged.
pub struct DevicePressureMonitor {
    config: PressureConfig,
    context: Arc<dyn ContextProvider>,
    sink: Arc<dyn DiagnosticsSink>,
    running: Mutex<Option<Running>>,
}

impl DevicePressureMonitor {
    pub fn new(
        config: PressureConfig,
        context: Arc<dyn ContextProvider>,
        sink: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            context,
            sink,
            running: Mutex::new(None),
        })
    }

    /// Take a single pressure sample.
    #[must_use]
    pub fn sample(&self) -> PressureSample {
        let (total_kb, available_kb) = read_memory_info();
        let used_percent = if total_kb > 0 {
            ((total_kb - available_kb) as f64 / total_kb as f64) * 100.0
        } else {
            0.0
        };
        PressureSample {
            used_percent,
            total_kb,
            available_kb,
            process_rss_kb: read_process_rss_kb(),
            memory_tier: self.config.classify_memory(used_percent),
            thermal: self.config.classify_thermal(read_thermal_celsius()),
        }
    }

    /// Start the sampling thread.  No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = Duration::from_millis(self.config.sample_interval_ms);
        let config = self.config.clone();
        let context = Arc::clone(&self.context);
        let sink = Arc::clone(&self.sink);

        let thread = std::thread::Builder::new()
            .name("stallwatch-pressure".into())
            .spawn(move || {
                let sampler = SamplerLoop {
                    config,
                    context,
                    sink,
                };
                let mut prev_tier = MemoryPressureTier::Green;
                let mut prev_thermal = ThermalState::Nominal;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    sampler.tick(&mut prev_tier, &mut prev_thermal);
                }
            })?;

        *running = Some(Running { stop_tx, thread });
        info!(
            interval_ms = self.config.sample_interval_ms,
            "device pressure monitor started"
        );
        Ok(())
    }

    /// Stop the sampling thread and wait for it to exit.  No-op if not
    /// running.
    pub fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };
        let _ = running.stop_tx.try_send(());
        let _ = running.thread.join();
        info!("device pressure monitor stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DevicePressureMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-tick sampling state owned by the background thread.
struct SamplerLoop {
    config: PressureConfig,
    context: Arc<dyn ContextProvider>,
    sink: Arc<dyn DiagnosticsSink>,
}

impl SamplerLoop {
    fn tick(&self, prev_tier: &mut MemoryPressureTier, prev_thermal: &mut ThermalState) {
        let (total_kb, available_kb) = read_memory_info();
        let used_percent = if total_kb > 0 {
            ((total_kb - available_kb) as f64 / total_kb as f64) * 100.0
        } else {
            0.0
        };
        let tier = self.config.classify_memory(used_percent);
        let thermal = self.config.classify_thermal(read_thermal_celsius());
        let rss_kb = read_process_rss_kb();

        if tier > MemoryPressureTier::Green {
            info!(
                used_percent = format!("{used_percent:.1}"),
                available_mb = available_kb / 1024,
                tier = %tier,
                "memory pressure elevated"
            );
        }

        if tier > *prev_tier {
            self.sink
                .record(MEMORY_REPORT_KIND, &self.memory_attrs(used_percent, available_kb, rss_kb, tier));
        }
        if thermal > *prev_thermal {
            self.sink
                .record(THERMAL_REPORT_KIND, &self.thermal_attrs(thermal, rss_kb));
        }
        *prev_tier = tier;
        *prev_thermal = thermal;
    }

    fn memory_attrs(
        &self,
        used_percent: f64,
        available_kb: u64,
        rss_kb: Option<u64>,
        tier: MemoryPressureTier,
    ) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("used_percent".into(), AttrValue::from((used_percent * 10.0).round() / 10.0));
        attrs.insert("available_mb".into(), AttrValue::from(available_kb / 1024));
        attrs.insert("tier".into(), AttrValue::from(tier.to_string()));
        if let Some(rss) = rss_kb {
            attrs.insert("memory_used_mb".into(), AttrValue::from(rss / 1024));
        }
        self.add_context(&mut attrs);
        attrs
    }

    fn thermal_attrs(&self, thermal: ThermalState, rss_kb: Option<u64>) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("state".into(), AttrValue::from(thermal.to_string()));
        if let Some(rss) = rss_kb {
            attrs.insert("memory_used_mb".into(), AttrValue::from(rss / 1024));
        }
        self.add_context(&mut attrs);
        attrs
    }

    fn add_context(&self, attrs: &mut Attributes) {
        let label = self.context.current_context_label();
        if !label.is_empty() {
            attrs.insert("context".into(), AttrValue::from(label));
        }
    }
}

// =============================================================================
// Platform-specific readers
// =============================================================================

/// Read total and available system memory in KB.
fn read_memory_info() -> (u64, u64) {
    #[cfg(target_os = "linux")]
    {
        read_linux_meminfo()
    }
    #[cfg(target_os = "macos")]
    {
        read_macos_memory()
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        (0, 0)
    }
}

#[cfg(target_os = "linux")]
fn read_linux_meminfo() -> (u64, u64) {
    let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
        return (0, 0);
    };
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    for line in contents.lines() {
        if let Some(val) = line.strip_prefix("MemTotal:") {
            total_kb = parse_kb_field(val);
        } else if let Some(val) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_kb_field(val);
        }
    }
    (total_kb, available_kb)
}

/// Parse a `/proc` field like `"  12345 kB"` → 12345.
#[cfg(any(target_os = "linux", test))]
fn parse_kb_field(s: &str) -> u64 {
    s.trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .unwrap_or(0)
}

#[cfg(target_os = "macos")]
fn read_macos_memory() -> (u64, u64) {
    let total_kb = std::process::Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map_or(0, |bytes| bytes / 1024);

    let Some(output) = std::process::Command::new("vm_stat")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
    else {
        return (total_kb, 0);
    };

    // First line: "Mach Virtual Memory Statistics: (page size of 16384 bytes)"
    let page_size = output
        .lines()
        .next()
        .and_then(|line| {
            let start = line.find("page size of ")? + 13;
            let end = line[start..].find(' ')? + start;
            line[start..end].parse::<u64>().ok()
        })
        .unwrap_or(16384);

    let mut pages = 0u64;
    for prefix in ["Pages free:", "Pages inactive:", "Pages purgeable:"] {
        if let Some(val) = output.lines().find_map(|line| line.strip_prefix(prefix)) {
            pages += val.trim().trim_end_matches('.').parse::<u64>().unwrap_or(0);
        }
    }

    (total_kb, (pages * page_size) / 1024)
}

/// This process's resident set size in KB.
fn read_process_rss_kb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let contents = std::fs::read_to_string("/proc/self/status").ok()?;
        contents
            .lines()
            .find_map(|line| line.strip_prefix("VmRSS:"))
            .map(parse_kb_field)
    }
    #[cfg(target_os = "macos")]
    {
        let pid = std::process::id().to_string();
        std::process::Command::new("ps")
            .args(["-o", "rss=", "-p", &pid])
            .output()
            .ok()
            .and_then(|o| String::from_utf8(o.stdout).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// Best-effort device temperature in °C.
fn read_thermal_celsius() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        // Hottest zone wins; zones report millidegrees.
        let entries = std::fs::read_dir("/sys/class/thermal").ok()?;
        let mut hottest: Option<f64> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("thermal_zone"))
            {
                continue;
            }
            if let Some(milli) = std::fs::read_to_string(path.join("temp"))
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
            {
                let c = milli as f64 / 1000.0;
                hottest = Some(hottest.map_or(c, |h| h.max(c)));
            }
        }
        hottest
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
