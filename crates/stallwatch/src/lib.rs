//! stallwatch: main-thread stall detection and device pressure reporting
//!
//! Detects when an application's primary event-processing thread blocks for
//! longer than a configured threshold, and separately when the device comes
//! under sustained memory/thermal pressure, forwarding both to a
//! pluggable diagnostics sink.
//!
//! # Architecture
//!
//! ```text
//! primary thread ──► EventLoopProbe (atomic phase+timestamp)
//!                          │
//!                          ▼ poll
//!                    StallMonitor ──► stall events ──► Watchdog reporter
//!                                                          │ enrich
//!                                                          ▼
//!                                                  DiagnosticsSink
//! DevicePressureMonitor ──────────────────────────────────┘
//! ```
//!
//! The probe path is lock-free by design: the thread whose responsiveness
//! is being measured must never wait on the thing measuring it.
//!
//! # Modules
//!
//! - `probe`: event-loop hooks and the shared atomic snapshot
//! - `monitor`: polling thread and stall episode state machine
//! - `watchdog`: lifecycle façade, enrichment and report delivery
//! - `pressure`: memory/thermal pressure sampling
//! - `report`: sink and context-provider contracts
//! - `clock`: monotonic time sources
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod clock;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod pressure;
pub mod probe;
pub mod report;
pub mod watchdog;

pub use error::{ConfigError, Error, Result};
pub use probe::{EventLoopProbe, LoopPhase};
pub use watchdog::{Watchdog, WatchdogConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
