//! Event-loop probe: makes the primary thread's progress observable.
//!
//! The hosting event loop calls [`EventLoopProbe::iteration_will_begin`] and
//! [`EventLoopProbe::iteration_did_end`] around each iteration (and
//! optionally [`EventLoopProbe::loop_will_park`] before sleeping for new
//! work).  Each hook packs the current phase and a monotonic timestamp into
//! a single `AtomicU64`, so the monitor thread can read a consistent
//! (phase, timestamp) pair with one load — no lock, no allocation, and no
//! possibility of blocking the thread whose responsiveness is being
//! measured.
//!
//! # Integration
//!
//! ```text
//! host event loop                      monitor thread
//!   loop_will_park()    ──┐
//!   (wait for work)       ├──► AtomicU64 ──► snapshot() every poll tick
//!   iteration_will_begin()│
//!   (dispatch work)       │
//!   iteration_did_end() ──┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::MonotonicClock;

/// Where the event loop currently is within its iteration cycle.
///
/// Written only by the primary thread, read only by the monitor.  One full
/// cycle per iteration: `BeforeIteration → Processing → AfterIteration →
/// BeforeIteration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    /// Idle, waiting for new work.
    BeforeIteration,
    /// An iteration is in flight; this is the only phase that can stall.
    Processing,
    /// The last iteration completed; the loop has not parked yet.
    AfterIteration,
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeforeIteration => write!(f, "before_iteration"),
            Self::Processing => write!(f, "processing"),
            Self::AfterIteration => write!(f, "after_iteration"),
        }
    }
}

// Low two bits of the packed word.  Tag 3 is never written; if it is ever
// observed it decodes as Processing so an ambiguous read errs toward
// detection rather than silence.
const TAG_BEFORE: u64 = 0;
const TAG_PROCESSING: u64 = 1;
const TAG_AFTER: u64 = 2;

const TAG_BITS: u32 = 2;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
/// Largest timestamp that fits in the remaining 62 bits (in microseconds,
/// roughly 146 000 years of uptime).
const MAX_MICROS: u64 = u64::MAX >> TAG_BITS;

impl LoopPhase {
    const fn tag(self) -> u64 {
        match self {
            Self::BeforeIteration => TAG_BEFORE,
            Self::Processing => TAG_PROCESSING,
            Self::AfterIteration => TAG_AFTER,
        }
    }

    const fn from_tag(tag: u64) -> Self {
        match tag {
            TAG_BEFORE => Self::BeforeIteration,
            TAG_AFTER => Self::AfterIteration,
            _ => Self::Processing,
        }
    }
}

/// Lock-free progress probe for the primary thread's event loop.
///
/// The hooks never block, never allocate, and cost a clock read plus one
/// atomic store.  [`snapshot`](Self::snapshot) is safe to call from any
/// thread concurrently with the writer and always returns an untorn pair.
#[derive(Debug)]
pub struct EventLoopProbe {
    clock: Arc<dyn MonotonicClock>,
    /// Packed `(timestamp_micros << 2) | phase_tag`.
    cell: AtomicU64,
}

impl EventLoopProbe {
    /// Create a probe in the `BeforeIteration` phase, stamped now.
    #[must_use]
    pub fn new(clock: Arc<dyn MonotonicClock>) -> Self {
        let initial = pack(LoopPhase::BeforeIteration, clock.now());
        Self {
            clock,
            cell: AtomicU64::new(initial),
        }
    }

    /// Hook: the loop is about to dispatch pending work.
    pub fn iteration_will_begin(&self) {
        self.record(LoopPhase::Processing);
    }

    /// Hook: the loop finished dispatching the current iteration.
    pub fn iteration_did_end(&self) {
        self.record(LoopPhase::AfterIteration);
    }

    /// Hook: the loop is about to park and wait for new work.  Optional;
    /// hosts without a park notification can skip it, since the monitor
    /// treats every phase other than `Processing` as idle.
    pub fn loop_will_park(&self) {
        self.record(LoopPhase::BeforeIteration);
    }

    /// RAII wrapper around one iteration: records `iteration_will_begin`
    /// now and `iteration_did_end` on drop.
    #[must_use]
    pub fn iteration_scope(&self) -> IterationScope<'_> {
        self.iteration_will_begin();
        IterationScope { probe: self }
    }

    /// Current (phase, timestamp) pair.  The timestamp is the moment the
    /// phase was last written, as an offset on the probe's clock.
    #[must_use]
    pub fn snapshot(&self) -> (LoopPhase, Duration) {
        unpack(self.cell.load(Ordering::Acquire))
    }

    fn record(&self, phase: LoopPhase) {
        self.cell
            .store(pack(phase, self.clock.now()), Ordering::Release);
    }
}

/// Guard returned by [`EventLoopProbe::iteration_scope`].
#[derive(Debug)]
pub struct IterationScope<'a> {
    probe: &'a EventLoopProbe,
}

impl Drop for IterationScope<'_> {
    fn drop(&mut self) {
        self.probe.iteration_did_end();
    }
}

fn pack(phase: LoopPhase, timestamp: Duration) -> u64 {
    let micros = u64::try_from(timestamp.as_micros())
        .unwrap_or(MAX_MICROS)
        .min(MAX_MICROS);
    (micros << TAG_BITS) | phase.tag()
}

fn unpack(word: u64) -> (LoopPhase, Duration) {
    let phase = LoopPhase::from_tag(word & TAG_MASK);
    let micros = word >> TAG_BITS;
    (phase, Duration::from_micros(micros))
}
