//! Property-based tests for the `monitor` module.
//!
//! Drives the pure `StallDetector` through randomized event-loop timelines
//! sampled at a fixed poll cadence and checks the episode invariants: one
//! report per qualifying `Processing` span, none for short spans, reported
//! durations never below the threshold, and strictly sequential episodes.
//!
//! Span lengths avoid the ambiguity band `[threshold, threshold + poll)`
//! where detection legitimately depends on tick alignment.

use std::time::Duration;

use proptest::prelude::*;
use stallwatch::monitor::{DetectorState, StallDetector, StallEvent};
use stallwatch::probe::LoopPhase;

const POLL_MS: u64 = 50;
const THRESHOLD_MS: u64 = 200;

#[derive(Debug, Clone, Copy)]
struct Span {
    phase: LoopPhase,
    dwell_ms: u64,
}

/// Idle span: the loop parked or just finished an iteration.
fn arb_idle_span() -> impl Strategy<Value = Span> {
    (
        prop_oneof![
            Just(LoopPhase::BeforeIteration),
            Just(LoopPhase::AfterIteration),
        ],
        1_u64..500,
    )
        .prop_map(|(phase, dwell_ms)| Span { phase, dwell_ms })
}

/// Processing span guaranteed to stay under threshold at every tick.
fn arb_short_processing() -> impl Strategy<Value = Span> {
    (1_u64..=THRESHOLD_MS - POLL_MS).prop_map(|dwell_ms| Span {
        phase: LoopPhase::Processing,
        dwell_ms,
    })
}

/// Processing span guaranteed to be observed past threshold.
fn arb_long_processing() -> impl Strategy<Value = Span> {
    (THRESHOLD_MS + POLL_MS..=1000).prop_map(|dwell_ms| Span {
        phase: LoopPhase::Processing,
        dwell_ms,
    })
}

fn arb_timeline() -> impl Strategy<Value = Vec<Span>> {
    proptest::collection::vec(
        prop_oneof![
            3 => arb_idle_span(),
            2 => arb_short_processing(),
            2 => arb_long_processing(),
        ],
        0..40,
    )
}

/// Replay a timeline against the detector, polling every `POLL_MS`.
/// Phase writes happen at span boundaries, exactly as the probe hooks
/// would record them; the final `finish` mirrors monitor shutdown.
fn run_timeline(spans: &[Span]) -> (Vec<StallEvent>, StallDetector) {
    let poll = Duration::from_millis(POLL_MS);
    let mut detector = StallDetector::new(Duration::from_millis(THRESHOLD_MS));
    let mut events = Vec::new();

    let mut t = Duration::ZERO;
    let mut next_tick = poll;
    for span in spans {
        let stamp = t;
        let end = t + Duration::from_millis(span.dwell_ms);
        while next_tick < end {
            if let Some(event) = detector.observe(span.phase, stamp, next_tick) {
                events.push(event);
            }
            next_tick += poll;
        }
        t = end;
    }
    if let Some(event) = detector.finish(t) {
        events.push(event);
    }
    (events, detector)
}

fn qualifying_spans(spans: &[Span]) -> usize {
    spans
        .iter()
        .filter(|s| s.phase == LoopPhase::Processing && s.dwell_ms >= THRESHOLD_MS)
        .count()
}

proptest! {
    /// Exactly one report per Processing span at or past threshold, zero
    /// for everything else.
    #[test]
    fn one_report_per_qualifying_span(spans in arb_timeline()) {
        let (events, detector) = run_timeline(&spans);
        prop_assert_eq!(events.len(), qualifying_spans(&spans));
        prop_assert_eq!(detector.state(), DetectorState::Idle);
    }

    /// Reported durations are never below the threshold.
    #[test]
    fn reported_durations_at_least_threshold(spans in arb_timeline()) {
        let (events, _) = run_timeline(&spans);
        for event in &events {
            prop_assert!(event.duration >= Duration::from_millis(THRESHOLD_MS));
        }
    }

    /// Episodes never overlap: start offsets are strictly increasing.
    #[test]
    fn episodes_are_strictly_sequential(spans in arb_timeline()) {
        let (events, _) = run_timeline(&spans);
        for pair in events.windows(2) {
            prop_assert!(pair[1].episode_started > pair[0].episode_started);
        }
    }

    /// Arbitrarily long idle/short-processing alternation never reports.
    #[test]
    fn no_false_positives_on_short_spans(
        spans in proptest::collection::vec(
            prop_oneof![arb_idle_span(), arb_short_processing()],
            0..200,
        )
    ) {
        let (events, _) = run_timeline(&spans);
        prop_assert!(events.is_empty());
    }

    /// Only recovered episodes carry `recovered = true`; at most the final
    /// event may be an unrecovered flush.
    #[test]
    fn only_last_event_may_be_unrecovered(spans in arb_timeline()) {
        let (events, _) = run_timeline(&spans);
        if let Some((last, rest)) = events.split_last() {
            for event in rest {
                prop_assert!(event.recovered);
            }
            // The flush case only happens when the timeline ends mid-span.
            if !last.recovered {
                prop_assert_eq!(
                    spans.last().map(|s| s.phase),
                    Some(LoopPhase::Processing)
                );
            }
        }
    }
}
