//! Test assertions for raised events.

use crate::core::{StageEvent, StageRef};

/// Asserts that `events` contains exactly `count` events of `event_type`.
pub fn assert_event_count(events: &[StageEvent], event_type: &str, count: usize) {
    let actual = events.iter().filter(|e| e.event_type == event_type).count();
    assert_eq!(
        actual, count,
        "Expected {count} '{event_type}' events, got {actual}. Types: {:?}",
        event_types(events)
    );
}

/// Asserts that the events raised by `stage` have exactly the given types, in order.
pub fn assert_stage_events(events: &[StageEvent], stage: &StageRef, expected: &[&str]) {
    let actual: Vec<&str> = events
        .iter()
        .filter(|e| e.is_from(stage))
        .map(|e| e.event_type.as_str())
        .collect();
    assert_eq!(
        actual, expected,
        "Unexpected event sequence for stage '{}'",
        stage.name
    );
}

/// Asserts that `first` was raised before `second`.
pub fn assert_raised_before(events: &[StageEvent], first: &str, second: &str) {
    let position = |event_type: &str| events.iter().position(|e| e.event_type == event_type);
    match (position(first), position(second)) {
        (Some(a), Some(b)) => assert!(
            a < b,
            "Expected '{first}' before '{second}'. Types: {:?}",
            event_types(events)
        ),
        _ => panic!(
            "Expected both '{first}' and '{second}'. Types: {:?}",
            event_types(events)
        ),
    }
}

fn event_types(events: &[StageEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}
