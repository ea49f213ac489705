//! Sleep state machine
//!
//! Hysteresis over the voting engine's aggregate confidence:
//! Unknown → Awake | Asleep, then Awake ⇄ Asleep.
//!
//! Two debounce levels damp flapping. The status check runs at most once
//! per `status_debounce_secs`; a transition it asks for is itself dropped
//! unless `transition_debounce_secs` have passed since the last one.

use crate::config::SleepConfig;
use crate::debounce::{Action, DebounceRegistry};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logged sleep state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepState {
    /// Before the first transition
    #[default]
    Unknown,
    Awake,
    Asleep,
}

impl SleepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SleepState::Unknown => "unknown",
            SleepState::Awake => "awake",
            SleepState::Asleep => "asleep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(SleepState::Unknown),
            "awake" => Some(SleepState::Awake),
            "asleep" => Some(SleepState::Asleep),
            _ => None,
        }
    }
}

impl fmt::Display for SleepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logged change of state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SleepTransition {
    pub from: SleepState,
    pub to: SleepState,
    pub confidence: f32,
    pub at: DateTime<Utc>,
}

/// Hysteresis plus debounce over aggregate confidence
#[derive(Debug)]
pub struct SleepStateMachine {
    state: SleepState,
    threshold: f32,
    debounce: DebounceRegistry,
}

impl SleepStateMachine {
    pub fn new(config: &SleepConfig) -> Self {
        let debounce = DebounceRegistry::new()
            .with(
                Action::StatusCheck,
                Duration::seconds(config.status_debounce_secs as i64),
            )
            .with(
                Action::SleepTransition,
                Duration::seconds(config.transition_debounce_secs as i64),
            );
        Self {
            state: SleepState::Unknown,
            threshold: config.awake_threshold,
            debounce,
        }
    }

    pub fn state(&self) -> SleepState {
        self.state
    }

    /// Evaluate the aggregate confidence.
    ///
    /// `None` confidence (empty vote window) is never evaluated.
    pub fn evaluate(
        &mut self,
        confidence: Option<f32>,
        now: DateTime<Utc>,
    ) -> Option<SleepTransition> {
        let confidence = confidence?;
        if !self.debounce.try_run(Action::StatusCheck, now) {
            return None;
        }

        let target = if confidence >= self.threshold {
            SleepState::Awake
        } else {
            SleepState::Asleep
        };
        if target == self.state {
            return None;
        }

        if !self.debounce.try_run(Action::SleepTransition, now) {
            tracing::debug!(
                "Transition to {} suppressed by debounce (confidence {:.2})",
                target,
                confidence
            );
            return None;
        }

        let transition = SleepTransition {
            from: self.state,
            to: target,
            confidence,
            at: now,
        };
        tracing::info!(
            "Sleep state {} → {} (confidence {:.2})",
            transition.from,
            transition.to,
            confidence
        );
        self.state = target;
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap()
    }

    fn machine() -> SleepStateMachine {
        SleepStateMachine::new(&SleepConfig::default())
    }

    #[test]
    fn test_starts_unknown() {
        assert_eq!(machine().state(), SleepState::Unknown);
    }

    #[test]
    fn test_empty_window_not_evaluated() {
        let mut m = machine();
        assert!(m.evaluate(None, t0()).is_none());
        // The status timer wasn't consumed either
        assert!(m.evaluate(Some(0.0), t0()).is_some());
    }

    #[test]
    fn test_first_evaluation_leaves_unknown() {
        let mut m = machine();
        let t = m.evaluate(Some(0.1), t0()).unwrap();
        assert_eq!(t.from, SleepState::Unknown);
        assert_eq!(t.to, SleepState::Asleep);
        assert_eq!(m.state(), SleepState::Asleep);
    }

    #[test]
    fn test_threshold_is_inclusive_for_awake() {
        let mut m = machine();
        let t = m.evaluate(Some(0.6), t0()).unwrap();
        assert_eq!(t.to, SleepState::Awake);
    }

    #[test]
    fn test_monotonic_rise_gives_one_awake_transition() {
        let mut m = machine();
        let mut transitions = Vec::new();
        let mut confidence = 0.0f32;
        for i in 0..600 {
            let now = t0() + Duration::seconds(i);
            if let Some(t) = m.evaluate(Some(confidence), now) {
                transitions.push(t);
            }
            confidence = (confidence + 0.01).min(3.0);
        }
        let awake: Vec<_> = transitions
            .iter()
            .filter(|t| t.to == SleepState::Awake)
            .collect();
        assert_eq!(awake.len(), 1);
        assert_eq!(m.state(), SleepState::Awake);
    }

    #[test]
    fn test_status_check_debounced() {
        let mut m = machine();
        assert!(m.evaluate(Some(0.1), t0()).is_some());
        // Within the status interval nothing is even evaluated
        assert!(m.evaluate(Some(2.0), t0() + Duration::seconds(5)).is_none());
        assert_eq!(m.state(), SleepState::Asleep);
    }

    #[test]
    fn test_transition_debounce_damps_flapping() {
        let mut m = machine();
        assert!(m.evaluate(Some(0.1), t0()).is_some());

        // Crossing again 20s later is suppressed by the 180s transition debounce
        assert!(m.evaluate(Some(2.0), t0() + Duration::seconds(20)).is_none());
        assert_eq!(m.state(), SleepState::Asleep);

        // ... and goes through once it has elapsed
        let t = m.evaluate(Some(2.0), t0() + Duration::seconds(180)).unwrap();
        assert_eq!(t.to, SleepState::Awake);
    }

    #[test]
    fn test_repeated_evaluation_in_target_state_is_noop() {
        let mut m = machine();
        m.evaluate(Some(1.0), t0());
        for i in 1..50 {
            assert!(m
                .evaluate(Some(1.0), t0() + Duration::seconds(i * 200))
                .is_none());
        }
    }

    #[test]
    fn test_state_parse_roundtrip() {
        for s in [SleepState::Unknown, SleepState::Awake, SleepState::Asleep] {
            assert_eq!(SleepState::parse(s.as_str()), Some(s));
        }
        assert_eq!(SleepState::parse("napping"), None);
    }
}
