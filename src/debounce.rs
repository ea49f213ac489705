//! Per-action debounce timers
//!
//! A [`DebounceRegistry`] keeps an explicit `action → (last_run, interval)`
//! record. Callers ask [`DebounceRegistry::try_run`] before executing an
//! action; a call inside the interval is dropped, never queued.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Actions gated by their own debounce interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Append the eye-state vote
    EyeVote,
    /// Append the movement vote
    MovementVote,
    /// Run the occlusion classifier and append its vote
    OcclusionVote,
    /// Age out the oldest eye sample when no face is visible
    NoFaceDecay,
    /// Age out the oldest wrist sample when no body is visible
    NoBodyDecay,
    /// Compare aggregate confidence against the awake threshold
    StatusCheck,
    /// Log a sleep transition
    SleepTransition,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    last_run: Option<DateTime<Utc>>,
    interval: Duration,
}

/// Explicit record of debounce timers, queried with an injected timestamp
#[derive(Debug, Clone, Default)]
pub struct DebounceRegistry {
    timers: HashMap<Action, Timer>,
}

impl DebounceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-configure) an action's interval
    pub fn register(&mut self, action: Action, interval: Duration) {
        self.timers
            .entry(action)
            .and_modify(|t| t.interval = interval)
            .or_insert(Timer {
                last_run: None,
                interval,
            });
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, action: Action, interval: Duration) -> Self {
        self.register(action, interval);
        self
    }

    /// Returns true and records `now` as the last run if the action may run.
    ///
    /// Unregistered actions are never debounced.
    pub fn try_run(&mut self, action: Action, now: DateTime<Utc>) -> bool {
        let Some(timer) = self.timers.get_mut(&action) else {
            return true;
        };
        if let Some(last) = timer.last_run {
            if now - last < timer.interval {
                return false;
            }
        }
        timer.last_run = Some(now);
        true
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap()
    }

    #[test]
    fn test_first_call_runs() {
        let mut reg = DebounceRegistry::new().with(Action::EyeVote, Duration::seconds(1));
        assert!(reg.try_run(Action::EyeVote, t0()));
        assert!(!reg.try_run(Action::EyeVote, t0()));
    }

    #[test]
    fn test_calls_inside_interval_are_dropped() {
        let mut reg = DebounceRegistry::new().with(Action::EyeVote, Duration::seconds(1));
        assert!(reg.try_run(Action::EyeVote, t0()));
        assert!(!reg.try_run(Action::EyeVote, t0() + Duration::milliseconds(400)));
        assert!(!reg.try_run(Action::EyeVote, t0() + Duration::milliseconds(999)));
        // Dropped calls don't push the window forward
        assert!(reg.try_run(Action::EyeVote, t0() + Duration::seconds(1)));
    }

    #[test]
    fn test_actions_are_independent() {
        let mut reg = DebounceRegistry::new()
            .with(Action::EyeVote, Duration::seconds(1))
            .with(Action::SleepTransition, Duration::seconds(180));
        assert!(reg.try_run(Action::EyeVote, t0()));
        assert!(reg.try_run(Action::SleepTransition, t0()));
        assert!(reg.try_run(Action::EyeVote, t0() + Duration::seconds(2)));
        assert!(!reg.try_run(Action::SleepTransition, t0() + Duration::seconds(2)));
        assert!(!reg.try_run(Action::SleepTransition, t0() + Duration::seconds(179)));
        assert!(reg.try_run(Action::SleepTransition, t0() + Duration::seconds(180)));
    }

    #[test]
    fn test_unregistered_action_always_runs() {
        let mut reg = DebounceRegistry::new();
        assert!(reg.try_run(Action::StatusCheck, t0()));
        assert!(reg.try_run(Action::StatusCheck, t0()));
    }
}
