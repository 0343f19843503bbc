//! Status tracker. Classifies AUT log lines into a run status.
//!
//! ## Transitions
//!
//! ```text
//! UNKNOWN → PASS   success pattern seen
//! UNKNOWN → FAIL   failure pattern seen
//! PASS    → FAIL   failure pattern seen
//! FAIL    → FAIL   (terminal; success lines are ignored)
//! ```
//!
//! Failure patterns are checked first, so a line matching both phrasings is a
//! failure. Only `reset()` returns the tracker to `UNKNOWN`.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::verdict::TestVerdict;

/// Observed test-suite status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusState {
    Unknown,
    Pass,
    Fail,
}

impl StatusState {
    /// The verdict this state settles on, if any.
    pub fn verdict(self) -> Option<TestVerdict> {
        match self {
            StatusState::Unknown => None,
            StatusState::Pass => Some(TestVerdict::Pass),
            StatusState::Fail => Some(TestVerdict::Fail),
        }
    }
}

/// Substring patterns announcing the suite's outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPatterns {
    success: Vec<String>,
    failure: Vec<String>,
}

impl StatusPatterns {
    pub fn new(success: Vec<String>, failure: Vec<String>) -> Self {
        // An empty pattern would match every line.
        let keep = |p: &String| !p.is_empty();
        Self {
            success: success.into_iter().filter(keep).collect(),
            failure: failure.into_iter().filter(keep).collect(),
        }
    }

    pub fn success(&self) -> &[String] {
        &self.success
    }

    pub fn failure(&self) -> &[String] {
        &self.failure
    }

    /// Classify a single line. Failure wins over success.
    pub fn classify(&self, line: &str) -> Option<StatusState> {
        if self.failure.iter().any(|p| line.contains(p.as_str())) {
            Some(StatusState::Fail)
        } else if self.success.iter().any(|p| line.contains(p.as_str())) {
            Some(StatusState::Pass)
        } else {
            None
        }
    }
}

impl Default for StatusPatterns {
    fn default() -> Self {
        Self::new(
            vec!["All tests passed".to_string()],
            vec![
                "Some tests failed".to_string(),
                "Test execution failed".to_string(),
                "Vibecraft multiplier mismatch".to_string(),
                "TNT multiplier mismatch".to_string(),
            ],
        )
    }
}

/// Shared status cell, written by the tail watcher and read by the controller.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    patterns: Arc<StatusPatterns>,
    state: Arc<Mutex<StatusState>>,
}

impl StatusTracker {
    pub fn new(patterns: StatusPatterns) -> Self {
        Self {
            patterns: Arc::new(patterns),
            state: Arc::new(Mutex::new(StatusState::Unknown)),
        }
    }

    /// Feed one log line. Returns the new state when the line changed it.
    pub fn update(&self, line: &str) -> Option<StatusState> {
        let observed = self.patterns.classify(line)?;
        let mut state = self.state.lock().unwrap();
        let next = match (*state, observed) {
            (_, StatusState::Fail) => StatusState::Fail,
            (StatusState::Unknown, StatusState::Pass) => StatusState::Pass,
            (current, _) => current,
        };
        if next == *state {
            return None;
        }
        *state = next;
        Some(next)
    }

    pub fn get(&self) -> StatusState {
        *self.state.lock().unwrap()
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = StatusState::Unknown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracker() -> StatusTracker {
        StatusTracker::new(StatusPatterns::default())
    }

    #[test]
    fn starts_unknown() {
        assert_eq!(tracker().get(), StatusState::Unknown);
    }

    #[test]
    fn success_line_sets_pass() {
        let t = tracker();
        assert_eq!(
            t.update("[Render thread/INFO]: ✅ All tests passed (4/4)"),
            Some(StatusState::Pass)
        );
        assert_eq!(t.get(), StatusState::Pass);
    }

    #[test]
    fn failure_line_sets_fail() {
        let t = tracker();
        t.update("[Server thread/INFO]: ❌ Some tests failed (2/4 passed)");
        assert_eq!(t.get(), StatusState::Fail);
    }

    #[test]
    fn unrelated_lines_leave_state_alone() {
        let t = tracker();
        assert_eq!(t.update("Loading 42 mods"), None);
        assert_eq!(t.get(), StatusState::Unknown);

        t.update("All tests passed");
        assert_eq!(t.update("Saving chunks for level"), None);
        assert_eq!(t.get(), StatusState::Pass);
    }

    #[test]
    fn failure_downgrades_pass() {
        let t = tracker();
        t.update("All tests passed");
        assert_eq!(
            t.update("ERROR Test execution failed"),
            Some(StatusState::Fail)
        );
        assert_eq!(t.get(), StatusState::Fail);
    }

    #[test]
    fn success_never_upgrades_fail() {
        let t = tracker();
        t.update("TNT multiplier mismatch: expected 2.0");
        assert_eq!(t.update("✅ All tests passed (4/4)"), None);
        assert_eq!(t.get(), StatusState::Fail);
    }

    #[test]
    fn line_matching_both_is_failure() {
        let t = tracker();
        t.update("All tests passed? no: Some tests failed");
        assert_eq!(t.get(), StatusState::Fail);
    }

    #[test]
    fn reset_returns_to_unknown() {
        let t = tracker();
        t.update("Some tests failed");
        t.reset();
        assert_eq!(t.get(), StatusState::Unknown);
    }

    #[test]
    fn clones_share_state() {
        let t = tracker();
        let writer = t.clone();
        let handle = std::thread::spawn(move || {
            writer.update("All tests passed");
        });
        handle.join().unwrap();
        assert_eq!(t.get(), StatusState::Pass);
    }

    #[test]
    fn custom_patterns_drive_classification() {
        let t = StatusTracker::new(StatusPatterns::new(
            vec!["SUITE OK".to_string()],
            vec!["SUITE BROKEN".to_string(), String::new()],
        ));
        assert_eq!(t.update("anything at all"), None);
        t.update("SUITE OK");
        assert_eq!(t.get(), StatusState::Pass);
        t.update("SUITE BROKEN");
        assert_eq!(t.get(), StatusState::Fail);
    }

    #[test]
    fn state_verdict_mapping() {
        assert_eq!(StatusState::Unknown.verdict(), None);
        assert_eq!(StatusState::Pass.verdict(), Some(TestVerdict::Pass));
        assert_eq!(StatusState::Fail.verdict(), Some(TestVerdict::Fail));
    }

    fn line_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("✅ All tests passed (4/4)".to_string()),
            Just("❌ Some tests failed (2/4 passed)".to_string()),
            Just("Test execution failed".to_string()),
            "[a-z ]{0,20}",
        ]
    }

    proptest! {
        #[test]
        fn any_failure_line_makes_final_state_fail(lines in prop::collection::vec(line_strategy(), 0..30)) {
            let t = tracker();
            for line in &lines {
                t.update(line);
            }
            let patterns = StatusPatterns::default();
            let saw_failure = lines
                .iter()
                .any(|l| patterns.classify(l) == Some(StatusState::Fail));
            let saw_success = lines
                .iter()
                .any(|l| patterns.classify(l) == Some(StatusState::Pass));

            if saw_failure {
                prop_assert_eq!(t.get(), StatusState::Fail);
            } else if saw_success {
                prop_assert_eq!(t.get(), StatusState::Pass);
            } else {
                prop_assert_eq!(t.get(), StatusState::Unknown);
            }
        }

        #[test]
        fn reset_always_yields_unknown(lines in prop::collection::vec(line_strategy(), 0..10)) {
            let t = tracker();
            for line in &lines {
                t.update(line);
            }
            t.reset();
            prop_assert_eq!(t.get(), StatusState::Unknown);
        }
    }
}
