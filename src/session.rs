//! Per-session outcome counters and the failure streak that invalidates a session.

use uuid::Uuid;

/// Counters of one localization session.
///
/// `success_count + fail_count == responses_count` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub responses_count: u32,
    pub success_count: u32,
    pub fail_count: u32,
    /// Consecutive successes; cleared by any failure.
    pub success_in_row: u32,
}

impl SessionInfo {
    /// Fresh session with a random id and zeroed counters.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            responses_count: 0,
            success_count: 0,
            fail_count: 0,
            success_in_row: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.responses_count += 1;
        self.success_count += 1;
        self.success_in_row += 1;
    }

    pub fn record_failure(&mut self) {
        self.responses_count += 1;
        self.fail_count += 1;
        self.success_in_row = 0;
    }
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Consecutive failures since the last success or session reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureStreak {
    count: u32,
}

impl FailureStreak {
    pub fn record_failure(&mut self) {
        self.count += 1;
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn should_reset(&self, threshold: u32) -> bool {
        self.count >= threshold
    }
}

/// Session bookkeeping owned by the localization loop.
///
/// While the session is still establishing its first lock, failures are
/// counted in the session but never reset it: there is nothing to discard yet.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    session: SessionInfo,
    streak: FailureStreak,
    establishing: bool,
    threshold: u32,
}

impl SessionTracker {
    pub fn new(fails_count_to_reset: u32) -> Self {
        let session = SessionInfo::new();
        log::debug!("New session: {}", session.id);
        Self {
            session,
            streak: FailureStreak::default(),
            establishing: true,
            threshold: fails_count_to_reset,
        }
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// True until the first success of the current session.
    pub fn is_establishing(&self) -> bool {
        self.establishing
    }

    pub fn failure_streak(&self) -> u32 {
        self.streak.count()
    }

    /// Replace the session with a fresh one.
    pub fn reset_session(&mut self) {
        self.session = SessionInfo::new();
        log::debug!("New session: {}", self.session.id);
    }

    /// Count a success. A location change starts a new session first.
    pub fn record_success(&mut self, location_changed: bool) {
        if location_changed {
            self.reset_session();
        }
        self.session.record_success();
        self.establishing = false;
        self.streak.reset();
    }

    /// Count a failure. Returns true if it invalidated the session.
    pub fn record_failure(&mut self) -> bool {
        self.session.record_failure();

        if self.establishing {
            return false;
        }

        self.streak.record_failure();
        if self.streak.should_reset(self.threshold) {
            log::info!(
                "{} consecutive failures, resetting session {}",
                self.streak.count(),
                self.session.id
            );
            self.streak.reset();
            self.reset_session();
            self.establishing = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_stay_consistent() {
        let mut s = SessionInfo::new();
        s.record_success();
        s.record_success();
        s.record_failure();
        s.record_success();
        assert_eq!(s.responses_count, 4);
        assert_eq!(s.success_count + s.fail_count, s.responses_count);
        assert_eq!(s.success_in_row, 1);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionInfo::new().id, SessionInfo::new().id);
    }

    #[test]
    fn test_streak_reaches_threshold() {
        let mut streak = FailureStreak::default();
        for _ in 0..3 {
            streak.record_failure();
        }
        assert!(streak.should_reset(3));
    }

    #[test]
    fn test_success_clears_streak() {
        let mut streak = FailureStreak::default();
        streak.record_failure();
        streak.record_failure();
        streak.reset();
        streak.record_failure();
        streak.record_failure();
        assert!(!streak.should_reset(3));
    }

    #[test]
    fn test_tracker_ignores_failures_before_first_lock() {
        let mut tracker = SessionTracker::new(3);
        let id = tracker.session().id.clone();
        for _ in 0..10 {
            assert!(!tracker.record_failure());
        }
        assert!(tracker.is_establishing());
        assert_eq!(tracker.session().id, id);
        assert_eq!(tracker.session().fail_count, 10);
        assert_eq!(tracker.failure_streak(), 0);
    }

    #[test]
    fn test_tracker_resets_after_threshold() {
        let mut tracker = SessionTracker::new(3);
        tracker.record_success(false);
        let id = tracker.session().id.clone();

        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());

        assert!(tracker.is_establishing());
        assert_ne!(tracker.session().id, id);
        assert_eq!(tracker.session().responses_count, 0);
        assert_eq!(tracker.failure_streak(), 0);
    }

    #[test]
    fn test_tracker_interleaved_success_prevents_reset() {
        let mut tracker = SessionTracker::new(3);
        tracker.record_success(false);
        let id = tracker.session().id.clone();

        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        tracker.record_success(false);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());

        assert_eq!(tracker.session().id, id);
        assert!(!tracker.is_establishing());
    }

    #[test]
    fn test_location_change_starts_new_session() {
        let mut tracker = SessionTracker::new(3);
        let id = tracker.session().id.clone();
        tracker.record_success(true);
        assert_ne!(tracker.session().id, id);
        assert_eq!(tracker.session().success_count, 1);
    }
}
