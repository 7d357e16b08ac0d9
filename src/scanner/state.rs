use std::fmt;

/// Runtime state of the decoder. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

impl ScannerState {
    /// True while the user expects the scanner to be on.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ScannerState::Starting | ScannerState::Running | ScannerState::Restarting
        )
    }
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScannerState::Stopped => "stopped",
            ScannerState::Starting => "starting",
            ScannerState::Running => "running",
            ScannerState::Restarting => "restarting",
            ScannerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerEvent {
    StartRequested,
    Attached,
    /// Both facing modes failed to attach.
    AttachFailed,
    HealthLost,
    /// Health was lost again after the one allowed restart.
    RestartExhausted,
    StopRequested,
    Unmounted,
}

/// The single transition function of the scanner state machine.
/// Returns `None` for events that are meaningless in the current state.
pub fn reduce(state: ScannerState, event: ScannerEvent) -> Option<ScannerState> {
    use ScannerEvent as E;
    use ScannerState as S;

    match (state, event) {
        (S::Stopped | S::Failed, E::StartRequested) => Some(S::Starting),
        (S::Starting | S::Restarting, E::Attached) => Some(S::Running),
        (S::Starting | S::Restarting, E::AttachFailed) => Some(S::Failed),
        (S::Running, E::HealthLost) => Some(S::Restarting),
        (S::Running, E::RestartExhausted) => Some(S::Failed),
        (_, E::StopRequested | E::Unmounted) => Some(S::Stopped),
        _ => None,
    }
}

/// What the health probe should do after an unhealthy observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Wait,
    Restart,
    Escalate,
}

/// Bookkeeping that keeps restarts from stacking or looping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartGuard {
    pub consecutive_failures: u32,
    pub in_flight: bool,
    /// A restart was already spent on the current failure streak.
    pub attempted: bool,
}

impl RestartGuard {
    pub fn record_healthy(&mut self) {
        self.consecutive_failures = 0;
        self.attempted = false;
    }

    pub fn record_unhealthy(&mut self, threshold: u32) -> ProbeVerdict {
        self.consecutive_failures += 1;
        if self.consecutive_failures < threshold || self.in_flight {
            return ProbeVerdict::Wait;
        }
        if self.attempted {
            return ProbeVerdict::Escalate;
        }

        self.in_flight = true;
        self.attempted = true;
        self.consecutive_failures = 0;
        ProbeVerdict::Restart
    }

    pub fn finish_restart(&mut self) {
        self.in_flight = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Scanning intent saved across an unmount so the next mount can resume once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanIntent {
    pub wants_scanning_for_session: Option<i64>,
    pub resume_consumed: bool,
}

impl ScanIntent {
    pub fn remember(&mut self, session_id: i64) {
        self.wants_scanning_for_session = Some(session_id);
        self.resume_consumed = false;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Consumes the saved intent. Yields the session only if it is still the
    /// current one; a different session uses the intent up. With no current
    /// session the intent is kept for a later mount.
    pub fn take_resume(&mut self, current_session: Option<i64>) -> Option<i64> {
        if self.resume_consumed {
            return None;
        }
        current_session?;
        self.resume_consumed = true;
        let wanted = self.wants_scanning_for_session.take()?;
        (current_session == Some(wanted)).then_some(wanted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let s = reduce(ScannerState::Stopped, ScannerEvent::StartRequested).unwrap();
        assert_eq!(s, ScannerState::Starting);
        let s = reduce(s, ScannerEvent::Attached).unwrap();
        assert_eq!(s, ScannerState::Running);
        let s = reduce(s, ScannerEvent::HealthLost).unwrap();
        assert_eq!(s, ScannerState::Restarting);
        let s = reduce(s, ScannerEvent::Attached).unwrap();
        assert_eq!(s, ScannerState::Running);
        let s = reduce(s, ScannerEvent::StopRequested).unwrap();
        assert_eq!(s, ScannerState::Stopped);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert_eq!(reduce(ScannerState::Running, ScannerEvent::StartRequested), None);
        assert_eq!(reduce(ScannerState::Stopped, ScannerEvent::Attached), None);
        assert_eq!(reduce(ScannerState::Stopped, ScannerEvent::HealthLost), None);
        assert_eq!(reduce(ScannerState::Restarting, ScannerEvent::HealthLost), None);
    }

    #[test]
    fn failures_are_terminal_until_restarted_by_user() {
        assert_eq!(
            reduce(ScannerState::Restarting, ScannerEvent::AttachFailed),
            Some(ScannerState::Failed)
        );
        assert_eq!(
            reduce(ScannerState::Failed, ScannerEvent::StartRequested),
            Some(ScannerState::Starting)
        );
        assert_eq!(reduce(ScannerState::Failed, ScannerEvent::HealthLost), None);
    }

    #[test]
    fn guard_restarts_once_after_threshold() {
        let mut guard = RestartGuard::default();
        assert_eq!(guard.record_unhealthy(3), ProbeVerdict::Wait);
        assert_eq!(guard.record_unhealthy(3), ProbeVerdict::Wait);
        assert_eq!(guard.record_unhealthy(3), ProbeVerdict::Restart);
        assert!(guard.in_flight);

        // No stacking while the restart is outstanding.
        for _ in 0..5 {
            assert_eq!(guard.record_unhealthy(3), ProbeVerdict::Wait);
        }
        guard.finish_restart();
        guard.consecutive_failures = 0;

        assert_eq!(guard.record_unhealthy(3), ProbeVerdict::Wait);
        assert_eq!(guard.record_unhealthy(3), ProbeVerdict::Wait);
        assert_eq!(guard.record_unhealthy(3), ProbeVerdict::Escalate);
    }

    #[test]
    fn healthy_probe_rearms_restart() {
        let mut guard = RestartGuard::default();
        for _ in 0..3 {
            guard.record_unhealthy(3);
        }
        guard.finish_restart();
        guard.record_healthy();
        assert!(!guard.attempted);

        guard.record_unhealthy(3);
        guard.record_unhealthy(3);
        assert_eq!(guard.record_unhealthy(3), ProbeVerdict::Restart);
    }

    #[test]
    fn intent_resumes_once_for_same_session() {
        let mut intent = ScanIntent::default();
        intent.remember(42);
        assert_eq!(intent.take_resume(Some(42)), Some(42));
        assert_eq!(intent.take_resume(Some(42)), None);

        intent.remember(42);
        assert_eq!(intent.take_resume(Some(7)), None);
        assert_eq!(intent.wants_scanning_for_session, None);
    }

    #[test]
    fn intent_waits_for_a_session() {
        let mut intent = ScanIntent::default();
        intent.remember(42);
        assert_eq!(intent.take_resume(None), None);
        assert_eq!(intent.wants_scanning_for_session, Some(42));
        assert!(!intent.resume_consumed);
        assert_eq!(intent.take_resume(Some(42)), Some(42));
    }
}
