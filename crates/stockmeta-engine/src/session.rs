use stockmeta_contracts::target::{Locator, Target, TargetId};

use crate::error::AutomationError;

pub type StopReason = AutomationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Extracting,
    Generating,
    Filling,
    AwaitingTransition,
    Stopped(StopReason),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Extracting => "extracting",
            Self::Generating => "generating",
            Self::Filling => "filling",
            Self::AwaitingTransition => "awaiting_transition",
            Self::Stopped(_) => "stopped",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Extracting | Self::Generating | Self::Filling | Self::AwaitingTransition
        )
    }
}

/// Orchestration state of the single automation session.
///
/// Fields are only reachable through the transition methods so the
/// invariants below hold after every call:
/// - `awaiting_transition` implies `enabled` and an active target;
/// - no active target implies not `awaiting_transition`.
///
/// `cycle` is a ticket bumped on every step that issues an asynchronous
/// request. It is never reset, so results from an earlier session can not
/// match a later one.
#[derive(Debug, Clone)]
pub struct Session {
    enabled: bool,
    active_target: Option<TargetId>,
    active_location: Option<Locator>,
    awaiting_transition: bool,
    phase: Phase,
    cycle: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            enabled: false,
            active_target: None,
            active_location: None,
            awaiting_transition: false,
            phase: Phase::Idle,
            cycle: 0,
        }
    }
}

impl Session {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn active_target(&self) -> Option<TargetId> {
        self.active_target
    }

    pub fn active_location(&self) -> Option<&Locator> {
        self.active_location.as_ref()
    }

    pub fn awaiting_transition(&self) -> bool {
        self.awaiting_transition
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// True when an asynchronous result for `target`/`cycle` still belongs to
    /// the running session.
    pub fn is_current(&self, target: TargetId, cycle: u64) -> bool {
        self.enabled && self.active_target == Some(target) && self.cycle == cycle
    }

    pub fn owns(&self, target: TargetId) -> bool {
        self.enabled && self.active_target == Some(target)
    }

    /// `enable`: clear everything and start reacting to events.
    pub fn arm(&mut self) {
        self.clear();
        self.enabled = true;
        self.phase = Phase::Idle;
        self.check_invariants();
    }

    /// `disable`: clear everything and stop reacting.
    pub fn disarm(&mut self) {
        self.clear();
        self.enabled = false;
        self.phase = Phase::Idle;
        self.check_invariants();
    }

    /// Terminal stop; `enable` is required to run again.
    pub fn stop(&mut self, reason: StopReason) {
        self.clear();
        self.enabled = false;
        self.phase = Phase::Stopped(reason);
        self.check_invariants();
    }

    pub fn begin(&mut self, target: Target) -> u64 {
        debug_assert!(self.enabled, "begin on a disabled session");
        self.active_target = Some(target.id);
        self.active_location = Some(target.location);
        self.awaiting_transition = false;
        self.phase = Phase::Extracting;
        self.check_invariants();
        self.bump()
    }

    pub fn enter_generating(&mut self) -> u64 {
        self.phase = Phase::Generating;
        self.check_invariants();
        self.bump()
    }

    pub fn enter_filling(&mut self) -> u64 {
        self.phase = Phase::Filling;
        self.check_invariants();
        self.bump()
    }

    pub fn await_transition(&mut self, location: Locator) {
        self.active_location = Some(location);
        self.awaiting_transition = true;
        self.phase = Phase::AwaitingTransition;
        self.check_invariants();
    }

    pub fn confirm_transition(&mut self, location: Locator) -> u64 {
        self.active_location = Some(location);
        self.awaiting_transition = false;
        self.phase = Phase::Extracting;
        self.check_invariants();
        self.bump()
    }

    fn bump(&mut self) -> u64 {
        self.cycle += 1;
        self.cycle
    }

    fn clear(&mut self) {
        self.active_target = None;
        self.active_location = None;
        self.awaiting_transition = false;
    }

    fn check_invariants(&self) {
        debug_assert!(
            !self.awaiting_transition || (self.enabled && self.active_target.is_some()),
            "awaiting transition without an enabled session and target"
        );
        debug_assert!(
            self.active_target.is_some() || !self.awaiting_transition,
            "awaiting transition without a target"
        );
        debug_assert!(
            !self.phase.is_active() || (self.enabled && self.active_target.is_some()),
            "active phase without an enabled session and target"
        );
    }
}

#[cfg(test)]
mod tests {
    use stockmeta_contracts::target::{Locator, Target, TargetId};

    use super::{Phase, Session};
    use crate::error::AutomationError;

    fn target() -> Target {
        Target {
            id: TargetId(7),
            location: Locator::new("https://www.dreamstime.com/upload"),
        }
    }

    #[test]
    fn stop_resets_fields_and_keeps_reason() {
        let mut session = Session::default();
        session.arm();
        session.begin(target());
        session.enter_generating();
        session.enter_filling();
        session.await_transition(Locator::new("https://www.dreamstime.com/upload/edit1"));
        assert!(session.awaiting_transition());

        session.stop(AutomationError::SubmitFailed);
        assert!(!session.enabled());
        assert!(!session.awaiting_transition());
        assert_eq!(session.active_target(), None);
        assert_eq!(session.active_location(), None);
        assert_eq!(session.phase(), &Phase::Stopped(AutomationError::SubmitFailed));
    }

    #[test]
    fn cycle_ticket_survives_rearming() {
        let mut session = Session::default();
        session.arm();
        let first = session.begin(target());
        assert!(session.is_current(TargetId(7), first));

        session.arm();
        assert!(!session.is_current(TargetId(7), first));
        let second = session.begin(target());
        assert!(second > first);
    }

    #[test]
    fn disabled_session_owns_nothing() {
        let mut session = Session::default();
        session.arm();
        let cycle = session.begin(target());
        session.disarm();
        assert!(!session.owns(TargetId(7)));
        assert!(!session.is_current(TargetId(7), cycle));
        assert_eq!(session.phase(), &Phase::Idle);
    }
}
