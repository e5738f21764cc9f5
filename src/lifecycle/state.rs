//! Lifecycle states, their legal transitions, and exit policies.

use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

/// Phase of one environment session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LifecycleState {
    /// Nothing acquired yet.
    Absent,
    /// Creating credential, policy, and instance.
    Acquiring,
    /// Instance running; not yet reachable.
    Running,
    /// Retrying the control channel.
    Connecting,
    /// Control channel established; collaborators running.
    Active,
    /// Walking the cleanup ledger.
    Releasing,
    /// Teardown finished.
    Released,
    /// A phase failed before release began.
    Error,
}

impl LifecycleState {
    /// Returns `true` for states with no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Released)
    }

    /// Returns `true` when moving from `self` to `next` is legal.
    ///
    /// `Error` is reachable from every non-terminal state and `Releasing`
    /// from every state that may own resources.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::{
            Absent, Acquiring, Active, Connecting, Error, Released, Releasing, Running,
        };
        match (self, next) {
            (Released, _) => false,
            (_, Error) => !matches!(self, Error),
            (Absent, Acquiring)
            | (Acquiring, Running)
            | (Running, Connecting)
            | (Connecting, Active)
            | (Releasing, Released) => true,
            (Acquiring | Running | Connecting | Active | Error, Releasing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::Acquiring => "acquiring",
            Self::Running => "running",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Releasing => "releasing",
            Self::Released => "released",
            Self::Error => "error",
        })
    }
}

/// Raised for transitions the state machine does not allow.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("invalid lifecycle transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Current state.
    pub from: LifecycleState,
    /// Requested state.
    pub to: LifecycleState,
}

/// Single writer of the lifecycle state.
#[derive(Clone, Debug)]
pub struct StateMachine {
    current: LifecycleState,
    history: Vec<LifecycleState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: LifecycleState::Absent,
            history: vec![LifecycleState::Absent],
        }
    }
}

impl StateMachine {
    /// Starts in [`LifecycleState::Absent`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub const fn current(&self) -> LifecycleState {
        self.current
    }

    /// Every state visited, in order.
    #[must_use]
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves the state unchanged when the
    /// move is not allowed.
    pub fn advance(&mut self, next: LifecycleState) -> Result<(), InvalidTransition> {
        if !self.current.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        debug!(from = %self.current, to = %next, "lifecycle transition");
        self.current = next;
        self.history.push(next);
        Ok(())
    }

    /// Enters [`LifecycleState::Releasing`] once.
    ///
    /// Returns `false` when release already began or finished, so a second
    /// request never starts a second teardown.
    pub fn begin_release(&mut self) -> bool {
        self.advance(LifecycleState::Releasing).is_ok()
    }
}

/// What happens to the environment when a session ends.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OnExit {
    /// Power off the instance; keep credential and policy for the next run.
    #[default]
    Stop,
    /// Release every resource in the ledger.
    Terminate,
    /// Leave everything running; forget the local session only.
    KeepRunning,
}

impl OnExit {
    /// Every policy, in prompt order.
    pub const ALL: [Self; 3] = [Self::Stop, Self::Terminate, Self::KeepRunning];

    /// Parses a policy name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "stop" => Some(Self::Stop),
            "terminate" => Some(Self::Terminate),
            "keep-running" | "keep" => Some(Self::KeepRunning),
            _ => None,
        }
    }

    /// Parses a policy name, resolving unknown values to [`OnExit::Stop`].
    ///
    /// A typo must never escalate to a destructive teardown.
    #[must_use]
    pub fn parse_or_stop(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|| {
            warn!(value = raw, "unrecognised on_exit value, using stop");
            Self::Stop
        })
    }

    /// Policy name as accepted by [`OnExit::parse`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Terminate => "terminate",
            Self::KeepRunning => "keep-running",
        }
    }
}

impl fmt::Display for OnExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::LifecycleState::{
        Absent, Acquiring, Active, Connecting, Error, Released, Releasing, Running,
    };
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let mut machine = StateMachine::new();
        for next in [Acquiring, Running, Connecting, Active, Releasing, Released] {
            machine
                .advance(next)
                .unwrap_or_else(|err| panic!("{err}"));
        }
        assert_eq!(machine.current(), Released);
        assert_eq!(machine.history().len(), 7);
    }

    #[rstest]
    #[case(Absent, Running)]
    #[case(Acquiring, Active)]
    #[case(Active, Acquiring)]
    #[case(Released, Acquiring)]
    #[case(Released, Error)]
    #[case(Absent, Releasing)]
    fn illegal_transitions_are_rejected(#[case] from: LifecycleState, #[case] to: LifecycleState) {
        assert!(!from.can_transition_to(to));
    }

    #[rstest]
    #[case(Acquiring)]
    #[case(Running)]
    #[case(Connecting)]
    #[case(Active)]
    fn error_and_release_reachable_from_working_states(#[case] from: LifecycleState) {
        assert!(from.can_transition_to(Error));
        assert!(from.can_transition_to(Releasing));
    }

    #[test]
    fn invalid_advance_leaves_state_unchanged() {
        let mut machine = StateMachine::new();
        let err = machine.advance(Active);
        assert_eq!(
            err,
            Err(InvalidTransition {
                from: Absent,
                to: Active
            })
        );
        assert_eq!(machine.current(), Absent);
    }

    #[test]
    fn release_begins_exactly_once() {
        let mut machine = StateMachine::new();
        machine
            .advance(Acquiring)
            .unwrap_or_else(|err| panic!("{err}"));

        assert!(machine.begin_release());
        assert!(!machine.begin_release());
        assert_eq!(
            machine
                .history()
                .iter()
                .filter(|state| **state == Releasing)
                .count(),
            1
        );
    }

    #[rstest]
    #[case("stop", Some(OnExit::Stop))]
    #[case(" Terminate ", Some(OnExit::Terminate))]
    #[case("keep_running", Some(OnExit::KeepRunning))]
    #[case("nuke", None)]
    fn on_exit_parses_known_values(#[case] raw: &str, #[case] expected: Option<OnExit>) {
        assert_eq!(OnExit::parse(raw), expected);
    }

    #[test]
    fn unknown_on_exit_never_escalates_to_terminate() {
        assert_eq!(OnExit::parse_or_stop("terminate-all"), OnExit::Stop);
    }
}
