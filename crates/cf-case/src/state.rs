//! Case and stage state enums with their legal transition tables.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Overall readiness of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseState {
    /// Waiting on cached file data.
    Loading,
    /// Folder content matches no known case structure.
    Invalid,
    Ready,
    /// Terminal. The folder is gone or the case was killed.
    Defunct,
    Error,
    /// Waiting on the remote platform to answer a mutating operation.
    AgaveInvoke,
}

impl CaseState {
    pub const ALL: [CaseState; 6] = [
        CaseState::Loading,
        CaseState::Invalid,
        CaseState::Ready,
        CaseState::Defunct,
        CaseState::Error,
        CaseState::AgaveInvoke,
    ];

    pub fn legal_targets(&self) -> &'static [CaseState] {
        use CaseState::*;
        match self {
            Loading => &[Ready, Invalid, AgaveInvoke, Error, Defunct],
            Invalid => &[Loading, Ready, Error, Defunct],
            Ready => &[Loading, Invalid, AgaveInvoke, Error, Defunct],
            Error => &[Loading, Ready, Invalid, AgaveInvoke, Defunct],
            AgaveInvoke => &[Ready, Error, Loading, Invalid, Defunct],
            Defunct => &[],
        }
    }

    pub fn can_transition_to(&self, target: CaseState) -> bool {
        self.legal_targets().contains(&target)
    }

    /// True while the case waits on something outside the user's control.
    pub fn is_transitional(&self) -> bool {
        matches!(self, CaseState::Loading | CaseState::AgaveInvoke)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaseState::Loading => "LOADING",
            CaseState::Invalid => "INVALID",
            CaseState::Ready => "READY",
            CaseState::Defunct => "DEFUNCT",
            CaseState::Error => "ERROR",
            CaseState::AgaveInvoke => "AGAVE_INVOKE",
        }
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run state of one pipeline stage.
///
/// - `Unrun`: parameters editable, stage may be run
/// - `Loading`: parameters frozen, nothing available
/// - `Running`: parameters frozen
/// - `Finished`: results viewable, rollback available
/// - `Error`: only rollback available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Unrun,
    Running,
    Finished,
    Loading,
    Error,
}

impl StageState {
    pub const ALL: [StageState; 5] = [
        StageState::Unrun,
        StageState::Running,
        StageState::Finished,
        StageState::Loading,
        StageState::Error,
    ];

    pub fn legal_targets(&self) -> &'static [StageState] {
        use StageState::*;
        match self {
            Unrun => &[Running, Loading, Finished, Error],
            Running => &[Finished, Error, Unrun, Loading],
            Finished => &[Unrun, Error, Loading],
            Loading => &[Unrun, Running, Finished, Error],
            Error => &[Unrun, Loading, Running, Finished],
        }
    }

    pub fn can_transition_to(&self, target: StageState) -> bool {
        self.legal_targets().contains(&target)
    }

    pub fn params_editable(&self) -> bool {
        matches!(self, StageState::Unrun)
    }

    pub fn can_roll_back(&self) -> bool {
        matches!(self, StageState::Finished | StageState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Unrun => "UNRUN",
            StageState::Running => "RUNNING",
            StageState::Finished => "FINISHED",
            StageState::Loading => "LOADING",
            StageState::Error => "ERROR",
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn defunct_is_terminal() {
        for target in CaseState::ALL {
            assert!(!CaseState::Defunct.can_transition_to(target));
        }
    }

    #[test]
    fn every_live_state_can_die_or_fail() {
        for state in CaseState::ALL {
            if state == CaseState::Defunct {
                continue;
            }
            assert!(state.can_transition_to(CaseState::Defunct), "{state}");
            if state != CaseState::Error {
                assert!(state.can_transition_to(CaseState::Error), "{state}");
            }
        }
    }

    #[test]
    fn agave_invoke_resolves_to_ready_or_error() {
        assert!(CaseState::AgaveInvoke.can_transition_to(CaseState::Ready));
        assert!(CaseState::AgaveInvoke.can_transition_to(CaseState::Error));
    }

    #[test]
    fn invalid_case_cannot_start_remote_work() {
        assert!(!CaseState::Invalid.can_transition_to(CaseState::AgaveInvoke));
    }

    #[test]
    fn no_self_transitions_in_tables() {
        for state in CaseState::ALL {
            assert!(!state.can_transition_to(state));
        }
        for state in StageState::ALL {
            assert!(!state.can_transition_to(state));
        }
    }

    #[test]
    fn finished_stage_must_roll_back_before_rerun() {
        assert!(!StageState::Finished.can_transition_to(StageState::Running));
        assert!(StageState::Finished.can_transition_to(StageState::Unrun));
        assert!(StageState::Error.can_transition_to(StageState::Running));
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(CaseState::AgaveInvoke.to_string(), "AGAVE_INVOKE");
        assert_eq!(StageState::Unrun.to_string(), "UNRUN");
    }

    fn any_case_state() -> impl Strategy<Value = CaseState> {
        proptest::sample::select(CaseState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn walks_through_table_never_leave_defunct(
            start in any_case_state(),
            attempts in proptest::collection::vec(any_case_state(), 0..40),
        ) {
            let mut current = start;
            let mut dead = current == CaseState::Defunct;
            for target in attempts {
                if current.can_transition_to(target) {
                    current = target;
                }
                if dead {
                    prop_assert_eq!(current, CaseState::Defunct);
                }
                dead |= current == CaseState::Defunct;
            }
        }
    }
}
