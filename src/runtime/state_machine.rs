//! Pure transition-validity helpers for the session state machine (§4.4),
//! kept separate from the actor so the rules can be unit tested without
//! spinning up a driver or an event log.

use crate::domain::SessionState;

/// Operations that move a session between the top-level states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Terminate,
    Restart,
    Reset,
    Disconnect,
}

/// Whether `op` is legal from `state`, independent of driver behaviour.
/// The actor still re-checks mid-flight conditions (e.g. an in-flight
/// driver init) since those can't be known from the state alone.
pub fn is_allowed(state: &SessionState, op: Transition) -> bool {
    use SessionState::*;
    match op {
        Transition::Start => matches!(state, Created | Error { .. }),
        Transition::Terminate => !state.is_terminal(),
        Transition::Restart => matches!(state, Active { .. } | Error { .. }),
        Transition::Reset => matches!(state, Active { .. } | Error { .. } | Terminated { .. }),
        Transition::Disconnect => matches!(state, Active { .. }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_only_from_created_or_error() {
        assert!(is_allowed(&SessionState::Created, Transition::Start));
        assert!(is_allowed(&SessionState::Error { reason: "x".into() }, Transition::Start));
        assert!(!is_allowed(&SessionState::Active { processing: false, paused_on: None }, Transition::Start));
    }

    #[test]
    fn terminate_blocked_once_terminal() {
        assert!(!is_allowed(&SessionState::Terminated { disposed: false }, Transition::Terminate));
        assert!(is_allowed(&SessionState::Active { processing: true, paused_on: None }, Transition::Terminate));
    }

    #[test]
    fn disconnect_only_while_active() {
        assert!(is_allowed(&SessionState::Active { processing: false, paused_on: None }, Transition::Disconnect));
        assert!(!is_allowed(&SessionState::Created, Transition::Disconnect));
    }
}
