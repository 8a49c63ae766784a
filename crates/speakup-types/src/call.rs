//! Two-party call state machines.
//!
//! `CallState` is the server-side life of one `CallSession`; `CallPhase` is
//! what a single participant sees. Both treat out-of-order actions as no-ops
//! so a stale or duplicated command can never corrupt state.

use serde::{Deserialize, Serialize};

use crate::models::CallStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Connecting,
    InCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Accept,
    Reject,
    Connected,
    HangUp,
    Timeout,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Rejected,
    TimedOut,
    HungUp,
    Dropped,
    Busy,
    /// Accepted, but neither side reported a transport in time.
    ConnectFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved(CallState),
    Finished(EndReason),
    Ignored,
}

impl CallState {
    pub fn next(self, action: CallAction) -> Transition {
        use CallAction as A;
        use CallState as S;

        match (self, action) {
            (S::Ringing, A::Accept) => Transition::Moved(S::Connecting),
            (S::Ringing, A::Reject) => Transition::Finished(EndReason::Rejected),
            (S::Ringing, A::Timeout) => Transition::Finished(EndReason::TimedOut),
            (S::Connecting, A::Connected) => Transition::Moved(S::InCall),
            (S::Connecting, A::Timeout) => Transition::Finished(EndReason::ConnectFailed),
            (_, A::HangUp) => Transition::Finished(EndReason::HungUp),
            (_, A::Drop) => Transition::Finished(EndReason::Dropped),
            _ => Transition::Ignored,
        }
    }

    /// Presence projection of a live session state.
    pub fn status(self) -> CallStatus {
        match self {
            Self::Ringing => CallStatus::Ringing,
            Self::Connecting => CallStatus::Connecting,
            Self::InCall => CallStatus::InCall,
        }
    }
}

/// One participant's view of its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    #[default]
    Idle,
    RingingOutgoing,
    RingingIncoming,
    Connecting,
    InCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyAction {
    Invite,
    IncomingInvite,
    Accept,
    PeerAccepted,
    Reject,
    PeerRejected,
    Busy,
    Connected,
    HangUp,
    Timeout,
    Dropped,
}

impl CallPhase {
    pub fn apply(self, action: PartyAction) -> CallPhase {
        use CallPhase as P;
        use PartyAction as A;

        match (self, action) {
            (P::Idle, A::Invite) => P::RingingOutgoing,
            (P::Idle, A::IncomingInvite) => P::RingingIncoming,
            (P::RingingIncoming, A::Accept) => P::Connecting,
            (P::RingingOutgoing, A::PeerAccepted) => P::Connecting,
            (P::RingingIncoming, A::Reject) => P::Idle,
            (P::RingingOutgoing, A::PeerRejected | A::Busy) => P::Idle,
            (P::RingingOutgoing | P::RingingIncoming | P::Connecting, A::Timeout) => P::Idle,
            (P::Connecting, A::Connected) => P::InCall,
            (_, A::HangUp | A::Dropped) => P::Idle,
            (phase, _) => phase,
        }
    }

    pub fn is_busy(self) -> bool {
        self != Self::Idle
    }

    /// Presence projection. An incoming ring is not published: the callee
    /// has no transport address until it accepts.
    pub fn status(self) -> CallStatus {
        match self {
            Self::Idle | Self::RingingIncoming => CallStatus::Idle,
            Self::RingingOutgoing => CallStatus::Ringing,
            Self::Connecting => CallStatus::Connecting,
            Self::InCall => CallStatus::InCall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_only_accepts_invites() {
        let idle = CallPhase::Idle;
        for action in [
            PartyAction::Accept,
            PartyAction::Reject,
            PartyAction::PeerAccepted,
            PartyAction::PeerRejected,
            PartyAction::Connected,
            PartyAction::HangUp,
            PartyAction::Timeout,
        ] {
            assert_eq!(idle.apply(action), CallPhase::Idle, "{:?}", action);
        }
        assert_eq!(idle.apply(PartyAction::Invite), CallPhase::RingingOutgoing);
        assert_eq!(idle.apply(PartyAction::IncomingInvite), CallPhase::RingingIncoming);
    }

    #[test]
    fn caller_and_callee_converge_on_in_call() {
        let caller = CallPhase::Idle
            .apply(PartyAction::Invite)
            .apply(PartyAction::PeerAccepted)
            .apply(PartyAction::Connected);
        let callee = CallPhase::Idle
            .apply(PartyAction::IncomingInvite)
            .apply(PartyAction::Accept)
            .apply(PartyAction::Connected);
        assert_eq!(caller, CallPhase::InCall);
        assert_eq!(callee, CallPhase::InCall);
        assert_eq!(caller.status(), CallStatus::InCall);
    }

    #[test]
    fn busy_callee_keeps_its_call() {
        let callee = CallPhase::InCall;
        assert_eq!(callee.apply(PartyAction::IncomingInvite), CallPhase::InCall);

        let caller = CallPhase::RingingOutgoing.apply(PartyAction::Busy);
        assert_eq!(caller, CallPhase::Idle);
    }

    #[test]
    fn stalled_connect_times_out() {
        assert_eq!(CallPhase::Connecting.apply(PartyAction::Timeout), CallPhase::Idle);
        assert_eq!(CallPhase::InCall.apply(PartyAction::Timeout), CallPhase::InCall);
    }

    #[test]
    fn ringing_callee_is_not_published() {
        assert_eq!(CallPhase::RingingIncoming.status(), CallStatus::Idle);
        assert_eq!(CallPhase::RingingOutgoing.status(), CallStatus::Ringing);
    }

    #[test]
    fn session_transitions() {
        assert_eq!(
            CallState::Ringing.next(CallAction::Accept),
            Transition::Moved(CallState::Connecting)
        );
        assert_eq!(
            CallState::Ringing.next(CallAction::Timeout),
            Transition::Finished(EndReason::TimedOut)
        );
        assert_eq!(CallState::Ringing.next(CallAction::Connected), Transition::Ignored);
        assert_eq!(CallState::InCall.next(CallAction::Accept), Transition::Ignored);
        assert_eq!(CallState::InCall.next(CallAction::Timeout), Transition::Ignored);
        assert_eq!(
            CallState::Connecting.next(CallAction::Timeout),
            Transition::Finished(EndReason::ConnectFailed)
        );
        assert_eq!(
            CallState::Connecting.next(CallAction::Drop),
            Transition::Finished(EndReason::Dropped)
        );
    }
}
