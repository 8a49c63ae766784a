//! Call signaling.
//!
//! `CallRegistry` owns every live `CallSession` and is pure: each operation
//! returns the `CallEffects` (targeted events, presence projections, ended
//! sessions) that `CallService` then delivers. The registry lock is never
//! held across an await; `CallService` serializes each change with the
//! delivery of its effects so presence writes land in registry order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use speakup_db::Database;
use speakup_types::call::{CallAction, CallPhase, CallState, EndReason, Transition};
use speakup_types::events::{CallEvent, GatewayEvent, SignalPayload};
use speakup_types::models::{CallStatus, NotificationKind};

use crate::dispatcher::Dispatcher;
use crate::notifications::notify;
use crate::presence::PresenceStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("cannot call yourself")]
    SelfCall,
    #[error("you are already in a call")]
    CallerBusy,
    #[error("user is offline")]
    CalleeOffline,
    #[error("user is busy")]
    CalleeBusy,
    #[error("call not found")]
    NotFound,
    #[error("not a participant of this call")]
    NotParticipant,
    #[error("only the callee can answer")]
    NotCallee,
    #[error("call is {0:?}")]
    InvalidState(CallState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSession {
    pub call_id: Uuid,
    pub caller_id: Uuid,
    pub callee_id: Uuid,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub ring_deadline: DateTime<Utc>,
    pub connect_deadline: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub room_code: Option<String>,
    pub caller_peer_id: String,
    pub callee_peer_id: Option<String>,
    pub muted: HashSet<Uuid>,
}

impl CallSession {
    pub fn other(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.caller_id {
            Some(self.callee_id)
        } else if user_id == self.callee_id {
            Some(self.caller_id)
        } else {
            None
        }
    }

    pub fn phase_of(&self, user_id: Uuid) -> CallPhase {
        match self.state {
            CallState::Ringing if user_id == self.caller_id => CallPhase::RingingOutgoing,
            CallState::Ringing if user_id == self.callee_id => CallPhase::RingingIncoming,
            CallState::Connecting if self.other(user_id).is_some() => CallPhase::Connecting,
            CallState::InCall if self.other(user_id).is_some() => CallPhase::InCall,
            _ => CallPhase::Idle,
        }
    }

    pub fn peer_id_of(&self, user_id: Uuid) -> Option<&str> {
        if user_id == self.caller_id {
            Some(&self.caller_peer_id)
        } else if user_id == self.callee_id {
            self.callee_peer_id.as_deref()
        } else {
            None
        }
    }

    fn projection(&self, user_id: Uuid) -> PresenceProjection {
        PresenceProjection {
            user_id,
            status: self.phase_of(user_id).status(),
            peer_id: self.peer_id_of(user_id).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceProjection {
    pub user_id: Uuid,
    pub status: CallStatus,
    pub peer_id: Option<String>,
}

/// What an operation wants the outside world to see.
#[derive(Debug, Default)]
pub struct CallEffects {
    pub deliveries: Vec<(Uuid, CallEvent)>,
    pub presence: Vec<PresenceProjection>,
    pub ended: Option<(CallSession, EndReason)>,
}

impl CallEffects {
    fn deliver(&mut self, user_id: Uuid, event: CallEvent) {
        self.deliveries.push((user_id, event));
    }

    pub fn events_for(&self, user_id: Uuid) -> Vec<&CallEvent> {
        self.deliveries
            .iter()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, event)| event)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct CallRegistry {
    sessions: HashMap<Uuid, CallSession>,
    by_user: HashMap<Uuid, Uuid>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, call_id: Uuid) -> Option<&CallSession> {
        self.sessions.get(&call_id)
    }

    pub fn session_of(&self, user_id: Uuid) -> Option<&CallSession> {
        self.by_user
            .get(&user_id)
            .and_then(|call_id| self.sessions.get(call_id))
    }

    pub fn phase_of(&self, user_id: Uuid) -> CallPhase {
        self.session_of(user_id)
            .map(|s| s.phase_of(user_id))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn invite(
        &mut self,
        caller_id: Uuid,
        caller_name: &str,
        callee_id: Uuid,
        caller_peer_id: String,
        room_code: Option<String>,
        now: DateTime<Utc>,
        ring_timeout: Duration,
    ) -> Result<CallEffects, CallError> {
        if caller_id == callee_id {
            return Err(CallError::SelfCall);
        }
        if self.by_user.contains_key(&caller_id) {
            return Err(CallError::CallerBusy);
        }

        // A busy callee keeps their call untouched.
        if self.phase_of(callee_id).is_busy() {
            return Err(CallError::CalleeBusy);
        }

        let call_id = Uuid::new_v4();
        let mut effects = CallEffects::default();
        let ring_deadline = deadline(now, ring_timeout);
        let session = CallSession {
            call_id,
            caller_id,
            callee_id,
            state: CallState::Ringing,
            created_at: now,
            ring_deadline,
            connect_deadline: None,
            started_at: None,
            room_code: room_code.clone(),
            caller_peer_id,
            callee_peer_id: None,
            muted: HashSet::new(),
        };

        effects.deliver(
            caller_id,
            CallEvent::Ringing {
                call_id,
                to_user_id: callee_id,
                expires_at: ring_deadline,
            },
        );
        effects.deliver(
            callee_id,
            CallEvent::Incoming {
                call_id,
                from_user_id: caller_id,
                from_username: caller_name.to_string(),
                room_code,
                expires_at: ring_deadline,
            },
        );
        effects.presence.push(session.projection(caller_id));

        self.by_user.insert(caller_id, call_id);
        self.by_user.insert(callee_id, call_id);
        self.sessions.insert(call_id, session);
        Ok(effects)
    }

    pub fn accept(
        &mut self,
        user_id: Uuid,
        call_id: Uuid,
        peer_id: String,
        now: DateTime<Utc>,
        connect_timeout: Duration,
    ) -> Result<CallEffects, CallError> {
        let session = self.participant_session_mut(user_id, call_id)?;
        if session.callee_id != user_id {
            return Err(CallError::NotCallee);
        }
        let Transition::Moved(next) = session.state.next(CallAction::Accept) else {
            return Err(CallError::InvalidState(session.state));
        };
        session.state = next;
        session.callee_peer_id = Some(peer_id.clone());
        session.connect_deadline = Some(deadline(now, connect_timeout));

        let mut effects = CallEffects::default();
        effects.deliver(
            session.caller_id,
            CallEvent::Accepted {
                call_id,
                peer_id,
            },
        );
        effects.deliver(
            session.callee_id,
            CallEvent::Accepted {
                call_id,
                peer_id: session.caller_peer_id.clone(),
            },
        );
        effects.presence.push(session.projection(session.caller_id));
        effects.presence.push(session.projection(session.callee_id));
        Ok(effects)
    }

    /// Either side reports its transport connected. The first report moves
    /// the call to in-call; later reports are accepted as no-ops.
    pub fn connected(
        &mut self,
        user_id: Uuid,
        call_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CallEffects, CallError> {
        let session = self.participant_session_mut(user_id, call_id)?;
        let mut effects = CallEffects::default();
        match session.state.next(CallAction::Connected) {
            Transition::Moved(next) => {
                session.state = next;
                session.started_at = Some(now);
                for party in [session.caller_id, session.callee_id] {
                    effects.deliver(
                        party,
                        CallEvent::Connected {
                            call_id,
                            started_at: now,
                        },
                    );
                    effects.presence.push(session.projection(party));
                }
                Ok(effects)
            }
            Transition::Ignored if session.state == CallState::InCall => Ok(effects),
            _ => Err(CallError::InvalidState(session.state)),
        }
    }

    pub fn reject(&mut self, user_id: Uuid, call_id: Uuid) -> Result<CallEffects, CallError> {
        let session = self.participant_session_mut(user_id, call_id)?;
        if session.callee_id != user_id {
            return Err(CallError::NotCallee);
        }
        let state = session.state;
        match state.next(CallAction::Reject) {
            Transition::Finished(reason) => Ok(self.finish(call_id, reason, Some(user_id))),
            _ => Err(CallError::InvalidState(state)),
        }
    }

    pub fn hang_up(&mut self, user_id: Uuid, call_id: Uuid) -> Result<CallEffects, CallError> {
        let state = self.participant_session_mut(user_id, call_id)?.state;
        match state.next(CallAction::HangUp) {
            Transition::Finished(reason) => Ok(self.finish(call_id, reason, Some(user_id))),
            _ => Err(CallError::InvalidState(state)),
        }
    }

    /// Local mute toggle, surfaced to the other party. The call state is
    /// unchanged.
    pub fn toggle_mute(
        &mut self,
        user_id: Uuid,
        call_id: Uuid,
        muted: bool,
    ) -> Result<CallEffects, CallError> {
        let session = self.participant_session_mut(user_id, call_id)?;
        if session.state == CallState::Ringing {
            return Err(CallError::InvalidState(session.state));
        }
        if muted {
            session.muted.insert(user_id);
        } else {
            session.muted.remove(&user_id);
        }

        let mut effects = CallEffects::default();
        if let Some(other) = session.other(user_id) {
            effects.deliver(
                other,
                CallEvent::MuteChanged {
                    call_id,
                    user_id,
                    muted,
                },
            );
        }
        Ok(effects)
    }

    /// SDP and ICE only flow once the callee has accepted.
    pub fn relay_signal(
        &mut self,
        user_id: Uuid,
        call_id: Uuid,
        signal: SignalPayload,
    ) -> Result<CallEffects, CallError> {
        let session = self.participant_session_mut(user_id, call_id)?;
        if session.state == CallState::Ringing {
            return Err(CallError::InvalidState(session.state));
        }

        let mut effects = CallEffects::default();
        if let Some(other) = session.other(user_id) {
            effects.deliver(
                other,
                CallEvent::Signal {
                    call_id,
                    from_user_id: user_id,
                    signal,
                },
            );
        }
        Ok(effects)
    }

    /// End every unanswered call past its ring deadline and every accepted
    /// call that never connected before its connect deadline.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<CallEffects> {
        let due: Vec<(Uuid, EndReason)> = self
            .sessions
            .values()
            .filter_map(|s| {
                let deadline = match s.state {
                    CallState::Ringing => s.ring_deadline,
                    CallState::Connecting => s.connect_deadline?,
                    CallState::InCall => return None,
                };
                if deadline > now {
                    return None;
                }
                match s.state.next(CallAction::Timeout) {
                    Transition::Finished(reason) => Some((s.call_id, reason)),
                    _ => None,
                }
            })
            .collect();

        due.into_iter()
            .map(|(call_id, reason)| self.finish(call_id, reason, None))
            .collect()
    }

    /// The user's connection went away.
    pub fn drop_user(&mut self, user_id: Uuid) -> Option<CallEffects> {
        let call_id = *self.by_user.get(&user_id)?;
        Some(self.finish(call_id, EndReason::Dropped, Some(user_id)))
    }

    fn participant_session_mut(
        &mut self,
        user_id: Uuid,
        call_id: Uuid,
    ) -> Result<&mut CallSession, CallError> {
        let session = self.sessions.get_mut(&call_id).ok_or(CallError::NotFound)?;
        if session.other(user_id).is_none() {
            return Err(CallError::NotParticipant);
        }
        Ok(session)
    }

    /// Remove the session and tell everyone but `actor` why it ended.
    fn finish(&mut self, call_id: Uuid, reason: EndReason, actor: Option<Uuid>) -> CallEffects {
        let mut effects = CallEffects::default();
        let Some(session) = self.sessions.remove(&call_id) else {
            return effects;
        };

        for party in [session.caller_id, session.callee_id] {
            self.by_user.remove(&party);

            if session.phase_of(party).status() != CallStatus::Idle {
                effects.presence.push(PresenceProjection {
                    user_id: party,
                    status: CallStatus::Idle,
                    peer_id: None,
                });
            }
            if Some(party) != actor {
                effects.deliver(party, CallEvent::Ended { call_id, reason });
            }
        }

        effects.ended = Some((session, reason));
        effects
    }
}

fn deadline(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

/// Delivers registry effects: targeted events, presence projection writes,
/// missed-call notifications.
#[derive(Clone)]
pub struct CallService {
    registry: Arc<Mutex<CallRegistry>>,
    /// Held from a registry change until its effects are delivered.
    gate: Arc<tokio::sync::Mutex<()>>,
    db: Arc<Database>,
    dispatcher: Dispatcher,
    presence: PresenceStore,
    ring_timeout: Duration,
    connect_timeout: Duration,
    missed_call_notifications: bool,
}

impl CallService {
    pub fn new(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        presence: PresenceStore,
        ring_timeout: Duration,
        connect_timeout: Duration,
        missed_call_notifications: bool,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(CallRegistry::new())),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            db,
            dispatcher,
            presence,
            ring_timeout,
            connect_timeout,
            missed_call_notifications,
        }
    }

    fn with_registry<T>(&self, f: impl FnOnce(&mut CallRegistry) -> T) -> T {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut registry)
    }

    pub fn phase_of(&self, user_id: Uuid) -> CallPhase {
        self.with_registry(|r| r.phase_of(user_id))
    }

    pub fn session_of(&self, user_id: Uuid) -> Option<CallSession> {
        self.with_registry(|r| r.session_of(user_id).cloned())
    }

    pub async fn initiate_call(
        &self,
        caller_id: Uuid,
        caller_name: &str,
        target_user_id: Uuid,
        peer_id: String,
        room_code: Option<String>,
    ) -> Result<Uuid, CallError> {
        if caller_id != target_user_id && !self.dispatcher.is_connected(target_user_id).await {
            return Err(CallError::CalleeOffline);
        }
        let ring_timeout = self.ring_timeout;
        let _gate = self.gate.lock().await;
        let invited = self.with_registry(|r| {
            r.invite(
                caller_id,
                caller_name,
                target_user_id,
                peer_id,
                room_code,
                Utc::now(),
                ring_timeout,
            )
        });
        let effects = match invited {
            Ok(effects) => effects,
            Err(CallError::CalleeBusy) => {
                info!("{} called {} who is busy", caller_id, target_user_id);
                let busy = CallEvent::Ended {
                    call_id: Uuid::new_v4(),
                    reason: EndReason::Busy,
                };
                self.dispatcher
                    .send_to_user(caller_id, GatewayEvent::Call(busy))
                    .await;
                return Err(CallError::CalleeBusy);
            }
            Err(e) => return Err(e),
        };
        let call_id = effects
            .deliveries
            .first()
            .map(|(_, event)| event.call_id())
            .unwrap_or_default();
        info!("{} invited {} (call {})", caller_id, target_user_id, call_id);
        self.apply(effects).await;
        Ok(call_id)
    }

    pub async fn answer_call(
        &self,
        user_id: Uuid,
        call_id: Uuid,
        peer_id: String,
    ) -> Result<(), CallError> {
        let connect_timeout = self.connect_timeout;
        let _gate = self.gate.lock().await;
        let effects = self.with_registry(|r| {
            r.accept(user_id, call_id, peer_id, Utc::now(), connect_timeout)
        })?;
        info!("{} accepted call {}", user_id, call_id);
        self.apply(effects).await;
        Ok(())
    }

    pub async fn reject_call(&self, user_id: Uuid, call_id: Uuid) -> Result<(), CallError> {
        let _gate = self.gate.lock().await;
        let effects = self.with_registry(|r| r.reject(user_id, call_id))?;
        info!("{} rejected call {}", user_id, call_id);
        self.apply(effects).await;
        Ok(())
    }

    pub async fn mark_connected(&self, user_id: Uuid, call_id: Uuid) -> Result<(), CallError> {
        let _gate = self.gate.lock().await;
        let effects = self.with_registry(|r| r.connected(user_id, call_id, Utc::now()))?;
        self.apply(effects).await;
        Ok(())
    }

    pub async fn end_call(&self, user_id: Uuid, call_id: Uuid) -> Result<(), CallError> {
        let _gate = self.gate.lock().await;
        let effects = self.with_registry(|r| r.hang_up(user_id, call_id))?;
        info!("{} ended call {}", user_id, call_id);
        self.apply(effects).await;
        Ok(())
    }

    pub async fn toggle_mute(
        &self,
        user_id: Uuid,
        call_id: Uuid,
        muted: bool,
    ) -> Result<(), CallError> {
        let _gate = self.gate.lock().await;
        let effects = self.with_registry(|r| r.toggle_mute(user_id, call_id, muted))?;
        self.apply(effects).await;
        Ok(())
    }

    pub async fn relay_signal(
        &self,
        user_id: Uuid,
        call_id: Uuid,
        signal: SignalPayload,
    ) -> Result<(), CallError> {
        let _gate = self.gate.lock().await;
        let effects = self.with_registry(|r| r.relay_signal(user_id, call_id, signal))?;
        self.apply(effects).await;
        Ok(())
    }

    /// Expire unanswered invites and stalled connects. Returns how many
    /// calls ended.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> usize {
        let _gate = self.gate.lock().await;
        let expired = self.with_registry(|r| r.expire(now));
        let count = expired.len();
        for effects in expired {
            self.apply(effects).await;
        }
        count
    }

    pub async fn user_disconnected(&self, user_id: Uuid) {
        let _gate = self.gate.lock().await;
        if let Some(effects) = self.with_registry(|r| r.drop_user(user_id)) {
            info!("{} dropped out of a call", user_id);
            self.apply(effects).await;
        }
    }

    async fn apply(&self, effects: CallEffects) {
        for (user_id, event) in effects.deliveries {
            self.dispatcher
                .send_to_user(user_id, GatewayEvent::Call(event))
                .await;
        }

        for projection in effects.presence {
            self.presence
                .set_call_status(projection.user_id, projection.status, projection.peer_id)
                .await;
        }

        if let Some((session, EndReason::TimedOut)) = effects.ended {
            info!("Call {} timed out unanswered", session.call_id);
            if self.missed_call_notifications {
                if let Err(e) = notify(
                    &self.db,
                    &self.dispatcher,
                    session.callee_id,
                    session.caller_id,
                    NotificationKind::MissedCall,
                    None,
                )
                .await
                {
                    warn!("Missed-call notification for {} failed: {}", session.callee_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RING: Duration = Duration::from_secs(30);

    fn ids() -> (Uuid, Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
    }

    fn invite(registry: &mut CallRegistry, from: Uuid, to: Uuid) -> Uuid {
        let effects = registry
            .invite(from, "caller", to, format!("peer-{}", from), None, Utc::now(), RING)
            .unwrap();
        effects.deliveries[0].1.call_id()
    }

    #[test]
    fn invite_rings_both_sides() {
        let (a, b, _) = ids();
        let mut registry = CallRegistry::new();
        let effects = registry
            .invite(a, "alice", b, "peer-a".into(), Some("R123".into()), Utc::now(), RING)
            .unwrap();

        assert!(matches!(effects.events_for(a).as_slice(), [CallEvent::Ringing { .. }]));
        assert!(matches!(effects.events_for(b).as_slice(), [CallEvent::Incoming { .. }]));
        assert_eq!(
            effects.presence,
            vec![PresenceProjection {
                user_id: a,
                status: CallStatus::Ringing,
                peer_id: Some("peer-a".into()),
            }]
        );
        assert_eq!(registry.phase_of(a), CallPhase::RingingOutgoing);
        assert_eq!(registry.phase_of(b), CallPhase::RingingIncoming);
    }

    #[test]
    fn accept_exchanges_peer_ids() {
        let (a, b, _) = ids();
        let mut registry = CallRegistry::new();
        let call = invite(&mut registry, a, b);

        let effects = registry.accept(b, call, "peer-b".into(), Utc::now(), RING).unwrap();
        assert_eq!(
            effects.events_for(a),
            vec![&CallEvent::Accepted { call_id: call, peer_id: "peer-b".into() }]
        );
        assert_eq!(
            effects.events_for(b),
            vec![&CallEvent::Accepted { call_id: call, peer_id: format!("peer-{}", a) }]
        );

        registry.connected(a, call, Utc::now()).unwrap();
        let again = registry.connected(b, call, Utc::now()).unwrap();
        assert!(again.deliveries.is_empty());

        let session = registry.session(call).unwrap();
        assert_eq!(session.state, CallState::InCall);
        assert!(session.started_at.is_some());
        assert_eq!(session.peer_id_of(b), Some("peer-b"));
        assert_eq!(registry.phase_of(a), CallPhase::InCall);
        assert_eq!(registry.phase_of(b), CallPhase::InCall);
    }

    #[test]
    fn only_callee_may_answer() {
        let (a, b, c) = ids();
        let mut registry = CallRegistry::new();
        let call = invite(&mut registry, a, b);

        let now = Utc::now();
        assert_eq!(
            registry.accept(a, call, "x".into(), now, RING).unwrap_err(),
            CallError::NotCallee
        );
        assert_eq!(
            registry.accept(c, call, "x".into(), now, RING).unwrap_err(),
            CallError::NotParticipant
        );
        assert_eq!(registry.reject(a, call).unwrap_err(), CallError::NotCallee);
    }

    #[test]
    fn accept_or_reject_without_a_call_changes_nothing() {
        let (a, _, _) = ids();
        let mut registry = CallRegistry::new();
        let unknown = Uuid::new_v4();
        assert_eq!(
            registry.accept(a, unknown, "x".into(), Utc::now(), RING).unwrap_err(),
            CallError::NotFound
        );
        assert_eq!(registry.reject(a, unknown).unwrap_err(), CallError::NotFound);
        assert!(registry.is_empty());
        assert_eq!(registry.phase_of(a), CallPhase::Idle);
    }

    #[test]
    fn reject_notifies_caller_and_frees_both() {
        let (a, b, _) = ids();
        let mut registry = CallRegistry::new();
        let call = invite(&mut registry, a, b);

        let effects = registry.reject(b, call).unwrap();
        assert_eq!(
            effects.events_for(a),
            vec![&CallEvent::Ended { call_id: call, reason: EndReason::Rejected }]
        );
        assert!(effects.events_for(b).is_empty());
        assert_eq!(effects.presence.len(), 1);
        assert_eq!(effects.presence[0].status, CallStatus::Idle);
        assert!(registry.is_empty());
        assert_eq!(registry.phase_of(b), CallPhase::Idle);
    }

    #[test]
    fn busy_callee_keeps_existing_call() {
        let (a, b, c) = ids();
        let mut registry = CallRegistry::new();
        let call = invite(&mut registry, b, c);
        registry.accept(c, call, "peer-c".into(), Utc::now(), RING).unwrap();
        registry.connected(b, call, Utc::now()).unwrap();

        let err = registry
            .invite(a, "alice", b, "peer-a".into(), None, Utc::now(), RING)
            .unwrap_err();
        assert_eq!(err, CallError::CalleeBusy);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.phase_of(a), CallPhase::Idle);
        assert_eq!(registry.phase_of(b), CallPhase::InCall);
        assert_eq!(registry.session_of(b).unwrap().callee_id, c);
    }

    #[test]
    fn caller_cannot_double_invite() {
        let (a, b, c) = ids();
        let mut registry = CallRegistry::new();
        invite(&mut registry, a, b);
        let err = registry
            .invite(a, "alice", c, "peer-a".into(), None, Utc::now(), RING)
            .unwrap_err();
        assert_eq!(err, CallError::CallerBusy);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unanswered_invite_expires() {
        let (a, b, _) = ids();
        let mut registry = CallRegistry::new();
        let call = invite(&mut registry, a, b);

        assert!(registry.expire(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(31);
        let expired = registry.expire(later);
        assert_eq!(expired.len(), 1);
        let effects = &expired[0];
        assert_eq!(effects.events_for(a).len(), 1);
        assert_eq!(effects.events_for(b).len(), 1);
        assert!(matches!(effects.ended, Some((_, EndReason::TimedOut))));
        assert!(registry.session(call).is_none());
    }

    #[test]
    fn stalled_connect_expires() {
        let (a, b, _) = ids();
        let mut registry = CallRegistry::new();
        let call = invite(&mut registry, a, b);
        registry.accept(b, call, "peer-b".into(), Utc::now(), RING).unwrap();

        assert!(registry.expire(Utc::now()).is_empty());

        let later = Utc::now() + chrono::Duration::seconds(31);
        let expired = registry.expire(later);
        assert_eq!(expired.len(), 1);
        let effects = &expired[0];
        assert!(matches!(effects.ended, Some((_, EndReason::ConnectFailed))));
        assert_eq!(
            effects.events_for(b),
            vec![&CallEvent::Ended { call_id: call, reason: EndReason::ConnectFailed }]
        );
        assert_eq!(effects.presence.len(), 2);
        assert!(effects.presence.iter().all(|p| p.status == CallStatus::Idle));
        assert_eq!(registry.phase_of(a), CallPhase::Idle);
    }

    #[test]
    fn connected_calls_never_expire() {
        let (a, b, _) = ids();
        let mut registry = CallRegistry::new();
        let call = invite(&mut registry, a, b);
        registry.accept(b, call, "peer-b".into(), Utc::now(), RING).unwrap();
        registry.connected(a, call, Utc::now()).unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(registry.expire(later).is_empty());
        assert!(registry.session(call).is_some());
    }

    #[test]
    fn mute_is_relayed_without_state_change() {
        let (a, b, _) = ids();
        let mut registry = CallRegistry::new();
        let call = invite(&mut registry, a, b);
        assert!(registry.toggle_mute(a, call, true).is_err());

        registry.accept(b, call, "peer-b".into(), Utc::now(), RING).unwrap();
        registry.connected(b, call, Utc::now()).unwrap();
        let effects = registry.toggle_mute(a, call, true).unwrap();
        assert_eq!(
            effects.events_for(b),
            vec![&CallEvent::MuteChanged { call_id: call, user_id: a, muted: true }]
        );
        assert!(effects.presence.is_empty());
        assert_eq!(registry.session(call).unwrap().state, CallState::InCall);
    }

    #[test]
    fn hang_up_and_drop_end_for_the_other_side() {
        let (a, b, _) = ids();
        let mut registry = CallRegistry::new();
        let call = invite(&mut registry, a, b);
        registry.accept(b, call, "peer-b".into(), Utc::now(), RING).unwrap();

        let effects = registry.drop_user(b).unwrap();
        assert_eq!(
            effects.events_for(a),
            vec![&CallEvent::Ended { call_id: call, reason: EndReason::Dropped }]
        );
        assert_eq!(effects.presence.len(), 2);
        assert!(registry.drop_user(b).is_none());

        let call = invite(&mut registry, a, b);
        let effects = registry.hang_up(a, call).unwrap();
        assert!(effects.events_for(a).is_empty());
        assert_eq!(effects.events_for(b).len(), 1);
    }

    mod service {
        use super::super::*;
        use crate::GatewayConfig;
        use crate::test_support::gateway_with_users;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn racing_accept_and_hang_up_leave_presence_idle() {
            let (gateway, ids) = gateway_with_users(&["alice", "bob"], GatewayConfig::default());
            let (a, b) = (ids[0], ids[1]);
            let (_ca, _a_rx) = gateway.dispatcher.register_user_channel(a).await;
            let (_cb, _b_rx) = gateway.dispatcher.register_user_channel(b).await;
            gateway.presence.mark_online(a).await.unwrap();
            gateway.presence.mark_online(b).await.unwrap();

            for _ in 0..100 {
                let call_id = gateway
                    .calls
                    .initiate_call(a, "alice", b, "peer-a".into(), None)
                    .await
                    .unwrap();

                let calls = gateway.calls.clone();
                let answer =
                    tokio::spawn(async move { calls.answer_call(b, call_id, "peer-b".into()).await });
                let calls = gateway.calls.clone();
                let hang_up = tokio::spawn(async move { calls.end_call(a, call_id).await });

                // The answer may lose the race and find no call.
                let _ = answer.await.unwrap();
                hang_up.await.unwrap().unwrap();

                assert!(gateway.calls.session_of(b).is_none());
                for user in [a, b] {
                    let record = gateway.presence.get(user).await.unwrap().unwrap();
                    assert_eq!(record.call_status, CallStatus::Idle);
                    assert_eq!(record.peer_id, None);
                }
            }
        }

        #[tokio::test]
        async fn stalled_connect_frees_both_parties() {
            let config = GatewayConfig {
                connect_timeout: Duration::ZERO,
                ..Default::default()
            };
            let (gateway, ids) = gateway_with_users(&["alice", "bob"], config);
            let (a, b) = (ids[0], ids[1]);
            let (_cb, _b_rx) = gateway.dispatcher.register_user_channel(b).await;
            gateway.presence.mark_online(a).await.unwrap();
            gateway.presence.mark_online(b).await.unwrap();
            let mut notifications = gateway.dispatcher.notifications().subscribe();

            let call_id = gateway
                .calls
                .initiate_call(a, "alice", b, "peer-a".into(), None)
                .await
                .unwrap();
            gateway.calls.answer_call(b, call_id, "peer-b".into()).await.unwrap();
            assert_eq!(gateway.calls.expire_due(Utc::now()).await, 1);

            assert_eq!(gateway.calls.phase_of(a), CallPhase::Idle);
            assert_eq!(gateway.calls.phase_of(b), CallPhase::Idle);
            let record = gateway.presence.get(b).await.unwrap().unwrap();
            assert_eq!(record.call_status, CallStatus::Idle);
            assert!(notifications.try_recv().is_err());
        }
    }
}
