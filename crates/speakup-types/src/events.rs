use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::call::EndReason;
use crate::models::{CallStatus, Like, Notification, PresenceRecord};
use crate::optimistic::MutationOutcome;

/// Partial presence update. `None` leaves the field alone; for the nullable
/// columns `Some(None)` clears them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_status: Option<CallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_room: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "nullable"
    )]
    pub peer_id: Option<Option<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "nullable"
    )]
    pub room_code: Option<Option<String>>,
}

impl PresencePatch {
    pub fn merge_into(&self, record: &mut PresenceRecord) {
        if let Some(username) = &self.username {
            record.username = username.clone();
        }
        if let Some(is_online) = self.is_online {
            record.is_online = is_online;
        }
        if let Some(last_seen_at) = self.last_seen_at {
            record.last_seen_at = last_seen_at;
        }
        if let Some(updated_at) = self.updated_at {
            record.updated_at = updated_at;
        }
        if let Some(call_status) = self.call_status {
            record.call_status = call_status;
        }
        if let Some(in_room) = self.in_room {
            record.in_room = in_room;
        }
        if let Some(peer_id) = &self.peer_id {
            record.peer_id = peer_id.clone();
        }
        if let Some(room_code) = &self.room_code {
            record.room_code = room_code.clone();
        }
    }
}

/// Present-but-null deserializes to `Some(None)` instead of `None`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceChange {
    Insert { record: PresenceRecord },
    Update { user_id: Uuid, patch: PresencePatch },
    Delete { user_id: Uuid },
}

impl PresenceChange {
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::Insert { record } => record.user_id,
            Self::Update { user_id, .. } | Self::Delete { user_id } => *user_id,
        }
    }
}

/// Likes are scoped to the room they were given in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LikeChange {
    Insert {
        room_code: String,
        like: Like,
        total_likes: u64,
    },
    Delete {
        room_code: String,
        liker_id: Uuid,
        liked_user_id: Uuid,
        total_likes: u64,
    },
}

impl LikeChange {
    pub fn room_code(&self) -> &str {
        match self {
            Self::Insert { room_code, .. } | Self::Delete { room_code, .. } => room_code,
        }
    }
}

/// Notifications are only ever delivered to their recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationChange {
    Insert { notification: Notification },
    Update { id: Uuid, user_id: Uuid, is_read: bool },
}

impl NotificationChange {
    pub fn recipient(&self) -> Uuid {
        match self {
            Self::Insert { notification } => notification.user_id,
            Self::Update { user_id, .. } => *user_id,
        }
    }
}

/// Call events, always targeted at one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    /// Someone is calling you
    Incoming {
        call_id: Uuid,
        from_user_id: Uuid,
        from_username: String,
        room_code: Option<String>,
        expires_at: DateTime<Utc>,
    },
    /// Your invite is ringing on the callee's side
    Ringing {
        call_id: Uuid,
        to_user_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    /// The call was accepted; connect to `peer_id`
    Accepted { call_id: Uuid, peer_id: String },
    Connected {
        call_id: Uuid,
        started_at: DateTime<Utc>,
    },
    Ended { call_id: Uuid, reason: EndReason },
    Signal {
        call_id: Uuid,
        from_user_id: Uuid,
        signal: SignalPayload,
    },
    MuteChanged {
        call_id: Uuid,
        user_id: Uuid,
        muted: bool,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> Uuid {
        match self {
            Self::Incoming { call_id, .. }
            | Self::Ringing { call_id, .. }
            | Self::Accepted { call_id, .. }
            | Self::Connected { call_id, .. }
            | Self::Ended { call_id, .. }
            | Self::Signal { call_id, .. }
            | Self::MuteChanged { call_id, .. } => *call_id,
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    Presence(PresenceChange),

    Like(LikeChange),

    Notification(NotificationChange),

    Call(CallEvent),

    /// Reply to a call command so the client can keep or revert its
    /// optimistic state
    CommandResult {
        command: String,
        call_id: Option<Uuid>,
        outcome: MutationOutcome,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Receive like events for these rooms (replaces the previous set)
    Subscribe { room_codes: Vec<String> },

    CallInvite {
        target_user_id: Uuid,
        peer_id: String,
        room_code: Option<String>,
    },

    CallAccept { call_id: Uuid, peer_id: String },

    CallReject { call_id: Uuid },

    /// The peer transport reported an open connection
    CallConnected { call_id: Uuid },

    CallEnd { call_id: Uuid },

    CallSignalSend { call_id: Uuid, signal: SignalPayload },

    CallMute { call_id: Uuid, muted: bool },
}

impl GatewayCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::Subscribe { .. } => "subscribe",
            Self::CallInvite { .. } => "call_invite",
            Self::CallAccept { .. } => "call_accept",
            Self::CallReject { .. } => "call_reject",
            Self::CallConnected { .. } => "call_connected",
            Self::CallEnd { .. } => "call_end",
            Self::CallSignalSend { .. } => "call_signal_send",
            Self::CallMute { .. } => "call_mute",
        }
    }
}

/// WebRTC signaling payload relayed between the two parties of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal_type")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_distinguishes_null_from_absent() {
        let cleared: PresencePatch = serde_json::from_str(r#"{"peerId": null}"#).unwrap();
        assert_eq!(cleared.peer_id, Some(None));
        assert_eq!(cleared.room_code, None);

        let set: PresencePatch = serde_json::from_str(r#"{"peerId": "abc"}"#).unwrap();
        assert_eq!(set.peer_id, Some(Some("abc".to_string())));
    }

    #[test]
    fn gateway_event_wire_shape() {
        let event = GatewayEvent::Presence(PresenceChange::Delete {
            user_id: Uuid::nil(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Presence");
        assert_eq!(json["data"]["event"], "delete");
    }

    #[test]
    fn call_command_parses() {
        let raw = r#"{"type":"CallMute","data":{"call_id":"00000000-0000-0000-0000-000000000000","muted":true}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd.name(), "call_mute");
    }
}
