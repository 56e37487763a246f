//! Network sub-protocol frames

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tabmesh_core::Identity;

use crate::TransportResult;

/// One text frame on the network socket, tagged by `type`
///
/// Envelope payloads are carried as plain JSON so the dispatcher validates
/// them the same way regardless of transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetFrame {
    // Authentication
    Auth { token: String, identity: Identity },
    AuthSuccess {
        #[serde(default)]
        user_id: Option<String>,
    },
    AuthFailed { reason: String },

    // Rooms
    JoinRoom { room_id: String },
    LeaveRoom { room_id: String },
    RoomJoined {
        room_id: String,
        #[serde(default)]
        users: Vec<Value>,
    },
    /// Our own departure, or another user's when `user_id` is set
    RoomLeft {
        room_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },

    // Messages
    Broadcast { payload: Value },
    Direct { target_id: String, payload: Value },

    // Presence
    PresenceUpdate { payload: Value },
    PresenceList { users: Vec<Value> },

    // Liveness
    Heartbeat { timestamp: u64 },
    HeartbeatAck { timestamp: u64 },

    Error { message: String },
}

impl NetFrame {
    pub fn decode(text: &str) -> TransportResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> TransportResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short frame kind for logs; never includes credentials
    pub fn kind(&self) -> &'static str {
        match self {
            NetFrame::Auth { .. } => "auth",
            NetFrame::AuthSuccess { .. } => "auth_success",
            NetFrame::AuthFailed { .. } => "auth_failed",
            NetFrame::JoinRoom { .. } => "join_room",
            NetFrame::LeaveRoom { .. } => "leave_room",
            NetFrame::RoomJoined { .. } => "room_joined",
            NetFrame::RoomLeft { .. } => "room_left",
            NetFrame::Broadcast { .. } => "broadcast",
            NetFrame::Direct { .. } => "direct",
            NetFrame::PresenceUpdate { .. } => "presence_update",
            NetFrame::PresenceList { .. } => "presence_list",
            NetFrame::Heartbeat { .. } => "heartbeat",
            NetFrame::HeartbeatAck { .. } => "heartbeat_ack",
            NetFrame::Error { .. } => "error",
        }
    }
}
