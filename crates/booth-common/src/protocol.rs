use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description as produced by a browser's `RTCSessionDescription.toJSON()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in `RTCIceCandidate.toJSON()` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Liveness record written under a room's `users` mapping on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub participant_id: String,
    pub display_name: String,
    pub joined_at: i64,
    pub user_agent: String,
    pub connection_id: i64,
}

/// Entry in a participant's signaling mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    /// Empty when the sender did not identify itself.
    #[serde(default)]
    pub from: String,
    pub timestamp: i64,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Customer,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: String,
    pub text: String,
    pub sender: String,
    pub sender_id: String,
    pub sender_type: Role,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Why a participant left the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    /// Explicit end-call.
    Hangup,
    /// Hard session cap reached.
    Expired,
    /// No remote participant came back within the grace period.
    Timeout,
    /// The host deleted the room.
    RoomClosed,
}

impl EndReason {
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Expired => SessionStatus::Expired,
            Self::Hangup | Self::Timeout | Self::RoomClosed => SessionStatus::Ended,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub title: String,
    pub avatar: String,
}

impl AgentInfo {
    pub fn demo() -> Self {
        Self {
            id: "demo_agent".into(),
            name: "Demo Agent".into(),
            title: "Banking Specialist".into(),
            avatar: "DA".into(),
        }
    }

    /// Initials of each word in `name`, e.g. "Ada Lovelace" → "AL".
    pub fn initials(name: &str) -> String {
        name.split_whitespace()
            .filter_map(|part| part.chars().next())
            .flat_map(char::to_uppercase)
            .collect()
    }
}

/// Messages a participant sends to the gateway over `/ws`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Join {
        access_code: String,
        display_name: String,
        #[serde(default)]
        user_agent: String,
        #[serde(default)]
        customer_id: Option<String>,
        #[serde(default)]
        customer_name: Option<String>,
        #[serde(default)]
        role: Role,
    },
    Signal {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<SessionDescription>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<IceCandidate>,
    },
    /// Delete a processed entry from the caller's own mailbox.
    Consume {
        message_id: String,
    },
    Chat {
        text: String,
    },
    /// Participant count including the caller.
    Participants {
        count: u32,
    },
    Heartbeat,
    End {
        reason: EndReason,
    },
}

/// Messages the gateway pushes to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Joined {
        participant_id: String,
        session_id: String,
        is_host: bool,
        host_id: String,
        start_time: i64,
    },
    UserAdded {
        user: PresenceRecord,
    },
    UserRemoved {
        participant_id: String,
    },
    Signal {
        message: SignalingMessage,
    },
    Chat {
        message: ChatMessage,
    },
    RoomClosed,
    Ended {
        status: SessionStatus,
        duration_ms: i64,
    },
    Error {
        message: String,
    },
}
