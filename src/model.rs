use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub type UserId = i64;
pub type RoomId = i64;
pub type MessageId = i64;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub role: Role,
}

/// A chat room as served by the collaborator API. `active_users` and
/// `unread_count` only appear on feed endpoints and are advisory.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub is_public: bool,
    #[serde(default)]
    pub is_community: bool,
    pub owner_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_users: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
}

/// An immutable chat message. Identity and timestamp are assigned by the
/// server; the client only ever appends to a room's sequence.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub author: User,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
}

impl Message {
    /// Attachment-only messages carry no text.
    pub fn display_body(&self) -> &str {
        if self.content.is_empty() && self.file_url.is_some() {
            "Attachment"
        } else {
            &self.content
        }
    }
}

/// Outbound WebSocket frame, mirrored from the transport contract.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

impl OutboundFrame {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            file_url: None,
            kind: MessageKind::Text,
        }
    }

    pub fn file(content: impl Into<String>, file_url: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            file_url: Some(file_url.into()),
            kind: MessageKind::File,
        }
    }
}

/// Short-lived per-session token used to authenticate the live transport.
#[derive(Debug, Deserialize, Clone)]
pub struct SessionToken {
    pub token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoomInvite {
    pub token: Uuid,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadedFile {
    pub file_url: String,
}
