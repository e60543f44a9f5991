//! Row types and wire responses

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Message status ladder
// ---------------------------------------------------------------------------

/// Delivery status. Transitions only move forward:
/// `pending < sent < delivered < read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    /// Position in the forward-only ladder. `failed` is terminal and ranks
    /// alongside `pending` so it never overwrites a delivered state.
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Failed => 0,
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
        }
    }
}

impl FromStr for MessageStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            "failed" => Ok(MessageStatus::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalise a client-supplied message type; anything unknown is text.
pub fn parse_message_type(input: &str) -> &'static str {
    match input.trim().to_lowercase().as_str() {
        "image" => "image",
        "file" => "file",
        _ => "text",
    }
}

// ---------------------------------------------------------------------------
// Conversation identifiers ("user_<n>" / "group_<n>")
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationId {
    User(i64),
    Group(i64),
}

impl ConversationId {
    pub fn user(id: i64) -> Self {
        ConversationId::User(id)
    }

    pub fn group(id: i64) -> Self {
        ConversationId::Group(id)
    }
}

impl FromStr for ConversationId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("user_") {
            let id: i64 = rest.parse().map_err(|_| anyhow::anyhow!("invalid user conversation_id"))?;
            if id <= 0 {
                anyhow::bail!("invalid user conversation_id");
            }
            return Ok(ConversationId::User(id));
        }
        if let Some(rest) = s.strip_prefix("group_") {
            let id: i64 = rest.parse().map_err(|_| anyhow::anyhow!("invalid group conversation_id"))?;
            if id <= 0 {
                anyhow::bail!("invalid group conversation_id");
            }
            return Ok(ConversationId::Group(id));
        }
        anyhow::bail!("unknown conversation_id format")
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationId::User(id) => write!(f, "user_{}", id),
            ConversationId::Group(id) => write!(f, "group_{}", id),
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp rendering
// ---------------------------------------------------------------------------

/// Unix seconds → RFC3339 (UTC). Columns store integer seconds; the wire
/// renders both forms.
pub fn rfc3339(unix: i64) -> String {
    chrono::DateTime::from_timestamp(unix, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

pub fn rfc3339_opt(unix: Option<i64>) -> Option<String> {
    unix.map(rfc3339)
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub is_online: bool,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub is_online: bool,
    pub last_seen: Option<String>,
}

impl UserRecord {
    pub fn to_response(&self) -> UserResponse {
        UserResponse {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            is_online: self.is_online,
            last_seen: rfc3339_opt(self.last_seen),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message row joined with its sender's profile.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub client_id: String,
    pub sender_id: i64,
    pub recipient_id: Option<i64>,
    pub group_id: Option<i64>,
    pub content: String,
    pub message_type: String,
    pub status: String,
    pub is_delivered: bool,
    pub is_read: bool,
    pub delivered_at: Option<i64>,
    pub read_at: Option<i64>,
    pub created_at: i64,
    pub sender_username: String,
    pub sender_email: String,
    pub sender_is_online: bool,
    pub sender_last_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub id: i64,
    pub client_id: String,
    pub sender_id: i64,
    pub sender: UserResponse,
    pub recipient_id: Option<i64>,
    pub group_id: Option<i64>,
    pub content: String,
    pub message_type: String,
    pub status: String,
    pub is_delivered: bool,
    pub is_read: bool,
    pub created_at: String,
    pub created_at_unix: i64,
}

impl MessageRecord {
    pub fn to_response(&self) -> MessageResponse {
        MessageResponse {
            id: self.id,
            client_id: self.client_id.clone(),
            sender_id: self.sender_id,
            sender: UserResponse {
                id: self.sender_id,
                username: self.sender_username.clone(),
                email: self.sender_email.clone(),
                is_online: self.sender_is_online,
                last_seen: rfc3339_opt(self.sender_last_seen),
            },
            recipient_id: self.recipient_id,
            group_id: self.group_id,
            content: self.content.clone(),
            message_type: self.message_type.clone(),
            status: self.status.clone(),
            is_delivered: self.is_delivered,
            is_read: self.is_read,
            created_at: rfc3339(self.created_at),
            created_at_unix: self.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Pending queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct PendingRecord {
    pub id: i64,
    pub user_id: i64,
    pub message_id: i64,
    pub payload: String,
    pub priority: i64,
    pub attempts: i64,
    pub last_attempt: Option<i64>,
    pub next_retry: Option<i64>,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct GroupRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub creator_id: i64,
    pub is_public: bool,
    pub handle: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupResponse {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub creator_id: i64,
    pub is_public: bool,
    pub handle: Option<String>,
    pub created_at: String,
}

impl GroupRecord {
    pub fn to_response(&self) -> GroupResponse {
        GroupResponse {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            icon: self.icon.clone(),
            creator_id: self.creator_id,
            is_public: self.is_public,
            handle: self.handle.clone(),
            created_at: rfc3339(self.created_at),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct GroupReadStateRecord {
    pub group_id: i64,
    pub user_id: i64,
    pub last_read_message_id: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct InviteLinkRecord {
    pub id: i64,
    pub token: String,
    pub group_id: i64,
    pub created_by: i64,
    pub expires_at: Option<i64>,
    pub max_uses: Option<i64>,
    pub used_count: i64,
    pub revoked_at: Option<i64>,
}

impl InviteLinkRecord {
    /// A link is usable iff not revoked, not expired, and under its use cap.
    pub fn is_usable(&self, now: i64) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        if let Some(expires) = self.expires_at {
            if now > expires {
                return false;
            }
        }
        if let Some(max) = self.max_uses {
            if self.used_count >= max {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Conversation indexer rows
// ---------------------------------------------------------------------------

/// Denormalised output of the unified conversation query: either a DM row
/// (peer_* populated) or a group row (group_* populated).
#[derive(Debug, Clone, FromRow)]
pub struct ConversationRow {
    pub conversation_type: String,
    pub peer_id: Option<i64>,
    pub peer_username: Option<String>,
    pub peer_email: Option<String>,
    pub peer_is_online: Option<bool>,
    pub peer_last_seen: Option<i64>,

    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub group_icon: Option<String>,
    pub member_count: Option<i64>,

    pub unread_count: i64,
    pub message_id: i64,
    pub message_client_id: String,
    pub message_sender_id: i64,
    pub message_recipient_id: Option<i64>,
    pub message_group_id: Option<i64>,
    pub message_content: String,
    pub message_type: String,
    pub message_status: String,
    pub message_is_delivered: bool,
    pub message_is_read: bool,
    pub message_created_at: i64,
    pub last_activity: i64,

    pub sender_id: i64,
    pub sender_username: String,
    pub sender_email: String,
    pub sender_is_online: bool,
    pub sender_last_seen: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct RecentPeerRow {
    pub peer_id: i64,
    pub peer_username: String,
    pub peer_email: String,
    pub peer_is_online: bool,
    pub peer_last_seen: Option<i64>,
    pub message_id: i64,
    pub last_activity: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ladder_is_forward_only() {
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() < MessageStatus::Read.rank());
        assert_eq!(MessageStatus::Failed.rank(), MessageStatus::Pending.rank());
    }

    #[test]
    fn conversation_id_parses_strictly() {
        assert_eq!("user_12".parse::<ConversationId>().unwrap(), ConversationId::User(12));
        assert_eq!("group_3".parse::<ConversationId>().unwrap(), ConversationId::Group(3));
        assert!("peer_3".parse::<ConversationId>().is_err());
        assert!("user_".parse::<ConversationId>().is_err());
        assert!("user_-4".parse::<ConversationId>().is_err());
        assert!("group_abc".parse::<ConversationId>().is_err());
        assert!("".parse::<ConversationId>().is_err());
    }

    #[test]
    fn conversation_id_round_trips() {
        for s in ["user_7", "group_19"] {
            let parsed: ConversationId = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn message_type_defaults_to_text() {
        assert_eq!(parse_message_type("image"), "image");
        assert_eq!(parse_message_type(" FILE "), "file");
        assert_eq!(parse_message_type("gif"), "text");
        assert_eq!(parse_message_type(""), "text");
    }

    #[test]
    fn invite_usability() {
        let base = InviteLinkRecord {
            id: 1,
            token: "t".into(),
            group_id: 1,
            created_by: 1,
            expires_at: None,
            max_uses: None,
            used_count: 0,
            revoked_at: None,
        };
        assert!(base.is_usable(100));

        let revoked = InviteLinkRecord { revoked_at: Some(50), ..base.clone() };
        assert!(!revoked.is_usable(100));

        let expired = InviteLinkRecord { expires_at: Some(99), ..base.clone() };
        assert!(!expired.is_usable(100));
        assert!(expired.is_usable(99));

        let capped = InviteLinkRecord { max_uses: Some(2), used_count: 2, ..base.clone() };
        assert!(!capped.is_usable(100));
        let under_cap = InviteLinkRecord { max_uses: Some(2), used_count: 1, ..base };
        assert!(under_cap.is_usable(100));
    }
}
