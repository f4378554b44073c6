//! Member role and membership rows
//!
//! Roles have a natural ordering: Member < Admin < Owner.
//! Direct conversations only ever carry `Member` rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Member role in a conversation with natural hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Regular member - can send messages and mark them read
    Member = 0,
    /// Admin - can manage members and metadata (not other admins or the owner)
    Admin = 1,
    /// Owner - full control, exactly one per group
    Owner = 2,
}

impl MemberRole {
    /// Parse role from database string
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "member" => Some(Self::Member),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            _ => None,
        }
    }

    /// Convert role to database string
    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    /// Check if this role can manage another role
    /// Rule: You can only manage roles strictly below yours
    pub fn can_manage(&self, target: MemberRole) -> bool {
        *self > target
    }

    /// Check if this role can perform admin actions
    pub fn is_privileged(&self) -> bool {
        *self >= MemberRole::Admin
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db())
    }
}

/// Parse from string (for API requests)
impl std::str::FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db(&s.to_ascii_lowercase()).ok_or_else(|| format!("Invalid role: {}", s))
    }
}

/// One membership row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn new(conversation_id: Uuid, user_id: Uuid, role: MemberRole) -> Self {
        Self {
            conversation_id,
            user_id,
            role,
            joined_at: Utc::now(),
        }
    }
}
