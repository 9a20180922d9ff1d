//! User identity and activity models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

use super::resource::ResourceId;

const MAX_USER_ID_LEN: usize = 128;

/// Opaque caller-supplied user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct UserId(String);

impl UserId {
    /// Borrow the identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("user id must not be empty".into()));
        }
        if trimmed.len() > MAX_USER_ID_LEN {
            return Err(Error::InvalidInput(format!(
                "user id must be at most {MAX_USER_ID_LEN} bytes"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Durable record of one user's engagement with one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySession {
    /// Row identifier
    pub id: i64,
    pub resource_id: ResourceId,
    pub user_id: UserId,
    /// First activity of this session (Unix ms)
    pub started_at: i64,
    /// Most recent activity (Unix ms)
    pub last_activity_at: i64,
    /// Cleared on release or detected disconnect; rows are never deleted
    pub is_active: bool,
}

/// One entry of a presence snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub user_id: UserId,
    /// Unix ms
    pub started_at: i64,
    /// Unix ms
    pub last_activity_at: i64,
}

impl From<ActivitySession> for ActiveUser {
    fn from(session: ActivitySession) -> Self {
        Self {
            user_id: session.user_id,
            started_at: session.started_at,
            last_activity_at: session.last_activity_at,
        }
    }
}
