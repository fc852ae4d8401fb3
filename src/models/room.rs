use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation scope. Direct rooms have exactly two memberships,
/// group rooms three or more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: i64,
    pub is_group: bool,
    pub name: Option<String>,
}

/// Many-to-many edge between users and rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: i64,
    pub room_id: i64,
    pub joined_at: DateTime<Utc>,
}
