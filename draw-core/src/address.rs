use std::fmt;

use crate::RoomId;

/// A room address. Carrying the host token in the query string is what makes
/// the holder the host; there is no other credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomLink {
    pub room_id: RoomId,
    pub host_token: Option<String>,
}

impl RoomLink {
    pub fn guest(room_id: impl Into<RoomId>) -> Self {
        Self {
            room_id: room_id.into(),
            host_token: None,
        }
    }

    pub fn host(room_id: impl Into<RoomId>, host_token: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            host_token: Some(host_token.into()),
        }
    }

    /// The link to hand out to guests: same room, never the token.
    pub fn share(&self) -> Self {
        Self::guest(self.room_id.clone())
    }

    pub fn path(&self) -> String {
        match &self.host_token {
            Some(token) => format!("/room/{}?host={}", self.room_id, token),
            None => format!("/room/{}", self.room_id),
        }
    }

    pub fn url(&self, base_url: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), self.path())
    }
}

impl fmt::Display for RoomLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}
