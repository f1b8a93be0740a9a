//! Durable presence facts.

use serde::{Deserialize, Serialize};

use crate::api::{SessionId, SessionView, Time};

/// What a session looks like to the rest of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    #[serde(flatten)]
    pub session_view: SessionView,
    pub last_interacted: Time,
}

/// A presence fact as persisted.
///
/// Rows are keyed by `(room, server_id, server_era, session_id)`. Any row
/// whose `(server_id, server_era)` no longer matches a live peer is stale
/// and ignored by listings.
#[derive(Debug, Clone)]
pub struct PresenceRow {
    pub room: String,
    pub server_id: String,
    pub server_era: String,
    pub session_id: SessionId,
    pub updated: Time,
    pub fact: Presence,
}

impl PresenceRow {
    pub fn new(room: &str, view: &SessionView) -> Self {
        let now = Time::now();
        Self {
            room: room.to_string(),
            server_id: view.server_id.clone(),
            server_era: view.server_era.clone(),
            session_id: view.session_id.clone(),
            updated: now,
            fact: Presence {
                session_view: view.clone(),
                last_interacted: now,
            },
        }
    }
}
