//! Realtime push-feed message envelope.
//!
//! The backend streams one JSON object per message:
//!
//! ```json
//! {"type":"item.updated","entity_id":"…","entity_type":"item",
//!  "workspace_id":"…","user_id":"…","timestamp":"…","data":{…}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stowage_core::{TenantId, UserId};

/// What a push message says happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeAction {
    Created,
    Updated,
    Deleted,
    /// Anything else (e.g. `loan.returned`); treated like an update.
    Other,
}

/// A decoded message from the realtime feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    /// Dotted event name, e.g. `item.updated`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub entity_id: String,
    pub entity_type: String,
    pub workspace_id: TenantId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl RealtimeEvent {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn action(&self) -> RealtimeAction {
        match self.event_type.rsplit('.').next() {
            Some("created") => RealtimeAction::Created,
            Some("updated") => RealtimeAction::Updated,
            Some("deleted") => RealtimeAction::Deleted,
            _ => RealtimeAction::Other,
        }
    }

    /// True for the feed's keep-alive frames, which carry no entity.
    pub fn is_heartbeat(&self) -> bool {
        self.event_type == "heartbeat" || self.event_type == "ping"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str) -> String {
        json!({
            "type": event_type,
            "entity_id": "itm_1",
            "entity_type": "item",
            "workspace_id": TenantId::new(),
            "user_id": UserId::new(),
            "timestamp": "2026-03-01T12:00:00Z",
            "data": {"name": "Drill"}
        })
        .to_string()
    }

    #[test]
    fn decodes_feed_message() {
        let event = RealtimeEvent::decode(&raw("item.updated")).unwrap();
        assert_eq!(event.entity_type, "item");
        assert_eq!(event.action(), RealtimeAction::Updated);
        assert_eq!(event.data["name"], "Drill");
    }

    #[test]
    fn unknown_suffix_is_other() {
        let event = RealtimeEvent::decode(&raw("loan.returned")).unwrap();
        assert_eq!(event.action(), RealtimeAction::Other);
    }

    #[test]
    fn missing_user_and_data_default() {
        let msg = json!({
            "type": "location.deleted",
            "entity_id": "loc_9",
            "entity_type": "location",
            "workspace_id": TenantId::new(),
            "timestamp": "2026-03-01T12:00:00Z"
        });
        let event = RealtimeEvent::decode(&msg.to_string()).unwrap();
        assert!(event.user_id.is_none());
        assert!(event.data.is_null());
        assert_eq!(event.action(), RealtimeAction::Deleted);
    }
}
