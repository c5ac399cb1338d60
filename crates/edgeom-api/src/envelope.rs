//! JSON text-frame envelope exchanged with the manager.
//!
//! Every frame is `{header, route, content}` where `content` is itself a
//! JSON document serialized to a string.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

const RESOURCE_PREFIX: &str = "websocket/";
const TOPIC_PREFIX: &str = "$hw/edge/v1/hardware/operate/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub parent_msg_id: String,
    #[serde(default)]
    pub sync: bool,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub source: String,
    pub group: String,
    pub operation: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub route: Route,
    pub content: String,
}

impl Envelope {
    /// Build an upstream message for `resource` with the default route
    /// (`hardware` → `hub`, `update`).
    pub fn new(resource: impl Into<String>, content: &serde_json::Value) -> Self {
        Self::with_route(resource, "update", content, "")
    }

    /// Reply to `request`, linking it through `parent_msg_id`.
    pub fn reply(request: &Envelope, resource: impl Into<String>, content: &serde_json::Value) -> Self {
        Self::with_route(resource, "update", content, &request.header.msg_id)
    }

    fn with_route(
        resource: impl Into<String>,
        operation: &str,
        content: &serde_json::Value,
        parent: &str,
    ) -> Self {
        Self {
            header: Header {
                msg_id: Uuid::new_v4().to_string(),
                parent_msg_id: parent.to_owned(),
                sync: false,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            route: Route {
                source: "hardware".into(),
                group: "hub".into(),
                operation: operation.into(),
                resource: resource.into(),
            },
            content: content.to_string(),
        }
    }

    /// Topic this message is delivered to on the device side.
    pub fn topic(&self) -> String {
        let resource = self
            .route
            .resource
            .strip_prefix(RESOURCE_PREFIX)
            .unwrap_or(&self.route.resource);
        format!("{TOPIC_PREFIX}{resource}")
    }

    /// Parse `content` as JSON.
    pub fn content_json(&self) -> Result<serde_json::Value, Error> {
        serde_json::from_str(&self.content).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: self.content.clone(),
        })
    }

    pub fn to_text(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })
    }

    /// Parse an inbound frame, refusing anything at or above `limit` bytes.
    pub fn from_text(text: &str, limit: usize) -> Result<Self, Error> {
        if text.len() >= limit {
            return Err(Error::MessageTooLarge {
                size: text.len(),
                limit,
            });
        }
        let mut raw: serde_json::Value = serde_json::from_str(text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text.chars().take(256).collect(),
        })?;

        // Some managers send `content` as an object rather than a string.
        if let Some(content) = raw.get_mut("content") {
            if !content.is_string() {
                *content = serde_json::Value::String(content.to_string());
            }
        }

        serde_json::from_value(raw).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text.chars().take(256).collect(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn topic_strips_websocket_prefix() {
        let msg = Envelope::new("websocket/netmanager", &json!({}));
        assert_eq!(msg.topic(), "$hw/edge/v1/hardware/operate/netmanager");

        let bare = Envelope::new("cert_update", &json!({}));
        assert_eq!(bare.topic(), "$hw/edge/v1/hardware/operate/cert_update");
    }

    #[test]
    fn upstream_defaults() {
        let msg = Envelope::new("websocket/keepalive", &json!({"alive": true}));
        assert_eq!(msg.route.source, "hardware");
        assert_eq!(msg.route.group, "hub");
        assert_eq!(msg.route.operation, "update");
        assert!(!msg.header.sync);
        assert!(msg.header.parent_msg_id.is_empty());
        assert_eq!(msg.content, r#"{"alive":true}"#);
        assert!(Uuid::parse_str(&msg.header.msg_id).is_ok());
    }

    #[test]
    fn reply_links_parent() {
        let req = Envelope::new("websocket/cert_query", &json!({}));
        let resp = Envelope::reply(&req, "websocket/cert_query", &json!({"ok": 1}));
        assert_eq!(resp.header.parent_msg_id, req.header.msg_id);
    }

    #[test]
    fn object_content_is_normalized_to_string() {
        let text = json!({
            "header": {"msg_id": "m1", "parent_msg_id": "", "sync": false, "timestamp": 1},
            "route": {"source": "fd", "group": "hub", "operation": "update", "resource": "websocket/netmanager"},
            "content": {"account": "dev01"}
        })
        .to_string();
        let msg = Envelope::from_text(&text, 4096).unwrap();
        assert_eq!(msg.content_json().unwrap()["account"], "dev01");
    }

    #[test]
    fn oversized_frames_are_refused() {
        let err = Envelope::from_text(&"x".repeat(64), 64).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { size: 64, limit: 64 }));
    }
}
