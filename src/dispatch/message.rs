//! Newline-delimited JSON messages exchanged between dispatcher and receiver

use crate::snapshot::{ClusterConfig, ConfigSnapshot, RouteConfig};
use hyper::body::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// A full configuration snapshot
    Update,
    /// Removal notice; carries no configuration
    Remove,
    /// Keepalive so idle connections can be told apart from dead ones
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_type: MessageType,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub cluster: Vec<ClusterConfig>,
}

impl Message {
    pub fn update(key: impl Into<String>, snapshot: &ConfigSnapshot) -> Self {
        Self {
            message_type: MessageType::Update,
            key: key.into(),
            routes: snapshot.routes.clone(),
            cluster: snapshot.clusters.clone(),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            message_type: MessageType::Heartbeat,
            key: String::new(),
            routes: Vec::new(),
            cluster: Vec::new(),
        }
    }

    /// Encode as one JSON line terminated by `\n`
    pub fn to_line(&self) -> Result<Bytes, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }

    /// Decode one line, with or without its trailing newline
    pub fn from_line(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line.strip_suffix(b"\n").unwrap_or(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{RouteConfig, RouteMatch};
    use std::collections::BTreeMap;

    #[test]
    fn test_update_wire_format() {
        let snapshot = ConfigSnapshot {
            routes: vec![RouteConfig {
                route_id: "r1".into(),
                cluster_id: "c1".into(),
                route_match: RouteMatch::default(),
                order: None,
                metadata: BTreeMap::new(),
            }],
            clusters: vec![],
        };
        let line = Message::update("default/web", &snapshot).to_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);

        let json: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(json["messageType"], "Update");
        assert_eq!(json["key"], "default/web");
        assert_eq!(json["routes"][0]["routeId"], "r1");
        assert!(json["cluster"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_from_line_accepts_minimal_message() {
        let message = Message::from_line(br#"{"messageType":"Heartbeat"}"#).unwrap();
        assert_eq!(message, Message::heartbeat());

        let message = Message::from_line(b"{\"messageType\":\"Remove\",\"key\":\"k\"}\n").unwrap();
        assert_eq!(message.message_type, MessageType::Remove);
        assert_eq!(message.key, "k");
    }

    #[test]
    fn test_from_line_rejects_garbage() {
        assert!(Message::from_line(b"not json").is_err());
        assert!(Message::from_line(br#"{"messageType":"Explode"}"#).is_err());
    }
}
