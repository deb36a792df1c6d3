//! Chirp tracker protocol: chat message type and HTTP request/response bodies.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

/// Default channel every registered peer lands in. Always exists.
pub const PUBLIC_CHANNEL: &str = "public";

/// Sender name used for tracker-generated notices.
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// A queued chat message. `channel` is set only for channel fan-out copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    #[serde(rename = "message")]
    pub body: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Message {
    /// New direct message stamped with the current time.
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            timestamp: unix_now(),
            channel: None,
        }
    }

    /// Copy of this message tagged with a channel name.
    pub fn in_channel(&self, channel: &str) -> Self {
        Self {
            channel: Some(channel.to_string()),
            ..self.clone()
        }
    }
}

/// Current wall-clock time as float seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Snapshot returned by `GET /get-list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    /// peer_id -> "ip:port"
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
    /// channel name -> member count
    #[serde(default)]
    pub lists: BTreeMap<String, usize>,
}

impl Directory {
    /// Split a peer's "ip:port" entry. None if the entry is missing or malformed.
    pub fn address_of(&self, peer_id: &str) -> Option<(String, u16)> {
        let addr = self.peers.get(peer_id)?;
        let (ip, port) = addr.rsplit_once(':')?;
        Some((ip.to_string(), port.parse().ok()?))
    }
}

/// `POST /submit-info`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default, deserialize_with = "port_field")]
    pub port: u16,
}

/// `POST /create-list` and `POST /join-list`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelRequest {
    #[serde(default)]
    pub list_name: String,
    #[serde(default)]
    pub peer_id: String,
}

/// `POST /send-message`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub message: String,
}

/// `POST /get-messages`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub peer_id: String,
}

/// Body of `POST /get-messages` on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Body of every error response: `{status:"error", message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// Ports arrive as JSON numbers from most clients and as strings from some forms.
/// Null or absent decodes to 0, which validation rejects.
fn port_field<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
        Null(()),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => u16::try_from(n).map_err(serde::de::Error::custom),
        Raw::Text(s) => s.trim().parse::<u16>().map_err(serde::de::Error::custom),
        Raw::Null(()) => Ok(0),
    }
}

/// Wrap fields in a success envelope: `{status:"success", ...fields}`.
pub fn success_envelope(fields: serde_json::Value) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    out.insert("status".into(), "success".into());
    if let serde_json::Value::Object(map) = fields {
        out.extend(map);
    }
    serde_json::Value::Object(out)
}

/// Error envelope: `{status:"error", message}`.
pub fn error_envelope(message: &str) -> serde_json::Value {
    serde_json::json!({ "status": "error", "message": message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_message_omits_channel() {
        let msg = Message::new("alice", "hi");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["sender"], "alice");
        assert_eq!(v["message"], "hi");
        assert!(v.get("channel").is_none());
        assert!(v["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn channel_copy_keeps_timestamp() {
        let msg = Message::new("alice", "hi");
        let copy = msg.in_channel("team");
        assert_eq!(copy.channel.as_deref(), Some("team"));
        assert_eq!(copy.timestamp, msg.timestamp);
        assert_eq!(serde_json::to_value(&copy).unwrap()["channel"], "team");
    }

    #[test]
    fn port_accepts_number_or_string() {
        let a: RegisterRequest =
            serde_json::from_str(r#"{"peer_id":"a","ip":"1.2.3.4","port":9001}"#).unwrap();
        assert_eq!(a.port, 9001);
        let b: RegisterRequest =
            serde_json::from_str(r#"{"peer_id":"a","ip":"1.2.3.4","port":"9002"}"#).unwrap();
        assert_eq!(b.port, 9002);
        let c: RegisterRequest = serde_json::from_str(r#"{"peer_id":"a"}"#).unwrap();
        assert_eq!(c.port, 0);
        assert!(c.ip.is_empty());
    }

    #[test]
    fn port_rejects_garbage() {
        assert!(serde_json::from_str::<RegisterRequest>(r#"{"port":"abc"}"#).is_err());
        assert!(serde_json::from_str::<RegisterRequest>(r#"{"port":70000}"#).is_err());
    }

    #[test]
    fn success_envelope_flattens_fields() {
        let v = success_envelope(serde_json::json!({ "peer_id": "a", "message": "ok" }));
        assert_eq!(v["status"], "success");
        assert_eq!(v["peer_id"], "a");
        assert_eq!(v["message"], "ok");
    }

    #[test]
    fn directory_address_split() {
        let mut dir = Directory::default();
        dir.peers.insert("bob".into(), "10.0.0.2:9002".into());
        dir.peers.insert("bad".into(), "nowhere".into());
        assert_eq!(dir.address_of("bob"), Some(("10.0.0.2".to_string(), 9002)));
        assert_eq!(dir.address_of("bad"), None);
        assert_eq!(dir.address_of("carol"), None);
    }
}
