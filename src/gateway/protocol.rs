//! Wire format of the gateway LAN protocol.
//!
//! Every datagram is a single JSON object with a `cmd` field. Payload fields
//! travel in `data`, which older firmware sends as a JSON document encoded
//! into a string and newer firmware sends inline. Both decode to the same
//! [`GatewayMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

use super::Sid;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid data field: {0}")]
    InvalidData(String),
}

/// Command vocabulary spoken by gateways.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Whois,
    Iam,
    GetIdList,
    GetIdListAck,
    Read,
    ReadAck,
    Write,
    WriteAck,
    Heartbeat,
    Report,
    Unknown(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Whois => "whois",
            Command::Iam => "iam",
            Command::GetIdList => "get_id_list",
            Command::GetIdListAck => "get_id_list_ack",
            Command::Read => "read",
            Command::ReadAck => "read_ack",
            Command::Write => "write",
            Command::WriteAck => "write_ack",
            Command::Heartbeat => "heartbeat",
            Command::Report => "report",
            Command::Unknown(cmd) => cmd,
        }
    }

    /// Commands that carry device state and keep a device alive.
    pub fn is_state_update(&self) -> bool {
        matches!(
            self,
            Command::Heartbeat | Command::WriteAck | Command::ReadAck | Command::Report
        )
    }
}

impl From<&str> for Command {
    fn from(cmd: &str) -> Self {
        match cmd {
            "whois" => Command::Whois,
            "iam" => Command::Iam,
            "get_id_list" => Command::GetIdList,
            "get_id_list_ack" => Command::GetIdListAck,
            "read" => Command::Read,
            "read_ack" => Command::ReadAck,
            "write" => Command::Write,
            "write_ack" => Command::WriteAck,
            "heartbeat" => Command::Heartbeat,
            "report" => Command::Report,
            other => Command::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct WireMessage {
    cmd: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    sid: Option<Sid>,
    #[serde(default)]
    short_id: Option<Value>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    port: Option<Value>,
    #[serde(default)]
    data: Option<Value>,
}

/// A decoded inbound datagram.
#[derive(Debug, Clone)]
pub struct GatewayMessage {
    pub command: Command,
    pub model: Option<String>,
    pub sid: Option<Sid>,
    pub short_id: Option<Value>,
    pub token: Option<String>,
    /// Address announced in `iam`
    pub ip: Option<String>,
    /// Port announced in `iam`; firmware sends it as a number or a string
    pub port: Option<u16>,
    pub data: Value,
    /// Original text, kept for diagnostics
    pub raw: String,
}

impl GatewayMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireMessage = serde_json::from_slice(bytes)?;

        let data = match wire.data {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::String(encoded)) => serde_json::from_str(&encoded)
                .map_err(|e| ProtocolError::InvalidData(format!("{e}: {encoded}")))?,
            Some(inline) => inline,
        };

        let port = wire.port.as_ref().and_then(|port| match port {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });

        Ok(Self {
            command: Command::from(wire.cmd.as_str()),
            model: wire.model,
            sid: wire.sid,
            short_id: wire.short_id,
            token: wire.token,
            ip: wire.ip,
            port,
            data,
            raw: String::from_utf8_lossy(bytes).into_owned(),
        })
    }
}

fn default_write_cmd() -> String {
    Command::Write.as_str().to_string()
}

/// Body of a write sent to a device. Unknown fields from the bus are kept and
/// forwarded as they are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    #[serde(default = "default_write_cmd")]
    pub cmd: String,
    pub sid: Sid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<Value>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WriteRequest {
    pub fn new(cmd: impl Into<String>, sid: impl Into<Sid>, data: Map<String, Value>) -> Self {
        Self {
            cmd: cmd.into(),
            sid: sid.into(),
            model: None,
            short_id: None,
            data,
            extra: Map::new(),
        }
    }
}

/// Outbound commands the bridge sends to gateways.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Whois,
    GetIdList,
    Read { sid: Sid },
    Write(WriteRequest),
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Whois => Command::Whois,
            Request::GetIdList => Command::GetIdList,
            Request::Read { .. } => Command::Read,
            Request::Write(req) => Command::from(req.cmd.as_str()),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let encoded = match self {
            Request::Whois => json!({ "cmd": "whois" }).to_string(),
            Request::GetIdList => json!({ "cmd": "get_id_list" }).to_string(),
            Request::Read { sid } => json!({ "cmd": "read", "sid": sid }).to_string(),
            Request::Write(req) => serde_json::to_string(req)?,
        };
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_vocabulary() {
        for name in [
            "whois",
            "iam",
            "get_id_list",
            "get_id_list_ack",
            "read",
            "read_ack",
            "write",
            "write_ack",
            "heartbeat",
            "report",
        ] {
            let cmd = Command::from(name);
            assert!(!matches!(cmd, Command::Unknown(_)), "{name} should be known");
            assert_eq!(cmd.as_str(), name);
        }
        assert_eq!(Command::from("reboot"), Command::Unknown("reboot".into()));
        assert!(Command::Report.is_state_update());
        assert!(!Command::Iam.is_state_update());
    }

    #[test]
    fn test_decode_iam_with_string_port() {
        let msg = GatewayMessage::decode(
            br#"{"cmd":"iam","port":"9898","sid":"f0b4299a5b3a","model":"gateway","ip":"192.168.1.20"}"#,
        )
        .unwrap();
        assert_eq!(msg.command, Command::Iam);
        assert_eq!(msg.sid.as_deref(), Some("f0b4299a5b3a"));
        assert_eq!(msg.ip.as_deref(), Some("192.168.1.20"));
        assert_eq!(msg.port, Some(9898));
        assert_eq!(msg.data, json!({}));
    }

    #[test]
    fn test_decode_string_encoded_data() {
        let msg = GatewayMessage::decode(
            br#"{"cmd":"report","model":"sensor_ht","sid":"158d0001","short_id":1234,"data":"{\"temperature\":\"2350\"}"}"#,
        )
        .unwrap();
        assert_eq!(msg.command, Command::Report);
        assert_eq!(msg.short_id, Some(json!(1234)));
        assert_eq!(msg.data, json!({"temperature": "2350"}));
    }

    #[test]
    fn test_decode_inline_data_and_id_list() {
        let msg = GatewayMessage::decode(
            br#"{"cmd":"get_id_list_ack","sid":"gw","token":"abc","data":"[\"s1\",\"s2\"]"}"#,
        )
        .unwrap();
        assert_eq!(msg.data, json!(["s1", "s2"]));
        assert_eq!(msg.token.as_deref(), Some("abc"));

        let inline =
            GatewayMessage::decode(br#"{"cmd":"report","sid":"s1","data":{"status":"open"}}"#)
                .unwrap();
        assert_eq!(inline.data, json!({"status": "open"}));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            GatewayMessage::decode(b"not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            GatewayMessage::decode(br#"{"sid":"x"}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            GatewayMessage::decode(br#"{"cmd":"report","data":"{broken"}"#),
            Err(ProtocolError::InvalidData(_))
        ));
    }

    #[test]
    fn test_encode_requests() {
        assert_eq!(Request::Whois.encode().unwrap(), r#"{"cmd":"whois"}"#);
        assert_eq!(Request::GetIdList.encode().unwrap(), r#"{"cmd":"get_id_list"}"#);

        let read: Value =
            serde_json::from_str(&Request::Read { sid: "s1".into() }.encode().unwrap()).unwrap();
        assert_eq!(read, json!({"cmd": "read", "sid": "s1"}));
    }

    #[test]
    fn test_write_request_keeps_extra_fields() {
        let req: WriteRequest = serde_json::from_value(json!({
            "sid": "s1",
            "model": "plug",
            "data": {"status": "on"},
            "custom": 7
        }))
        .unwrap();
        assert_eq!(req.cmd, "write");
        assert_eq!(req.extra.get("custom"), Some(&json!(7)));

        let encoded: Value =
            serde_json::from_str(&Request::Write(req).encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"cmd": "write", "sid": "s1", "model": "plug", "data": {"status": "on"}, "custom": 7})
        );
    }

    #[test]
    fn test_write_request_requires_object_data() {
        let res: Result<WriteRequest, _> =
            serde_json::from_value(json!({"sid": "s1", "data": "on"}));
        assert!(res.is_err());
    }
}
