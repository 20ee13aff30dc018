//! Commands arriving on `<prefix>/to/...`.

use serde_json::{Map, Value};

use super::error::BridgeError;
use crate::gateway::{protocol::WriteRequest, Sid};

#[derive(Debug, Clone, PartialEq)]
pub enum BusCommand {
    /// `to/read` with `{"sid": ...}`
    Read { sid: Sid },
    /// `to/get_id_list` with `{"sid": ...}`
    GetIdList { sid: Sid },
    /// `to/write` with a full write body, or `to/<sid>[/<cmd>]` with the
    /// data object as payload
    Write(WriteRequest),
}

impl BusCommand {
    /// Parses the topic path after `<prefix>/to/` and the raw payload. An
    /// empty payload counts as `{}`.
    pub fn parse(suffix: &str, payload: &str) -> Result<Self, BridgeError> {
        let body: Value = if payload.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(payload)
                .map_err(|_| BridgeError::InvalidJson(payload.to_string()))?
        };

        match suffix {
            "read" => Ok(BusCommand::Read {
                sid: sid_of(&body, suffix)?,
            }),
            "get_id_list" => Ok(BusCommand::GetIdList {
                sid: sid_of(&body, suffix)?,
            }),
            "write" => serde_json::from_value(body)
                .map(BusCommand::Write)
                .map_err(|e| BridgeError::InvalidCommand {
                    command: suffix.to_string(),
                    reason: e.to_string(),
                }),
            path => {
                let mut pieces = path.split('/');
                let sid = pieces.next().unwrap_or_default();
                if sid.is_empty() {
                    return Err(BridgeError::InvalidCommand {
                        command: path.to_string(),
                        reason: "topic names no sid".to_string(),
                    });
                }
                let cmd = pieces.next().filter(|c| !c.is_empty()).unwrap_or("write");

                let Value::Object(data) = body else {
                    return Err(BridgeError::InvalidCommand {
                        command: path.to_string(),
                        reason: "payload must be a JSON object".to_string(),
                    });
                };
                Ok(BusCommand::Write(WriteRequest::new(cmd, sid, data)))
            }
        }
    }
}

fn sid_of(body: &Value, command: &str) -> Result<Sid, BridgeError> {
    body.get("sid")
        .and_then(Value::as_str)
        .filter(|sid| !sid.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BridgeError::MissingSid(command.to_string()))
}
