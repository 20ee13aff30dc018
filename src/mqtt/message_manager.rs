use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use super::config::TopicMode;

/// A message as it crosses the bus boundary, in either direction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(80).collect();
        write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: String, content: String) -> Self {
        MQTTMessage {
            topic,
            content,
            timestamp: chrono::Local::now().naive_local(),
        }
    }
}

/// Outbound payload published for every device event and every notice.
///
/// Device events fill `cmd`, `model`, `sid`, `short_id` and `data`; notices
/// and errors only carry `cmd: "xm"` and `msg`. Absent fields are left out of
/// the JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub cmd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

pub const NOTICE_CMD: &str = "xm";

impl Envelope {
    pub fn event(
        cmd: impl Into<String>,
        model: Option<String>,
        sid: Option<String>,
        short_id: Option<Value>,
        data: Value,
    ) -> Self {
        Self {
            cmd: cmd.into(),
            model,
            sid,
            short_id,
            data: Some(data),
            msg: None,
        }
    }

    pub fn notice(msg: impl Into<String>) -> Self {
        Self {
            cmd: NOTICE_CMD.to_string(),
            model: None,
            sid: None,
            short_id: None,
            data: None,
            msg: Some(msg.into()),
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Topic layout below the configured prefix.
#[derive(Debug, Clone)]
pub struct Topics {
    from: String,
    to: String,
    mode: TopicMode,
}

impl Topics {
    pub fn new(prefix: &str, mode: TopicMode) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            from: format!("{prefix}/from"),
            to: format!("{prefix}/to"),
            mode,
        }
    }

    /// Filter the bridge subscribes to for inbound commands.
    pub fn subscription(&self) -> String {
        format!("{}/#", self.to)
    }

    /// Returns the command path after `<prefix>/to/`, or `None` when the
    /// topic is outside the command tree.
    pub fn command_suffix<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.to.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }

    /// Every (topic, payload) pair to publish for `envelope` under the
    /// configured mode. The canonical `<prefix>/from` message comes first.
    pub fn fan_out(&self, envelope: &Envelope) -> Vec<MQTTMessage> {
        let json = envelope.to_string();
        let mut out = vec![MQTTMessage::from_topic(self.from.clone(), json.clone())];

        match self.mode {
            TopicMode::Short => {}
            TopicMode::Full | TopicMode::Both => {
                if let (Some(sid), Some(model)) = (&envelope.sid, &envelope.model) {
                    let mut topic = format!("{}/{}/{}/{}", self.from, sid, envelope.cmd, model);
                    if envelope
                        .data
                        .as_ref()
                        .and_then(|data| data.get("status"))
                        .is_some_and(is_truthy)
                    {
                        topic.push_str("/status");
                    }
                    out.push(MQTTMessage::from_topic(topic, json));
                }
            }
            TopicMode::Each => {
                if let Some(model) = &envelope.model {
                    let base = match &envelope.sid {
                        Some(sid) => format!("{}/{}/{}", self.from, model, sid),
                        None => format!("{}/{}", self.from, model),
                    };
                    if let Some(Value::Object(fields)) = &envelope.data {
                        for (key, value) in fields {
                            out.push(MQTTMessage::from_topic(
                                format!("{base}/{key}"),
                                value.to_string(),
                            ));
                        }
                    }
                }

                let topic = match &envelope.sid {
                    Some(sid) => format!("{}/cmd/{}/{}", self.from, envelope.cmd, sid),
                    None => format!("{}/cmd/{}", self.from, envelope.cmd),
                };
                out.push(MQTTMessage::from_topic(topic, json));
            }
        }

        out
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn switch_event() -> Envelope {
        Envelope::event(
            "report",
            Some("switch".into()),
            Some("S1".into()),
            None,
            json!({"status": "on"}),
        )
    }

    fn topics_of(messages: &[MQTTMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.topic.as_str()).collect()
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = Envelope::event(
            "report",
            Some("magnet".into()),
            Some("s1".into()),
            Some(json!(5)),
            json!({"status": "open"}),
        );
        assert_eq!(
            envelope.to_string(),
            r#"{"cmd":"report","model":"magnet","sid":"s1","short_id":5,"data":{"status":"open"}}"#
        );
        assert_eq!(
            Envelope::notice("xiaomi-mqtt started.").to_string(),
            r#"{"cmd":"xm","msg":"xiaomi-mqtt started."}"#
        );
    }

    #[test]
    fn test_short_mode_only_canonical() {
        let topics = Topics::new("xiaomi", TopicMode::Short);
        let out = topics.fan_out(&switch_event());
        assert_eq!(topics_of(&out), vec!["xiaomi/from"]);
    }

    #[test]
    fn test_full_mode_status_suffix() {
        let topics = Topics::new("xiaomi", TopicMode::Full);
        let out = topics.fan_out(&switch_event());
        assert_eq!(
            topics_of(&out),
            vec!["xiaomi/from", "xiaomi/from/S1/report/switch/status"]
        );
        assert_eq!(out[0].content, out[1].content);

        let no_status = Envelope::event(
            "heartbeat",
            Some("switch".into()),
            Some("S1".into()),
            None,
            json!({"voltage": 3000}),
        );
        let out = Topics::new("xiaomi", TopicMode::Both).fan_out(&no_status);
        assert_eq!(
            topics_of(&out),
            vec!["xiaomi/from", "xiaomi/from/S1/heartbeat/switch"]
        );
    }

    #[test]
    fn test_full_mode_skips_notices() {
        let out = Topics::new("xiaomi", TopicMode::Full).fan_out(&Envelope::notice("hello"));
        assert_eq!(topics_of(&out), vec!["xiaomi/from"]);
    }

    #[test]
    fn test_each_mode_per_field() {
        let topics = Topics::new("xiaomi", TopicMode::Each);
        let out = topics.fan_out(&switch_event());
        assert_eq!(
            topics_of(&out),
            vec!["xiaomi/from", "xiaomi/from/switch/S1/status", "xiaomi/from/cmd/report/S1"]
        );
        assert_eq!(out[1].content, r#""on""#);
        assert_eq!(out[2].content, out[0].content);
    }

    #[test]
    fn test_each_mode_notice_without_sid() {
        let out = Topics::new("home", TopicMode::Each).fan_out(&Envelope::notice("hi"));
        assert_eq!(topics_of(&out), vec!["home/from", "home/from/cmd/xm"]);
    }

    #[test]
    fn test_command_suffix() {
        let topics = Topics::new("xiaomi", TopicMode::Short);
        assert_eq!(topics.subscription(), "xiaomi/to/#");
        assert_eq!(topics.command_suffix("xiaomi/to/read"), Some("read"));
        assert_eq!(topics.command_suffix("xiaomi/to/158d0001/write"), Some("158d0001/write"));
        assert_eq!(topics.command_suffix("xiaomi/to/"), None);
        assert_eq!(topics.command_suffix("xiaomi/toaster"), None);
        assert_eq!(topics.command_suffix("other/to/read"), None);
    }
}
