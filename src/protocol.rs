//! Control-plane message schema
//!
//! Every message on the wire is a UTF-8 JSON object with a `type` field.
//! Inbound: `start` / `stop`. Outbound: transcripts, translation updates,
//! status and error messages.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::asr_engine::AsrSegment;
use crate::translation::TranslationOutcome;

/// Wall-clock seconds as a float, matching client expectations
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Parsed inbound command
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    /// `start` with its config object (empty object when omitted)
    Start(Value),
    Stop,
    /// Valid JSON with an unrecognized `type`
    Unknown(String),
    /// Not a JSON object
    Invalid,
}

pub fn parse_inbound(raw: &str) -> InboundCommand {
    let Ok(message) = serde_json::from_str::<Value>(raw) else {
        return InboundCommand::Invalid;
    };

    let msg_type = message.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match msg_type {
        "start" => {
            let config = message
                .get("config")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            InboundCommand::Start(config)
        }
        "stop" => InboundCommand::Stop,
        other => InboundCommand::Unknown(other.to_string()),
    }
}

/// Outbound messages, serialized with their `type` tag
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Partial {
        text: String,
        translation: Option<String>,
        is_final: bool,
        timestamp: f64,
    },
    Final {
        text: String,
        entry_id: u64,
        translation: Option<String>,
        is_final: bool,
        timestamp: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        translation_backend: Option<String>,
    },
    TranslationUpdate {
        source_text: String,
        entry_id: u64,
        translation: String,
        is_final: bool,
        timestamp: f64,
        translation_backend: String,
    },
    Status {
        status: String,
    },
    Error {
        message: String,
    },
}

impl OutboundMessage {
    /// Build the transcript message for an ASR emission
    pub fn from_segment(segment: &AsrSegment) -> Self {
        if segment.is_final {
            OutboundMessage::Final {
                text: segment.text.clone(),
                entry_id: segment.entry_id.unwrap_or(0),
                translation: None,
                is_final: true,
                timestamp: now_timestamp(),
                translation_backend: None,
            }
        } else {
            OutboundMessage::Partial {
                text: segment.text.clone(),
                translation: None,
                is_final: false,
                timestamp: now_timestamp(),
            }
        }
    }

    /// Build the follow-up message for a completed translation.
    /// Returns None for empty translations (failed jobs are suppressed).
    pub fn from_translation(outcome: &TranslationOutcome) -> Option<Self> {
        if outcome.translated_text.trim().is_empty() {
            return None;
        }
        Some(OutboundMessage::TranslationUpdate {
            source_text: outcome.source_text.clone(),
            entry_id: outcome.entry_id.unwrap_or(0),
            translation: outcome.translated_text.clone(),
            is_final: true,
            timestamp: now_timestamp(),
            translation_backend: outcome
                .backend
                .map(|b| b.to_string())
                .unwrap_or_default(),
        })
    }

    pub fn status(status: &str) -> Self {
        OutboundMessage::Status {
            status: status.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize outbound message: {}", e);
            "{\"type\":\"error\",\"message\":\"serialization failure\"}".to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::BackendKind;
    use serde_json::json;

    #[test]
    fn parse_start_with_config() {
        let cmd = parse_inbound(r#"{"type":"start","config":{"asr.model_size":"tiny"}}"#);
        let InboundCommand::Start(config) = cmd else {
            panic!("expected start");
        };
        assert_eq!(config, json!({"asr.model_size": "tiny"}));
    }

    #[test]
    fn parse_start_without_config() {
        assert_eq!(
            parse_inbound(r#"{"type":"start"}"#),
            InboundCommand::Start(json!({}))
        );
    }

    #[test]
    fn parse_stop_and_unknown() {
        assert_eq!(parse_inbound(r#"{"type":"stop"}"#), InboundCommand::Stop);
        assert_eq!(
            parse_inbound(r#"{"type":"pause"}"#),
            InboundCommand::Unknown("pause".to_string())
        );
        assert_eq!(parse_inbound("not json"), InboundCommand::Invalid);
    }

    #[test]
    fn partial_wire_shape() {
        let segment = AsrSegment {
            text: "hello".to_string(),
            is_final: false,
            language: None,
            confidence: None,
            entry_id: None,
        };
        let value: Value =
            serde_json::from_str(&OutboundMessage::from_segment(&segment).to_json()).unwrap();

        assert_eq!(value["type"], "partial");
        assert_eq!(value["text"], "hello");
        assert_eq!(value["translation"], Value::Null);
        assert_eq!(value["is_final"], false);
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn final_wire_shape() {
        let segment = AsrSegment {
            text: "hello world".to_string(),
            is_final: true,
            language: Some("en".to_string()),
            confidence: None,
            entry_id: Some(3),
        };
        let value: Value =
            serde_json::from_str(&OutboundMessage::from_segment(&segment).to_json()).unwrap();

        assert_eq!(value["type"], "final");
        assert_eq!(value["entry_id"], 3);
        assert_eq!(value["is_final"], true);
        // Absent until a translation_update arrives
        assert_eq!(value["translation"], Value::Null);
        assert!(value.get("translation_backend").is_none());
    }

    #[test]
    fn translation_update_wire_shape() {
        let outcome = TranslationOutcome {
            source_text: "hello".to_string(),
            translated_text: "xin chào".to_string(),
            backend: Some(BackendKind::Local),
            entry_id: Some(3),
        };
        let message = OutboundMessage::from_translation(&outcome).unwrap();
        let value: Value = serde_json::from_str(&message.to_json()).unwrap();

        assert_eq!(value["type"], "translation_update");
        assert_eq!(value["source_text"], "hello");
        assert_eq!(value["translation"], "xin chào");
        assert_eq!(value["translation_backend"], "local");
        assert_eq!(value["entry_id"], 3);
    }

    #[test]
    fn failed_translation_suppressed() {
        let outcome = TranslationOutcome {
            source_text: "hello".to_string(),
            translated_text: String::new(),
            backend: None,
            entry_id: Some(1),
        };
        assert!(OutboundMessage::from_translation(&outcome).is_none());
    }

    #[test]
    fn status_and_error_shapes() {
        let value: Value =
            serde_json::from_str(&OutboundMessage::status("started").to_json()).unwrap();
        assert_eq!(value, json!({"type": "status", "status": "started"}));

        let value: Value =
            serde_json::from_str(&OutboundMessage::error("Unknown type: pause").to_json())
                .unwrap();
        assert_eq!(value, json!({"type": "error", "message": "Unknown type: pause"}));
    }
}
