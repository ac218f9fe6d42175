//! Messages arriving from the client

use super::dispatcher::Priority;
use crate::core::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One decoded client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IncomingMessage {
    /// Property values changed on a component
    DataPush {
        form: String,
        bean: String,
        changes: Map<String, Value>,
    },
    /// Property values changed on a service
    ServiceDataPush {
        service: String,
        changes: Map<String, Value>,
    },
    /// A component event handler should run
    Event {
        form: String,
        bean: String,
        event: String,
        #[serde(default)]
        args: Vec<Value>,
        /// Set when the client waits for the handler's return value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cmsgid: Option<u64>,
    },
    /// Answer to a blocking server call
    Reply {
        #[serde(rename = "smsgid")]
        id: u64,
        #[serde(default)]
        ret: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exception: Option<String>,
    },
}

impl IncomingMessage {
    /// Decode a text frame
    pub fn parse(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Dispatch priority
    ///
    /// Replies are critical so they can resume a blocking call; everything
    /// else keeps the order the client sent it in.
    pub fn priority(&self) -> Priority {
        match self {
            IncomingMessage::Reply { .. } => Priority::Critical,
            _ => Priority::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_frames() {
        let push = IncomingMessage::parse(
            r#"{"type":"dataPush","form":"main","bean":"field","changes":{"text":"a"}}"#,
        )
        .unwrap();
        assert!(matches!(push, IncomingMessage::DataPush { ref bean, .. } if bean == "field"));
        assert_eq!(push.priority(), Priority::Normal);

        let event = IncomingMessage::parse(
            r#"{"type":"event","form":"main","bean":"button","event":"onClick","cmsgid":7}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            IncomingMessage::Event {
                form: "main".into(),
                bean: "button".into(),
                event: "onClick".into(),
                args: vec![],
                cmsgid: Some(7),
            }
        );

        let reply = IncomingMessage::parse(r#"{"type":"reply","smsgid":3,"ret":[1]}"#).unwrap();
        assert_eq!(reply.priority(), Priority::Critical);
        assert!(matches!(reply, IncomingMessage::Reply { id: 3, ref ret, exception: None } if *ret == json!([1])));
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(IncomingMessage::parse(r#"{"type":"resize"}"#).is_err());
        assert!(IncomingMessage::parse("not json").is_err());
    }
}
