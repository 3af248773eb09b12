#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageAction {
    #[serde(rename = "getAttributionData")]
    FetchAttribution,
    #[serde(rename = "setWebsiteAttribution")]
    StoreAttribution,
    #[serde(rename = "getUserProperties")]
    FetchUserProperties,
}

impl MessageAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FetchAttribution => "getAttributionData",
            Self::StoreAttribution => "setWebsiteAttribution",
            Self::FetchUserProperties => "getUserProperties",
        }
    }
}

/// Request envelope exchanged between execution contexts: `{action, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub action: MessageAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ContextMessage {
    pub fn fetch_attribution() -> Self {
        Self {
            action: MessageAction::FetchAttribution,
            data: None,
        }
    }

    pub fn fetch_user_properties() -> Self {
        Self {
            action: MessageAction::FetchUserProperties,
            data: None,
        }
    }

    pub fn store_attribution(data: Value) -> Self {
        Self {
            action: MessageAction::StoreAttribution,
            data: Some(data),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContextResponse {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_msg_contract_01_wire_shape_uses_action_names() {
        let json = serde_json::to_string(&ContextMessage::fetch_attribution()).unwrap();
        assert_eq!(json, r#"{"action":"getAttributionData"}"#);
        let parsed: ContextMessage =
            serde_json::from_str(r#"{"action":"setWebsiteAttribution","data":{"a":1}}"#).unwrap();
        assert_eq!(parsed.action, MessageAction::StoreAttribution);
        assert_eq!(parsed.data, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn at_msg_contract_02_unknown_action_is_rejected() {
        assert!(serde_json::from_str::<ContextMessage>(r#"{"action":"wipe"}"#).is_err());
    }
}
