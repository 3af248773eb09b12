#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const IDENTIFY_EVENT_TYPE: &str = "$identify";
pub const SESSION_BUCKET_MS: u64 = 30 * 60 * 1000;

/// One event in the ingestion endpoint's fixed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub user_id: String,
    pub device_id: String,
    pub session_id: u64,
    pub event_type: String,
    pub event_properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_properties: Option<Map<String, Value>>,
    pub time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<String>,
}

/// Request body of the JSON event-ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub api_key: String,
    pub events: Vec<AnalyticsEvent>,
}

/// Session ids are the event time floored to a 30-minute bucket.
pub const fn session_id_for(now_ms: u64) -> u64 {
    now_ms - (now_ms % SESSION_BUCKET_MS)
}
