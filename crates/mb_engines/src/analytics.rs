#![forbid(unsafe_code)]

use std::env;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mb_kernel_contracts::analytics::{
    session_id_for, AnalyticsEvent, IngestionBatch, IDENTIFY_EVENT_TYPE,
};
use mb_kernel_contracts::attribution::AttributionRecord;
use mb_kernel_contracts::identity::ResolvedIdentity;
use mb_kernel_contracts::{ExecutionContextKind, UnixTimeMs};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub const DEFAULT_ANALYTICS_ENDPOINT: &str = "https://api.eu.amplitude.com/2/httpapi";

/// Event names shared by every context.
pub mod events {
    pub const LANDING_PAGE_VISIT: &str = "Landing Page Visit";
    pub const PAGE_VIEWED: &str = "Page Viewed";
    pub const REFERRAL_LANDING: &str = "Referral Landing";
    pub const INSTALL_INTENT: &str = "Install Intent";
    pub const INSTALL_BUTTON_CLICKED: &str = "Install Button Clicked";
    pub const EXTENSION_INSTALLED: &str = "Extension Installed";
    pub const WELCOME_PAGE_VIEWED: &str = "Welcome Page Viewed";
    pub const ATTRIBUTION_RECOVERED: &str = "Attribution Recovered";
    pub const ATTRIBUTION_NOT_FOUND: &str = "Attribution Not Found";
    pub const ATTRIBUTION_SYNCED: &str = "Attribution Synced";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsConfig {
    /// Without a key the client records nothing.
    pub api_key: Option<String>,
    pub endpoint: String,
    pub timeout_ms: u64,
}

impl AnalyticsConfig {
    pub fn mvp_v1() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ANALYTICS_ENDPOINT.to_string(),
            timeout_ms: 5_000,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::mvp_v1();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            api_key: non_empty("MB_ANALYTICS_API_KEY"),
            endpoint: non_empty("MB_ANALYTICS_ENDPOINT").unwrap_or(defaults.endpoint),
            timeout_ms: non_empty("MB_ANALYTICS_TIMEOUT_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| (100..=60_000).contains(v))
                .unwrap_or(defaults.timeout_ms),
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("ingestion endpoint returned http status {0}")]
    Status(u16),
    #[error("ingestion transport error: {0}")]
    Transport(String),
    #[error("event batch encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where finished batches go.
pub trait EventSink: Send + Sync {
    fn deliver(&self, batch: &IngestionBatch) -> Result<(), DeliveryError>;
}

/// Posts batches to the JSON ingestion endpoint.
pub struct HttpEventSink {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpEventSink {
    pub fn new(config: &AnalyticsConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            endpoint: config.endpoint.clone(),
            agent,
        }
    }
}

impl EventSink for HttpEventSink {
    fn deliver(&self, batch: &IngestionBatch) -> Result<(), DeliveryError> {
        let body = serde_json::to_string(batch)?;
        match self
            .agent
            .post(&self.endpoint)
            .set("content-type", "application/json")
            .send_string(&body)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(DeliveryError::Status(code)),
            Err(ureq::Error::Transport(err)) => Err(DeliveryError::Transport(err.to_string())),
        }
    }
}

/// Keeps every delivered batch; shares its buffer across clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    batches: Arc<Mutex<Vec<IngestionBatch>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<IngestionBatch> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.batches().into_iter().flat_map(|b| b.events).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn deliver(&self, batch: &IngestionBatch) -> Result<(), DeliveryError> {
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| DeliveryError::Transport("memory sink lock poisoned".to_string()))?;
        batches.push(batch.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliver on the calling thread and wait for the outcome.
    Blocking,
    /// Fire and forget on a detached thread, like a page-unload beacon.
    Beacon,
}

/// Sends events on behalf of one resolved identity. Construction requires the identity, so
/// no event can go out before identity resolution has finished.
pub struct AnalyticsClient {
    api_key: Option<String>,
    identity: ResolvedIdentity,
    platform: ExecutionContextKind,
    sink: Arc<dyn EventSink>,
    mode: DeliveryMode,
    sequence: u64,
}

impl AnalyticsClient {
    pub fn new(
        config: &AnalyticsConfig,
        identity: &ResolvedIdentity,
        platform: ExecutionContextKind,
        sink: Arc<dyn EventSink>,
        mode: DeliveryMode,
    ) -> Self {
        if config.api_key.is_none() {
            debug!("analytics api key not configured, events will be dropped");
        }
        Self {
            api_key: config.api_key.clone(),
            identity: identity.clone(),
            platform,
            sink,
            mode,
            sequence: 0,
        }
    }

    /// HTTP delivery to the configured endpoint.
    pub fn over_http(
        config: &AnalyticsConfig,
        identity: &ResolvedIdentity,
        platform: ExecutionContextKind,
        mode: DeliveryMode,
    ) -> Self {
        let sink: Arc<dyn EventSink> = Arc::new(HttpEventSink::new(config));
        Self::new(config, identity, platform, sink, mode)
    }

    pub fn identity(&self) -> &ResolvedIdentity {
        &self.identity
    }

    pub fn track(
        &mut self,
        event_type: &str,
        properties: Map<String, Value>,
        now: UnixTimeMs,
    ) -> Result<(), DeliveryError> {
        let event = self.build_event(event_type, properties, None, now);
        self.dispatch(event)
    }

    /// Sets user properties through an `$identify` event.
    pub fn identify(
        &mut self,
        user_properties: Map<String, Value>,
        now: UnixTimeMs,
    ) -> Result<(), DeliveryError> {
        let event = self.build_event(IDENTIFY_EVENT_TYPE, Map::new(), Some(user_properties), now);
        self.dispatch(event)
    }

    pub fn build_event(
        &mut self,
        event_type: &str,
        event_properties: Map<String, Value>,
        user_properties: Option<Map<String, Value>>,
        now: UnixTimeMs,
    ) -> AnalyticsEvent {
        self.sequence += 1;
        AnalyticsEvent {
            user_id: self.identity.user_id.to_string(),
            device_id: self.identity.device_id.to_string(),
            session_id: session_id_for(now.0),
            event_type: event_type.to_string(),
            event_properties,
            user_properties,
            time: now.0,
            platform: Some(self.platform.platform_name().to_string()),
            insert_id: Some(insert_id(
                self.identity.user_id.as_str(),
                event_type,
                now,
                self.sequence,
            )),
        }
    }

    fn dispatch(&self, event: AnalyticsEvent) -> Result<(), DeliveryError> {
        let Some(api_key) = self.api_key.clone() else {
            return Ok(());
        };
        let event_type = event.event_type.clone();
        let batch = IngestionBatch {
            api_key,
            events: vec![event],
        };
        match self.mode {
            DeliveryMode::Blocking => {
                let result = self.sink.deliver(&batch);
                if let Err(err) = &result {
                    warn!(event_type = %event_type, error = %err, "analytics delivery failed");
                }
                result
            }
            DeliveryMode::Beacon => {
                let sink = Arc::clone(&self.sink);
                thread::spawn(move || {
                    if let Err(err) = sink.deliver(&batch) {
                        warn!(event_type = %event_type, error = %err, "analytics beacon failed");
                    }
                });
                Ok(())
            }
        }
    }
}

/// Deduplication key: hex SHA-256 over the event's identity, truncated to 32 characters.
pub fn insert_id(user_id: &str, event_type: &str, now: UnixTimeMs, sequence: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(event_type.as_bytes());
    hasher.update(now.0.to_le_bytes());
    hasher.update(sequence.to_le_bytes());
    let digest = hasher.finalize();
    let mut hex = format!("{digest:x}");
    hex.truncate(32);
    hex
}

/// First-touch user properties derived from an attribution record.
pub fn attribution_user_properties(record: &AttributionRecord) -> Map<String, Value> {
    let mut props = Map::new();
    for (name, value) in record.utm.pairs() {
        props.insert(format!("initial_{name}"), Value::String(value.to_string()));
    }
    if let Some(referrer) = &record.referrer {
        props.insert("initial_referrer".to_string(), Value::String(referrer.clone()));
    }
    if let Some(landing) = &record.landing_page {
        props.insert("initial_landing_page".to_string(), Value::String(landing.clone()));
    }
    if let Some(ts) = &record.traffic_source {
        props.insert("traffic_source".to_string(), Value::String(ts.source.clone()));
        props.insert(
            "traffic_channel".to_string(),
            Value::String(ts.channel.as_str().to_string()),
        );
    }
    if let Some(code) = &record.referral_code {
        props.insert("referral_code".to_string(), Value::String(code.clone()));
    }
    props
}
