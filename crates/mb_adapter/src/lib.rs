#![forbid(unsafe_code)]

use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use mb_engines::analytics::{AnalyticsClient, AnalyticsConfig, DeliveryMode};
use mb_engines::transport::TransportConfig;
use mb_engines::{now_unix_ms, AttributionPolicy, EnvironmentReadError, EnvironmentSource};
use mb_kernel_contracts::fingerprint::EnvironmentAttributes;
use mb_kernel_contracts::message::{ContextMessage, ContextResponse};
use mb_kernel_contracts::{ExecutionContextKind, UnixTimeMs};
use mb_os::{BackgroundContext, ChannelError, MessageChannel};
use mb_storage::{ExtensionStorage, KeyValueBackend};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_BACKGROUND_HTTP_BIND: &str = "127.0.0.1:8791";
pub const CONTEXT_MESSAGE_PATH: &str = "/v1/context/message";

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("background context lock poisoned")]
    LockPoisoned,
    #[error("invalid bind address '{0}'")]
    InvalidBind(String),
    #[error("background worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn bind_addr_from_env() -> Result<SocketAddr, AdapterError> {
    bind_addr_from_lookup(|key| env::var(key).ok())
}

pub fn bind_addr_from_lookup<F>(lookup: F) -> Result<SocketAddr, AdapterError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup("MB_BACKGROUND_HTTP_BIND")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_BACKGROUND_HTTP_BIND.to_string());
    raw.parse().map_err(|_| AdapterError::InvalidBind(raw))
}

/// Environment attributes of the host process: `TZ`, the POSIX locale, the OS and the
/// available parallelism.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl EnvironmentSource for ProcessEnvironment {
    fn read_attributes(&self) -> Result<EnvironmentAttributes, EnvironmentReadError> {
        let var = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        let timezone = var("TZ");
        let language = var("LC_ALL").or_else(|| var("LANG")).map(|raw| locale_to_language_tag(&raw));
        if timezone.is_none() && language.is_none() {
            return Err(EnvironmentReadError::Unavailable("TZ and LANG"));
        }
        Ok(EnvironmentAttributes {
            timezone,
            language,
            platform: Some(env::consts::OS.to_string()),
            hardware_concurrency: std::thread::available_parallelism()
                .ok()
                .and_then(|n| u32::try_from(n.get()).ok()),
            ..EnvironmentAttributes::default()
        })
    }
}

/// `en_US.UTF-8` -> `en-US`.
pub fn locale_to_language_tag(raw: &str) -> String {
    raw.split(['.', '@'])
        .next()
        .unwrap_or(raw)
        .trim()
        .replace('_', "-")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub has_website_attribution: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdapterHealthResponse {
    fn error(reason: String) -> Self {
        Self {
            status: "error".to_string(),
            user_id: None,
            device_id: None,
            has_website_attribution: false,
            reason: Some(reason),
        }
    }
}

/// The background context behind a lock, shared by every request handler.
pub struct AdapterRuntime<B: KeyValueBackend> {
    background: Mutex<BackgroundContext<B>>,
}

impl AdapterRuntime<ExtensionStorage> {
    /// Extension storage at `MB_EXTENSION_STORAGE_PATH`, policy and transport from the
    /// environment, analytics over HTTP when `MB_ANALYTICS_API_KEY` is set.
    pub fn default_from_env() -> Self {
        let background = BackgroundContext::start(
            ExtensionStorage::default_local(),
            &ProcessEnvironment,
            AttributionPolicy::from_env(),
            TransportConfig::from_env(),
            now_unix_ms(),
        );
        let analytics = AnalyticsClient::over_http(
            &AnalyticsConfig::from_env(),
            background.identity(),
            ExecutionContextKind::Extension,
            DeliveryMode::Blocking,
        );
        Self::new(background.with_analytics(analytics))
    }
}

impl<B: KeyValueBackend> AdapterRuntime<B> {
    pub fn new(background: BackgroundContext<B>) -> Self {
        Self {
            background: Mutex::new(background),
        }
    }

    pub fn handle(&self, message: ContextMessage, now: UnixTimeMs) -> Result<ContextResponse, AdapterError> {
        let mut background = self.background.lock().map_err(|_| AdapterError::LockPoisoned)?;
        Ok(background.handle(message, now))
    }

    pub fn health_report(&self, now: UnixTimeMs) -> Result<AdapterHealthResponse, AdapterError> {
        let mut background = self.background.lock().map_err(|_| AdapterError::LockPoisoned)?;
        let identity = background.identity().clone();
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            user_id: Some(identity.user_id.to_string()),
            device_id: Some(identity.device_id.to_string()),
            has_website_attribution: background.stored_attribution(now).is_some(),
            reason: None,
        })
    }
}

pub fn router<B>(runtime: Arc<AdapterRuntime<B>>) -> Router
where
    B: KeyValueBackend + Send + 'static,
{
    Router::new()
        .route("/healthz", get(healthz::<B>))
        .route(CONTEXT_MESSAGE_PATH, post(post_message::<B>))
        .with_state(runtime)
}

async fn healthz<B>(State(runtime): State<Arc<AdapterRuntime<B>>>) -> (StatusCode, Json<AdapterHealthResponse>)
where
    B: KeyValueBackend + Send + 'static,
{
    match runtime.health_report(now_unix_ms()) {
        Ok(report) => (StatusCode::OK, Json(report)),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdapterHealthResponse::error(err.to_string())),
        ),
    }
}

/// Storage and analytics delivery block, so each message is handled on the blocking pool.
pub async fn post_message<B>(
    State(runtime): State<Arc<AdapterRuntime<B>>>,
    Json(message): Json<ContextMessage>,
) -> (StatusCode, Json<ContextResponse>)
where
    B: KeyValueBackend + Send + 'static,
{
    let action = message.action;
    let outcome = tokio::task::spawn_blocking(move || runtime.handle(message, now_unix_ms()))
        .await
        .map_err(|err| AdapterError::Worker(err.to_string()))
        .and_then(|result| result);
    match outcome {
        Ok(response) if response.success => (StatusCode::OK, Json(response)),
        Ok(response) => {
            debug!(action = action.as_str(), error = response.error.as_deref().unwrap_or(""), "message refused");
            (StatusCode::UNPROCESSABLE_ENTITY, Json(response))
        }
        Err(err) => {
            warn!(action = action.as_str(), error = %err, "message handling failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ContextResponse::failed(err.to_string())),
            )
        }
    }
}

/// Message channel to a background context served by `mb_background_http`.
#[derive(Debug, Clone)]
pub struct HttpMessageChannel {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpMessageChannel {
    pub fn new(base_url: &str, timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            endpoint: format!("{}{CONTEXT_MESSAGE_PATH}", base_url.trim_end_matches('/')),
            agent,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl MessageChannel for HttpMessageChannel {
    async fn request(&self, message: ContextMessage) -> Result<ContextResponse, ChannelError> {
        let agent = self.agent.clone();
        let endpoint = self.endpoint.clone();
        tokio::task::spawn_blocking(move || post_blocking(&agent, &endpoint, &message))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))?
    }
}

fn post_blocking(agent: &ureq::Agent, endpoint: &str, message: &ContextMessage) -> Result<ContextResponse, ChannelError> {
    let response = match agent.post(endpoint).send_json(message) {
        Ok(response) => response,
        // Refusals still carry a ContextResponse body.
        Err(ureq::Error::Status(422, response)) => response,
        Err(ureq::Error::Status(code, _)) => {
            return Err(ChannelError::Transport(format!("background answered status {code}")))
        }
        Err(ureq::Error::Transport(err)) if err.kind() == ureq::ErrorKind::ConnectionFailed => {
            return Err(ChannelError::Unavailable)
        }
        Err(ureq::Error::Transport(err)) => return Err(ChannelError::Transport(err.to_string())),
    };
    response
        .into_json::<ContextResponse>()
        .map_err(|err| ChannelError::Transport(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_engines::StaticEnvironment;
    use mb_kernel_contracts::attribution::{AttributionRecord, UtmParams};
    use mb_kernel_contracts::message::MessageAction;
    use mb_os::request_with_timeout;
    use mb_storage::{MemoryBackend, StorageMedium};

    const NOW: UnixTimeMs = UnixTimeMs(1_712_000_000_000);

    fn runtime() -> Arc<AdapterRuntime<MemoryBackend>> {
        let env = StaticEnvironment(EnvironmentAttributes {
            timezone: Some("UTC".to_string()),
            ..EnvironmentAttributes::default()
        });
        Arc::new(AdapterRuntime::new(BackgroundContext::start(
            MemoryBackend::acting_as(StorageMedium::ExtensionStorage),
            &env,
            AttributionPolicy::mvp_v1(),
            TransportConfig::mvp_v1(),
            NOW,
        )))
    }

    fn store_message() -> ContextMessage {
        let record = AttributionRecord {
            utm: UtmParams::from_pairs([("utm_source", "reddit")]),
            captured_at: NOW,
            ..AttributionRecord::default()
        };
        mb_engines::AttributionTransport::store_message(&record, None, NOW).unwrap()
    }

    #[test]
    fn at_adapter_01_bind_address_from_env() {
        let default = bind_addr_from_lookup(|_| None).unwrap();
        assert_eq!(default.to_string(), DEFAULT_BACKGROUND_HTTP_BIND);
        let custom = bind_addr_from_lookup(|_| Some("0.0.0.0:9000".to_string())).unwrap();
        assert_eq!(custom.port(), 9000);
        assert!(matches!(
            bind_addr_from_lookup(|_| Some("localhost".to_string())),
            Err(AdapterError::InvalidBind(_))
        ));
    }

    #[test]
    fn at_adapter_02_posix_locale_becomes_language_tag() {
        assert_eq!(locale_to_language_tag("en_US.UTF-8"), "en-US");
        assert_eq!(locale_to_language_tag("de_DE@euro"), "de-DE");
        assert_eq!(locale_to_language_tag("C"), "C");
    }

    #[tokio::test]
    async fn at_adapter_03_handler_answers_and_refuses() {
        let rt = runtime();
        let (status, Json(response)) = post_message(State(rt.clone()), Json(store_message())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(response.success);

        let empty = ContextMessage {
            action: MessageAction::StoreAttribution,
            data: None,
        };
        let (status, Json(response)) = post_message(State(rt.clone()), Json(empty)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!response.success);

        let (status, Json(health)) = healthz(State(rt)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(health.has_website_attribution);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn at_adapter_04_http_channel_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(runtime())).await;
        });

        let channel = HttpMessageChannel::new(&format!("http://{addr}/"), 2_000);
        assert_eq!(channel.endpoint(), format!("http://{addr}/v1/context/message"));
        let stored = request_with_timeout(&channel, store_message(), 2_000).await.unwrap();
        assert!(stored.success);
        let fetched = request_with_timeout(&channel, ContextMessage::fetch_attribution(), 2_000)
            .await
            .unwrap();
        let record: AttributionRecord = serde_json::from_value(fetched.data.unwrap()).unwrap();
        assert_eq!(record.utm.utm_source.as_deref(), Some("reddit"));

        let refused = ContextMessage {
            action: MessageAction::StoreAttribution,
            data: Some(serde_json::json!({ "captured_at": "yesterday" })),
        };
        let response = request_with_timeout(&channel, refused, 2_000).await.unwrap();
        assert!(!response.success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn at_adapter_05_nobody_listening_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let channel = HttpMessageChannel::new(&format!("http://{addr}"), 500);
        let got = request_with_timeout(&channel, ContextMessage::fetch_attribution(), 2_000).await;
        assert_eq!(got, Err(ChannelError::Unavailable));
    }
}
