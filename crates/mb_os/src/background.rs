#![forbid(unsafe_code)]

use mb_engines::analytics::{attribution_user_properties, events, AnalyticsClient};
use mb_engines::transport::{AttributionTransport, TransportConfig};
use mb_engines::{now_unix_ms, AttributionPolicy, EnvironmentSource, FingerprintGenerator, IdentifierStore};
use mb_kernel_contracts::attribution::AttributionRecord;
use mb_kernel_contracts::identity::{IdentifierSource, ResolvedIdentity, UserIdentifier};
use mb_kernel_contracts::fingerprint::DeviceFingerprint;
use mb_kernel_contracts::message::{ContextMessage, ContextResponse, MessageAction};
use mb_kernel_contracts::transport::ForwardedAttribution;
use mb_kernel_contracts::{storage_keys, UnixTimeMs, Validate};
use mb_storage::{read_stamped, write_stamped, KeyValueBackend, Stamped};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::{Envelope, InProcessChannel};
use crate::install_date::format_install_date;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallReason {
    Install,
    Update,
}

impl InstallReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallDetails {
    pub reason: InstallReason,
    pub version: String,
}

/// Reply body of `getUserProperties`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPropertiesReply {
    pub user_id: UserIdentifier,
    pub device_id: DeviceFingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_date: Option<UnixTimeMs>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// The extension's long-lived background context. Owns the extension storage and answers
/// requests from page contexts.
pub struct BackgroundContext<B: KeyValueBackend> {
    storage: B,
    identity: ResolvedIdentity,
    policy: AttributionPolicy,
    transport: AttributionTransport,
    analytics: Option<AnalyticsClient>,
}

impl<B: KeyValueBackend> BackgroundContext<B> {
    /// Resolves the extension identity from its own storage. The stored device id wins over
    /// the fingerprint computed now.
    pub fn start<E>(
        mut storage: B,
        environment: &E,
        policy: AttributionPolicy,
        transport: TransportConfig,
        now: UnixTimeMs,
    ) -> Self
    where
        E: EnvironmentSource + ?Sized,
    {
        let local_fingerprint = FingerprintGenerator::generate(environment, now);
        let mut ids = IdentifierStore::new(IdentifierSource::Ext);
        let device_id = ids.get_or_create_device_id(&mut storage, &local_fingerprint);
        let user_id = ids.get_or_create(&mut storage, &device_id, now);
        info!(user_id = %user_id, device_id = %device_id, "background context started");
        Self {
            storage,
            identity: ResolvedIdentity {
                user_id,
                device_id,
                local_fingerprint,
            },
            policy,
            transport: AttributionTransport::new(transport),
            analytics: None,
        }
    }

    pub fn with_analytics(mut self, analytics: AnalyticsClient) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn identity(&self) -> &ResolvedIdentity {
        &self.identity
    }

    pub fn storage(&self) -> &B {
        &self.storage
    }

    pub fn handle(&mut self, message: ContextMessage, now: UnixTimeMs) -> ContextResponse {
        debug!(action = message.action.as_str(), "background request");
        match message.action {
            MessageAction::FetchAttribution => self.fetch_attribution(now),
            MessageAction::StoreAttribution => self.store_attribution(message.data, now),
            MessageAction::FetchUserProperties => self.user_properties(),
        }
    }

    /// Website attribution held by the extension, if still inside the retention window.
    pub fn stored_attribution(&mut self, now: UnixTimeMs) -> Option<ForwardedAttribution> {
        let stamped: Stamped<ForwardedAttribution> =
            read_stamped(&self.storage, storage_keys::WEBSITE_ATTRIBUTION)?;
        if stamped.age_ms(now) > self.policy.retention_ms {
            debug!(age_ms = stamped.age_ms(now), "stored website attribution expired");
            if let Err(err) = self.storage.remove(storage_keys::WEBSITE_ATTRIBUTION) {
                warn!(error = %err, "expired website attribution not removed");
            }
            return None;
        }
        Some(stamped.value)
    }

    fn fetch_attribution(&mut self, now: UnixTimeMs) -> ContextResponse {
        let Some(stored) = self.stored_attribution(now) else {
            return ContextResponse::ok(None);
        };
        match serde_json::to_value(&stored.record) {
            Ok(data) => ContextResponse::ok(Some(data)),
            Err(err) => ContextResponse::failed(format!("attribution not serializable: {err}")),
        }
    }

    fn store_attribution(&mut self, data: Option<Value>, now: UnixTimeMs) -> ContextResponse {
        let Some(data) = data else {
            return ContextResponse::failed("setWebsiteAttribution requires data");
        };
        let forwarded = match serde_json::from_value::<ForwardedAttribution>(data) {
            Ok(forwarded) => forwarded,
            Err(err) => return ContextResponse::failed(format!("malformed attribution: {err}")),
        };
        if let Err(err) = forwarded.record.validate() {
            return ContextResponse::failed(format!("invalid attribution: {err}"));
        }
        if let Err(err) = write_stamped(&mut self.storage, storage_keys::WEBSITE_ATTRIBUTION, &forwarded, now) {
            warn!(error = %err, "website attribution not persisted");
            return ContextResponse::failed(err.to_string());
        }

        let mut merged = self.load_user_properties();
        merged.extend(attribution_user_properties(&forwarded.record));
        merged.insert("attribution_source".to_string(), Value::from("website"));
        if let Some(method) = forwarded.recovery_method {
            merged.insert("recovery_method".to_string(), Value::from(method.as_str()));
        }
        if let Err(err) = write_stamped(&mut self.storage, storage_keys::USER_PROPERTIES, &merged, now) {
            warn!(error = %err, "merged user properties not persisted");
        }
        info!(
            recovery_method = forwarded.recovery_method.map(|m| m.as_str()).unwrap_or("direct"),
            "website attribution stored"
        );
        if let Some(analytics) = self.analytics.as_mut() {
            let _ = analytics.identify(merged.clone(), now);
            let mut props = Map::new();
            props.insert("attribution_source".to_string(), Value::from("website"));
            let _ = analytics.track(events::ATTRIBUTION_SYNCED, props, now);
        }
        ContextResponse::ok(Some(Value::Object(merged)))
    }

    fn user_properties(&self) -> ContextResponse {
        let reply = UserPropertiesReply {
            user_id: self.identity.user_id.clone(),
            device_id: self.identity.device_id.clone(),
            install_date: self.install_date(),
            properties: self.load_user_properties(),
        };
        match serde_json::to_value(reply) {
            Ok(data) => ContextResponse::ok(Some(data)),
            Err(err) => ContextResponse::failed(err.to_string()),
        }
    }

    fn load_user_properties(&self) -> Map<String, Value> {
        read_stamped::<Map<String, Value>, B>(&self.storage, storage_keys::USER_PROPERTIES)
            .map(|s| s.value)
            .unwrap_or_default()
    }

    pub fn install_date(&self) -> Option<UnixTimeMs> {
        read_stamped::<UnixTimeMs, B>(&self.storage, storage_keys::INSTALL_DATE).map(|s| s.value)
    }

    /// Runs once per install or update. On a fresh install, records the install date,
    /// reports "Extension Installed" with any website attribution, and returns the welcome
    /// page URL carrying the extension's identifiers.
    pub fn on_installed(&mut self, details: &InstallDetails, welcome_base: &Url, now: UnixTimeMs) -> Option<Url> {
        if details.reason != InstallReason::Install {
            debug!(reason = details.reason.as_str(), version = %details.version, "extension updated");
            return None;
        }
        if let Err(err) = write_stamped(&mut self.storage, storage_keys::INSTALL_DATE, &now, now) {
            warn!(error = %err, "install date not persisted");
        }
        let website = self.stored_attribution(now);
        let mut record = website
            .as_ref()
            .map(|w| w.record.clone())
            .unwrap_or_else(|| AttributionRecord {
                captured_at: now,
                ..AttributionRecord::default()
            });
        record.extension_id = Some(self.transport.config().extension_id.clone());
        record.version = Some(details.version.clone());
        record.from_extension = true;
        record.install_date = Some(format_install_date(now));

        if let Some(analytics) = self.analytics.as_mut() {
            let mut props = install_event_properties(details, website.as_ref());
            props.insert("install_date".to_string(), Value::from(now.0));
            if let Some(w) = &website {
                let _ = analytics.identify(attribution_user_properties(&w.record), now);
            }
            let _ = analytics.track(events::EXTENSION_INSTALLED, props, now);
        }

        match self.transport.snapshot(&self.identity, Some(&record), None, now) {
            Ok(payload) => Some(AttributionTransport::handoff_url(welcome_base, &payload)),
            Err(err) => {
                warn!(error = %err, "welcome hand-off not built");
                None
            }
        }
    }
}

impl<B: KeyValueBackend + Send + 'static> BackgroundContext<B> {
    /// Answers requests until every channel handle is dropped, then hands the context back.
    pub async fn serve(mut self, mut requests: mpsc::Receiver<Envelope>) -> Self {
        while let Some(Envelope { message, reply }) = requests.recv().await {
            let response = self.handle(message, now_unix_ms());
            if reply.send(response).is_err() {
                debug!("requester went away before the reply");
            }
        }
        self
    }

    pub fn spawn(self, buffer: usize) -> (InProcessChannel, JoinHandle<Self>) {
        let (channel, requests) = InProcessChannel::pair(buffer);
        (channel, tokio::spawn(self.serve(requests)))
    }
}

/// Event properties for "Extension Installed": the install reason and version plus whatever
/// website attribution reached the extension.
pub fn install_event_properties(
    details: &InstallDetails,
    website: Option<&ForwardedAttribution>,
) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("reason".to_string(), Value::from(details.reason.as_str()));
    props.insert("version".to_string(), Value::from(details.version.as_str()));
    props.insert("has_attribution".to_string(), Value::from(website.is_some()));
    if let Some(w) = website {
        for (name, value) in w.record.utm.pairs() {
            props.insert(name.to_string(), Value::from(value));
        }
        if let Some(referrer) = &w.record.referrer {
            props.insert("referrer".to_string(), Value::from(referrer.as_str()));
        }
        if let Some(method) = w.recovery_method {
            props.insert("recovery_method".to_string(), Value::from(method.as_str()));
        }
    }
    props
}
