#![forbid(unsafe_code)]

use std::sync::Arc;

use mb_engines::analytics::{
    attribution_user_properties, events, AnalyticsClient, AnalyticsConfig, DeliveryMode, EventSink,
};
use mb_engines::transport::{AttributionTransport, InstallClick, TransportConfig};
use mb_engines::{
    AttributionPolicy, AttributionRecorder, EnvironmentSource, FingerprintGenerator, IdentifierStore,
    PageVisit, RecordOutcome,
};
use mb_kernel_contracts::attribution::{AttributionRecord, ReferralCode};
use mb_kernel_contracts::identity::{IdentifierSource, ResolvedIdentity};
use mb_kernel_contracts::message::ContextMessage;
use mb_kernel_contracts::transport::{query_params, RecoveryMethod};
use mb_kernel_contracts::{storage_keys, ExecutionContextKind, UnixTimeMs};
use mb_storage::{read_stamped, CookieJar, KeyValueBackend};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::background::UserPropertiesReply;
use crate::channel::{request_with_timeout, MessageChannel, UnavailableChannel};
use crate::install_date::{resolve_install_date, ResolvedInstallDate};
use crate::reconciler::{AttributionReconciler, LocalEvidence, Recovered, RecoverySources};

struct AnalyticsSetup {
    config: AnalyticsConfig,
    sink: Arc<dyn EventSink>,
    mode: DeliveryMode,
}

/// What the one-time startup settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextStartup {
    pub identity: ResolvedIdentity,
    pub recovered: Option<Recovered>,
    /// Recovered attribution reached the background context.
    pub forwarded: bool,
    pub landing: RecordOutcome,
    pub referral: Option<ReferralCode>,
}

/// Builder for one page context. Everything the startup sequence needs is injected here;
/// `start` runs the sequence exactly once and yields the `PageContext` call sites use.
pub struct ContextClient<B, C = UnavailableChannel> {
    kind: ExecutionContextKind,
    page: B,
    cookies: CookieJar,
    channel: Option<C>,
    policy: AttributionPolicy,
    transport: TransportConfig,
    analytics: Option<AnalyticsSetup>,
}

impl<B: KeyValueBackend> ContextClient<B, UnavailableChannel> {
    pub fn new(kind: ExecutionContextKind, page: B, cookies: CookieJar) -> Self {
        Self {
            kind,
            page,
            cookies,
            channel: None,
            policy: AttributionPolicy::mvp_v1(),
            transport: TransportConfig::mvp_v1(),
            analytics: None,
        }
    }
}

impl<B: KeyValueBackend, C: MessageChannel> ContextClient<B, C> {
    pub fn with_policy(mut self, policy: AttributionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Route to the extension background context.
    pub fn with_channel<C2: MessageChannel>(self, channel: C2) -> ContextClient<B, C2> {
        ContextClient {
            kind: self.kind,
            page: self.page,
            cookies: self.cookies,
            channel: Some(channel),
            policy: self.policy,
            transport: self.transport,
            analytics: self.analytics,
        }
    }

    pub fn with_analytics(mut self, config: AnalyticsConfig, sink: Arc<dyn EventSink>, mode: DeliveryMode) -> Self {
        self.analytics = Some(AnalyticsSetup { config, sink, mode });
        self
    }

    /// Resolves identity, recovers attribution, then records this visit. Never fails: every
    /// degraded path ends with a usable context, at worst a fresh identity and no attribution.
    pub async fn start<E>(self, environment: &E, visit: &PageVisit, now: UnixTimeMs) -> PageContext<B, C>
    where
        E: EnvironmentSource + ?Sized,
    {
        let Self {
            kind,
            mut page,
            cookies,
            channel,
            policy,
            transport,
            analytics,
        } = self;
        let local_fingerprint = FingerprintGenerator::generate(environment, now);
        let evidence = LocalEvidence::gather(&page, local_fingerprint.clone());

        let mut ids = IdentifierStore::new(IdentifierSource::for_context(kind));
        let device_id = ids.get_or_create_device_id(&mut page, &local_fingerprint);
        let user_id = ids.get_or_create(&mut page, &device_id, now);
        let mut identity = ResolvedIdentity {
            user_id,
            device_id,
            local_fingerprint,
        };

        let reconciler = AttributionReconciler::new(policy);
        let recovered = {
            let sources = RecoverySources {
                url: Some(&visit.url),
                page: &page,
                cookies: &cookies,
                host: visit.host(),
                channel: channel.as_ref(),
            };
            reconciler.recover(&sources, &evidence, now).await
        };

        let mut forwarded = false;
        if let Some(found) = &recovered {
            if let Some((user_id, device_id)) = found.identifiers() {
                match ids.adopt(&mut page, user_id, device_id) {
                    Ok(()) => {
                        identity.user_id = user_id.clone();
                        identity.device_id = device_id.clone();
                    }
                    Err(err) => warn!(error = %err, "recovered identifiers not adopted"),
                }
            }
            if found.method != RecoveryMethod::ExtensionMessage {
                if let Some(channel) = channel.as_ref() {
                    forwarded = forward(channel, found, policy.message_timeout_ms, now).await;
                }
            }
        }

        let mut analytics = analytics.map(|setup| {
            AnalyticsClient::new(&setup.config, &identity, kind, setup.sink, setup.mode)
        });
        if let Some(client) = analytics.as_mut() {
            report_recovery(client, kind, recovered.as_ref(), now);
        }

        let recorder = AttributionRecorder::new(policy);
        let landing = recorder.record_if_attributable(&mut page, visit, &identity, now);
        let referral = recorder.capture_referral(&mut page, &cookies, visit, now);
        if let Some(client) = analytics.as_mut() {
            report_visit(client, kind, visit, &landing, referral.as_ref(), now);
        }

        info!(
            context = kind.platform_name(),
            user_id = %identity.user_id,
            recovery_method = recovered.as_ref().map(|r| r.method.as_str()).unwrap_or("none"),
            "context started"
        );
        PageContext {
            kind,
            host: visit.host().to_string(),
            install_date_param: visit.query(query_params::INSTALL_DATE),
            page,
            cookies,
            channel,
            policy,
            recorder,
            transport: AttributionTransport::new(transport),
            analytics,
            startup: ContextStartup {
                identity,
                recovered,
                forwarded,
                landing,
                referral,
            },
        }
    }
}

async fn forward<C: MessageChannel>(
    channel: &C,
    found: &Recovered,
    timeout_ms: u64,
    now: UnixTimeMs,
) -> bool {
    let message = match AttributionTransport::store_message(&found.record, Some(found.method), now) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "recovered attribution not serializable");
            return false;
        }
    };
    match request_with_timeout(channel, message, timeout_ms).await {
        Ok(response) if response.success => true,
        Ok(response) => {
            debug!(error = response.error.as_deref().unwrap_or(""), "background refused attribution");
            false
        }
        Err(err) => {
            debug!(error = %err, "attribution not forwarded");
            false
        }
    }
}

fn report_recovery(
    client: &mut AnalyticsClient,
    kind: ExecutionContextKind,
    recovered: Option<&Recovered>,
    now: UnixTimeMs,
) {
    let mut props = Map::new();
    props.insert("context".to_string(), Value::from(kind.platform_name()));
    let Some(found) = recovered else {
        let _ = client.track(events::ATTRIBUTION_NOT_FOUND, props, now);
        return;
    };
    // This origin's own landing record; a repeat visit, not a recovery.
    if found.method == RecoveryMethod::LocalStorageLanding {
        debug!(context = kind.platform_name(), "landing record reused, not reported as recovered");
        return;
    }
    let record = &found.record;
    props.insert("recovery_method".to_string(), Value::from(found.method.as_str()));
    props.insert("has_utm".to_string(), Value::from(!record.utm.is_empty()));
    props.insert("has_referrer".to_string(), Value::from(record.referrer.is_some()));
    props.insert("source".to_string(), Value::from(recovered_source(record)));
    let _ = client.identify(attribution_user_properties(record), now);
    let _ = client.track(events::ATTRIBUTION_RECOVERED, props, now);
}

fn recovered_source(record: &AttributionRecord) -> &str {
    record
        .utm
        .utm_source
        .as_deref()
        .or_else(|| record.traffic_source.as_ref().map(|t| t.source.as_str()))
        .unwrap_or("unknown")
}

fn report_visit(
    client: &mut AnalyticsClient,
    kind: ExecutionContextKind,
    visit: &PageVisit,
    landing: &RecordOutcome,
    referral: Option<&ReferralCode>,
    now: UnixTimeMs,
) {
    let mut props = Map::new();
    props.insert("page_path".to_string(), Value::from(visit.url.path()));
    let event = match (kind, landing) {
        (ExecutionContextKind::Welcome, _) => events::WELCOME_PAGE_VIEWED,
        (_, RecordOutcome::Recorded(record) | RecordOutcome::NotPersisted(record)) => {
            props.extend(
                record
                    .utm
                    .pairs()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), Value::from(v))),
            );
            if let Some(ts) = &record.traffic_source {
                props.insert("traffic_source".to_string(), Value::from(ts.source.as_str()));
            }
            events::LANDING_PAGE_VISIT
        }
        (_, RecordOutcome::NotAttributable) => events::PAGE_VIEWED,
    };
    let _ = client.track(event, props, now);
    if let Some(code) = referral {
        let mut props = Map::new();
        props.insert("referral_code".to_string(), Value::from(code.as_str()));
        let _ = client.track(events::REFERRAL_LANDING, props, now);
    }
}

/// A started page context: the resolved identity plus the operations pages invoke later.
pub struct PageContext<B, C = UnavailableChannel> {
    kind: ExecutionContextKind,
    host: String,
    install_date_param: Option<String>,
    page: B,
    cookies: CookieJar,
    channel: Option<C>,
    policy: AttributionPolicy,
    recorder: AttributionRecorder,
    transport: AttributionTransport,
    analytics: Option<AnalyticsClient>,
    startup: ContextStartup,
}

impl<B: KeyValueBackend, C: MessageChannel> PageContext<B, C> {
    pub fn kind(&self) -> ExecutionContextKind {
        self.kind
    }

    pub fn identity(&self) -> &ResolvedIdentity {
        &self.startup.identity
    }

    pub fn startup(&self) -> &ContextStartup {
        &self.startup
    }

    pub fn page(&self) -> &B {
        &self.page
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn policy(&self) -> &AttributionPolicy {
        &self.policy
    }

    pub fn landing(&mut self, now: UnixTimeMs) -> Option<AttributionRecord> {
        self.recorder.load_landing(&mut self.page, now)
    }

    pub fn track(&mut self, event_type: &str, properties: Map<String, Value>, now: UnixTimeMs) {
        if let Some(client) = self.analytics.as_mut() {
            let _ = client.track(event_type, properties, now);
        }
    }

    /// Install call-to-action: snapshots identity and landing attribution into page storage,
    /// the install intent and the `mb_attr` cookie, then returns `store_url` with the
    /// hand-off parameters appended. Falls back to the bare store URL if no snapshot can be
    /// built.
    pub fn install_click(&mut self, click: &InstallClick, store_url: &Url, now: UnixTimeMs) -> Url {
        let mut landing = self.recorder.load_landing(&mut self.page, now);
        if let Some(record) = landing.as_mut().filter(|r| r.referral_code.is_none()) {
            record.referral_code = self.stored_referral().map(|code| code.as_str().to_string());
        }
        let payload = match self
            .transport
            .snapshot(&self.startup.identity, landing.as_ref(), Some(click), now)
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "install hand-off snapshot rejected");
                return store_url.clone();
            }
        };
        let report = self
            .transport
            .write_all(&payload, Some(click), &mut self.page, &self.cookies, &self.host, now);
        if !report.any_written() {
            warn!("install hand-off reached no medium, url parameters only");
        }

        let mut props = Map::new();
        props.insert("button_location".to_string(), Value::from(click.button_location.as_str()));
        if let Some(text) = &click.button_text {
            props.insert("button_text".to_string(), Value::from(text.as_str()));
        }
        if let Some(source) = payload.attribution.utm.utm_source.as_deref() {
            props.insert("utm_source".to_string(), Value::from(source));
        }
        self.track(events::INSTALL_BUTTON_CLICKED, props.clone(), now);
        self.track(events::INSTALL_INTENT, props, now);

        AttributionTransport::handoff_url(store_url, &payload)
    }

    fn stored_referral(&self) -> Option<ReferralCode> {
        read_stamped::<ReferralCode, B>(&self.page, storage_keys::REFERRAL_CODE).map(|s| s.value)
    }

    /// Install date for this user: the page's `install_date` parameter, else what the
    /// extension reports, else the user id mint time, else a week ago.
    pub async fn install_date(&self, now: UnixTimeMs) -> ResolvedInstallDate {
        let reported = match (&self.install_date_param, self.channel.as_ref()) {
            (None, Some(channel)) => self.reported_install_date(channel).await,
            _ => None,
        };
        resolve_install_date(
            self.install_date_param.as_deref(),
            reported,
            Some(&self.startup.identity.user_id),
            now,
        )
    }

    async fn reported_install_date(&self, channel: &C) -> Option<UnixTimeMs> {
        let response = request_with_timeout(
            channel,
            ContextMessage::fetch_user_properties(),
            self.policy.message_timeout_ms,
        )
        .await
        .ok()
        .filter(|r| r.success)?;
        serde_json::from_value::<UserPropertiesReply>(response.data?)
            .ok()?
            .install_date
    }
}
