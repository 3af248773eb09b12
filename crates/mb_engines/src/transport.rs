#![forbid(unsafe_code)]

use std::env;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use mb_kernel_contracts::attribution::{
    AttributionRecord, InstallIntentRecord, TrafficChannel, TrafficSource, UtmParams,
};
use mb_kernel_contracts::fingerprint::DeviceFingerprint;
use mb_kernel_contracts::identity::{ResolvedIdentity, UserIdentifier};
use mb_kernel_contracts::message::ContextMessage;
use mb_kernel_contracts::transport::{
    query_params, CookiePayload, ForwardedAttribution, RecoveryMethod, TransportPayload,
    ATTRIBUTION_COOKIE_MAX_AGE_SECS, ATTRIBUTION_COOKIE_NAME,
};
use mb_kernel_contracts::{storage_keys, ContractViolation, UnixTimeMs};
use mb_storage::{read_stamped, write_stamped, CookieJar, KeyValueBackend, SameSite, SetCookie, Stamped};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_COOKIE_DOMAIN: &str = ".monkey-block.com";
pub const DEFAULT_EXTENSION_ID: &str = "ggccjkdgmlclpigflghjjkgeblgdgffe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Parent domain for the attribution cookie so every subdomain can read it.
    pub cookie_domain: String,
    pub cookie_max_age_secs: u64,
    pub extension_id: String,
}

impl TransportConfig {
    pub fn mvp_v1() -> Self {
        Self {
            cookie_domain: DEFAULT_COOKIE_DOMAIN.to_string(),
            cookie_max_age_secs: ATTRIBUTION_COOKIE_MAX_AGE_SECS,
            extension_id: DEFAULT_EXTENSION_ID.to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::mvp_v1();
        Self {
            cookie_domain: non_empty("MB_COOKIE_DOMAIN").unwrap_or(defaults.cookie_domain),
            cookie_max_age_secs: defaults.cookie_max_age_secs,
            extension_id: non_empty("MB_EXTENSION_ID")
                .filter(|id| {
                    let valid = is_extension_id(id);
                    if !valid {
                        warn!(extension_id = %id, "MB_EXTENSION_ID is not an extension id, using default");
                    }
                    valid
                })
                .unwrap_or(defaults.extension_id),
        }
    }
}

/// Chrome extension ids are 32 characters drawn from `a..=p`.
pub fn is_extension_id(raw: &str) -> bool {
    raw.len() == 32 && raw.bytes().all(|b| (b'a'..=b'p').contains(&b))
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

/// The install call-to-action the user activated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallClick {
    pub button_location: String,
    pub button_text: Option<String>,
    pub page_path: Option<String>,
}

impl InstallClick {
    pub fn new(button_location: impl Into<String>) -> Self {
        Self {
            button_location: button_location.into(),
            button_text: None,
            page_path: None,
        }
    }

    pub fn intent(&self, now: UnixTimeMs) -> InstallIntentRecord {
        InstallIntentRecord {
            created_at: now,
            button_location: self.button_location.clone(),
            button_text: self.button_text.clone(),
            page_path: self.page_path.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportDecodeError {
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload rejected: {0}")]
    Contract(#[from] ContractViolation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediumWrite {
    Written,
    Skipped,
    Failed(String),
}

impl MediumWrite {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

/// Per-medium result of a hand-off write. One failing medium never blocks another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportWriteReport {
    pub pre_install: MediumWrite,
    pub install_intent: MediumWrite,
    pub cookie: MediumWrite,
}

impl TransportWriteReport {
    pub fn any_written(&self) -> bool {
        self.pre_install.is_written() || self.install_intent.is_written() || self.cookie.is_written()
    }
}

/// Serializes attribution into every medium a later context might read.
#[derive(Debug, Clone, Default)]
pub struct AttributionTransport {
    config: TransportConfig,
}

impl AttributionTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Bundles the identity with the landing record (or an empty one stamped `now`).
    pub fn snapshot(
        &self,
        identity: &ResolvedIdentity,
        landing: Option<&AttributionRecord>,
        click: Option<&InstallClick>,
        now: UnixTimeMs,
    ) -> Result<TransportPayload, ContractViolation> {
        let mut attribution = landing.cloned().unwrap_or_else(|| AttributionRecord {
            captured_at: now,
            ..AttributionRecord::default()
        });
        attribution.user_id = Some(identity.user_id.clone());
        attribution.fingerprint = Some(identity.device_id.clone());
        if let Some(click) = click {
            attribution.button_location = Some(click.button_location.clone());
        }
        TransportPayload::v1(
            identity.user_id.clone(),
            identity.device_id.clone(),
            attribution,
            now,
        )
    }

    /// Base64 of the reduced `{uid, did, utm}` JSON.
    pub fn cookie_value(payload: &TransportPayload) -> Result<String, serde_json::Error> {
        let reduced = CookiePayload {
            uid: payload.user_id.clone(),
            did: payload.device_id.clone(),
            utm: payload.attribution.utm.utm_source.clone(),
        };
        Ok(STANDARD.encode(serde_json::to_vec(&reduced)?))
    }

    pub fn cookie(&self, payload: &TransportPayload) -> Result<SetCookie, serde_json::Error> {
        Ok(SetCookie::new(ATTRIBUTION_COOKIE_NAME, Self::cookie_value(payload)?)
            .domain(self.config.cookie_domain.clone())
            .max_age_secs(self.config.cookie_max_age_secs)
            .same_site(SameSite::Lax))
    }

    /// Query pairs for a URL hand-off. The hand-off identifiers take the place of the
    /// record's own `user_id` and `fingerprint`.
    pub fn query_pairs(payload: &TransportPayload) -> Vec<(&'static str, String)> {
        let record = &payload.attribution;
        let mut pairs = vec![
            (query_params::USER_ID, payload.user_id.to_string()),
            (query_params::DEVICE_ID, payload.device_id.to_string()),
        ];
        pairs.extend(record.utm.pairs().into_iter().map(|(k, v)| (k, v.to_string())));
        let optional = [
            (query_params::REFERRER, record.referrer.as_deref()),
            (query_params::LANDING_PAGE, record.landing_page.as_deref()),
            (query_params::REFERRAL, record.referral_code.as_deref()),
            (query_params::BUTTON_LOCATION, record.button_location.as_deref()),
            (query_params::EXTENSION_ID, record.extension_id.as_deref()),
            (query_params::VERSION, record.version.as_deref()),
            (query_params::INSTALL_DATE, record.install_date.as_deref()),
        ];
        pairs.extend(
            optional
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v.to_string()))),
        );
        pairs.push((query_params::CAPTURED_AT, record.captured_at.0.to_string()));
        if record.from_extension {
            pairs.push((query_params::FROM_EXTENSION, "1".to_string()));
        }
        if let Some(ts) = &record.traffic_source {
            pairs.push((query_params::TRAFFIC_SOURCE, ts.source.clone()));
            pairs.push((query_params::TRAFFIC_CHANNEL, ts.channel.as_str().to_string()));
        }
        pairs
    }

    pub fn handoff_url(base: &Url, payload: &TransportPayload) -> Url {
        let mut url = base.clone();
        url.query_pairs_mut().extend_pairs(Self::query_pairs(payload));
        url
    }

    /// `setWebsiteAttribution` request carrying a recovered record.
    pub fn store_message(
        record: &AttributionRecord,
        method: Option<RecoveryMethod>,
        now: UnixTimeMs,
    ) -> Result<ContextMessage, serde_json::Error> {
        let forwarded = ForwardedAttribution {
            record: record.clone(),
            recovery_method: method,
            recovered_at: now,
        };
        Ok(ContextMessage::store_attribution(serde_json::to_value(forwarded)?))
    }

    /// Writes the payload to page storage and the parent-domain cookie, plus the install
    /// intent when a click triggered the hand-off. Each medium is attempted independently.
    pub fn write_all<B>(
        &self,
        payload: &TransportPayload,
        click: Option<&InstallClick>,
        page: &mut B,
        cookies: &CookieJar,
        host: &str,
        now: UnixTimeMs,
    ) -> TransportWriteReport
    where
        B: KeyValueBackend + ?Sized,
    {
        let pre_install = medium_result(
            "pre_install",
            write_stamped(&mut *page, storage_keys::PRE_INSTALL_ATTRIBUTION, payload, now),
        );
        let install_intent = match click {
            Some(click) => medium_result(
                "install_intent",
                write_stamped(&mut *page, storage_keys::INSTALL_INTENT, &click.intent(now), now),
            ),
            None => MediumWrite::Skipped,
        };
        let cookie = match self.cookie(payload) {
            Ok(cookie) => medium_result("cookie", cookies.set(host, cookie, now)),
            Err(err) => medium_result("cookie", Err(err)),
        };
        let report = TransportWriteReport {
            pre_install,
            install_intent,
            cookie,
        };
        debug!(?report, "attribution hand-off written");
        report
    }
}

fn medium_result<E: std::fmt::Display>(medium: &'static str, result: Result<(), E>) -> MediumWrite {
    match result {
        Ok(()) => MediumWrite::Written,
        Err(err) => {
            warn!(medium, error = %err, "attribution hand-off write failed");
            MediumWrite::Failed(err.to_string())
        }
    }
}

pub fn decode_cookie_value(raw: &str) -> Result<CookiePayload, TransportDecodeError> {
    let bytes = STANDARD.decode(raw.trim())?;
    let json = String::from_utf8(bytes)?;
    Ok(serde_json::from_str(&json)?)
}

/// The `mb_attr` cookie visible on `host`; unreadable or corrupt cookies read as absent.
pub fn read_attribution_cookie(cookies: &CookieJar, host: &str, now: UnixTimeMs) -> Option<CookiePayload> {
    let raw = match cookies.get(host, ATTRIBUTION_COOKIE_NAME, now) {
        Ok(raw) => raw?,
        Err(err) => {
            warn!(error = %err, "attribution cookie unreadable");
            return None;
        }
    };
    match decode_cookie_value(&raw) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(error = %err, "discarding malformed attribution cookie");
            None
        }
    }
}

/// The hand-off payload a page stored right before the install redirect.
pub fn read_pre_install<B>(backend: &B) -> Option<Stamped<TransportPayload>>
where
    B: KeyValueBackend + ?Sized,
{
    read_stamped(backend, storage_keys::PRE_INSTALL_ATTRIBUTION)
}

pub fn read_install_intent<B>(backend: &B) -> Option<InstallIntentRecord>
where
    B: KeyValueBackend + ?Sized,
{
    read_stamped::<InstallIntentRecord, B>(backend, storage_keys::INSTALL_INTENT).map(|s| s.value)
}

/// What a page learns from the query string it was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UrlHandoff {
    pub user_id: Option<UserIdentifier>,
    pub device_id: Option<DeviceFingerprint>,
    pub record: AttributionRecord,
}

impl UrlHandoff {
    /// Malformed identifiers are treated as absent. `did` wins over `fp`.
    pub fn from_url(url: &Url) -> Self {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let get = |name: &str| {
            pairs
                .iter()
                .find(|(k, v)| k == name && !v.trim().is_empty())
                .map(|(_, v)| v.clone())
        };
        let user_id = get(query_params::USER_ID).and_then(|raw| UserIdentifier::parse(raw).ok());
        let device_id = get(query_params::DEVICE_ID)
            .and_then(|raw| DeviceFingerprint::parse(raw).ok())
            .or_else(|| get(query_params::FINGERPRINT).and_then(|raw| DeviceFingerprint::parse(raw).ok()));
        let traffic_source = match (get(query_params::TRAFFIC_SOURCE), get(query_params::TRAFFIC_CHANNEL)) {
            (Some(source), Some(channel)) => serde_json::from_value::<TrafficChannel>(Value::String(channel))
                .ok()
                .map(|channel| TrafficSource { source, channel }),
            _ => None,
        };
        let record = AttributionRecord {
            utm: UtmParams::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
            referrer: get(query_params::REFERRER),
            landing_page: get(query_params::LANDING_PAGE),
            captured_at: get(query_params::CAPTURED_AT)
                .and_then(|v| v.parse::<u64>().ok())
                .map(UnixTimeMs)
                .unwrap_or_default(),
            fingerprint: device_id.clone(),
            user_id: user_id.clone(),
            traffic_source,
            referral_code: get(query_params::REFERRAL),
            button_location: get(query_params::BUTTON_LOCATION),
            extension_id: get(query_params::EXTENSION_ID),
            version: get(query_params::VERSION),
            from_extension: get(query_params::FROM_EXTENSION).is_some_and(|v| v == "1" || v == "true"),
            install_date: get(query_params::INSTALL_DATE),
        };
        Self {
            user_id,
            device_id,
            record,
        }
    }

    /// Both a user id and a device id arrived: an explicit hand-off.
    pub fn is_complete(&self) -> bool {
        self.user_id.is_some() && self.device_id.is_some()
    }
}
