#![forbid(unsafe_code)]

use mb_engines::identifier::load_user_id;
use mb_engines::transport::{read_attribution_cookie, read_install_intent, read_pre_install};
use mb_engines::{AttributionPolicy, UrlHandoff};
use mb_kernel_contracts::attribution::{AttributionRecord, InstallIntentRecord, UtmParams};
use mb_kernel_contracts::fingerprint::DeviceFingerprint;
use mb_kernel_contracts::identity::UserIdentifier;
use mb_kernel_contracts::message::ContextMessage;
use mb_kernel_contracts::transport::RecoveryMethod;
use mb_kernel_contracts::{storage_keys, UnixTimeMs, Validate};
use mb_storage::{read_stamped, CookieJar, KeyValueBackend, Stamped};
use tracing::{debug, info};
use url::Url;

use crate::channel::{request_with_timeout, MessageChannel, UnavailableChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Url,
    PreInstallStorage,
    LandingStorage,
    Cookie,
    ExtensionMessage,
}

/// Strict attempt order; the first accepted candidate wins.
pub const RECOVERY_ORDER: [SourceKind; 5] = [
    SourceKind::Url,
    SourceKind::PreInstallStorage,
    SourceKind::LandingStorage,
    SourceKind::Cookie,
    SourceKind::ExtensionMessage,
];

impl SourceKind {
    pub const fn method(self) -> RecoveryMethod {
        match self {
            Self::Url => RecoveryMethod::UrlParametersComplete,
            Self::PreInstallStorage => RecoveryMethod::LocalStoragePreInstall,
            Self::LandingStorage => RecoveryMethod::LocalStorageLanding,
            Self::Cookie => RecoveryMethod::Cookie,
            Self::ExtensionMessage => RecoveryMethod::ExtensionMessage,
        }
    }
}

/// Where this context can look for attribution left by another one.
pub struct RecoverySources<'a, B: ?Sized, C = UnavailableChannel> {
    pub url: Option<&'a Url>,
    pub page: &'a B,
    pub cookies: &'a CookieJar,
    pub host: &'a str,
    pub channel: Option<&'a C>,
}

impl<'a, B> RecoverySources<'a, B, UnavailableChannel>
where
    B: KeyValueBackend + ?Sized,
{
    pub fn new(page: &'a B, cookies: &'a CookieJar, host: &'a str) -> Self {
        Self {
            url: None,
            page,
            cookies,
            host,
            channel: None,
        }
    }
}

impl<'a, B: ?Sized, C> RecoverySources<'a, B, C> {
    pub fn with_url(mut self, url: &'a Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_channel<C2: MessageChannel>(self, channel: &'a C2) -> RecoverySources<'a, B, C2> {
        RecoverySources {
            url: self.url,
            page: self.page,
            cookies: self.cookies,
            host: self.host,
            channel: Some(channel),
        }
    }
}

/// What this context already knows about itself, used to judge candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvidence {
    pub fingerprint: DeviceFingerprint,
    pub stored_user_id: Option<UserIdentifier>,
    pub install_intent: Option<InstallIntentRecord>,
}

impl LocalEvidence {
    pub fn gather<B>(page: &B, fingerprint: DeviceFingerprint) -> Self
    where
        B: KeyValueBackend + ?Sized,
    {
        Self {
            fingerprint,
            stored_user_id: load_user_id(page),
            install_intent: read_install_intent(page),
        }
    }
}

/// Why a recovered candidate was trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corroboration {
    ExplicitHandoff,
    FingerprintMatch,
    StoredIdentifierMatch,
    RecentInstallIntent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub record: AttributionRecord,
    pub user_id: Option<UserIdentifier>,
    pub device_id: Option<DeviceFingerprint>,
    pub method: RecoveryMethod,
    pub corroboration: Corroboration,
}

impl Recovered {
    /// Both identifiers arrived and can be adopted by this context.
    pub fn identifiers(&self) -> Option<(&UserIdentifier, &DeviceFingerprint)> {
        Some((self.user_id.as_ref()?, self.device_id.as_ref()?))
    }
}

struct Candidate {
    record: AttributionRecord,
    user_id: Option<UserIdentifier>,
    device_id: Option<DeviceFingerprint>,
}

impl Candidate {
    fn from_record(record: AttributionRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            device_id: record.fingerprint.clone(),
            record,
        }
    }
}

pub struct AttributionReconciler {
    policy: AttributionPolicy,
}

impl AttributionReconciler {
    pub fn new(policy: AttributionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AttributionPolicy {
        &self.policy
    }

    /// Tries every source in `RECOVERY_ORDER` and returns the first candidate that passes the
    /// trust rule. A rejected or missing candidate moves on to the next source. `None` is the
    /// expected outcome for a visitor nobody handed off.
    pub async fn recover<B, C>(
        &self,
        sources: &RecoverySources<'_, B, C>,
        evidence: &LocalEvidence,
        now: UnixTimeMs,
    ) -> Option<Recovered>
    where
        B: KeyValueBackend + ?Sized,
        C: MessageChannel,
    {
        for kind in RECOVERY_ORDER {
            let candidate = match kind {
                SourceKind::Url => sources.url.and_then(|url| self.from_url(url)),
                SourceKind::PreInstallStorage => self.from_pre_install(sources.page, now),
                SourceKind::LandingStorage => self.from_landing(sources.page, now),
                SourceKind::Cookie => from_cookie(sources.cookies, sources.host, now),
                SourceKind::ExtensionMessage => match sources.channel {
                    Some(channel) => self.from_extension(channel).await,
                    None => None,
                },
            };
            let Some(candidate) = candidate else {
                debug!(source = ?kind, "no attribution candidate");
                continue;
            };
            let Some(corroboration) = self.corroborate(kind, &candidate, evidence, now) else {
                info!(source = ?kind, "attribution candidate rejected, no corroboration");
                continue;
            };
            let method = kind.method();
            info!(
                recovery_method = method.as_str(),
                corroboration = ?corroboration,
                "attribution recovered"
            );
            return Some(Recovered {
                record: candidate.record,
                user_id: candidate.user_id,
                device_id: candidate.device_id,
                method,
                corroboration,
            });
        }
        debug!("no attribution recovered from any source");
        None
    }

    fn corroborate(
        &self,
        kind: SourceKind,
        candidate: &Candidate,
        evidence: &LocalEvidence,
        now: UnixTimeMs,
    ) -> Option<Corroboration> {
        if kind == SourceKind::Url {
            return Some(Corroboration::ExplicitHandoff);
        }
        if candidate.device_id.as_ref() == Some(&evidence.fingerprint) {
            return Some(Corroboration::FingerprintMatch);
        }
        if candidate.user_id.is_some() && candidate.user_id == evidence.stored_user_id {
            return Some(Corroboration::StoredIdentifierMatch);
        }
        evidence
            .install_intent
            .as_ref()
            .filter(|intent| intent.is_recent(now, self.policy.install_intent_window_ms))
            .map(|_| Corroboration::RecentInstallIntent)
    }

    fn from_url(&self, url: &Url) -> Option<Candidate> {
        let handoff = UrlHandoff::from_url(url);
        if !handoff.is_complete() {
            if handoff.user_id.is_some() || handoff.device_id.is_some() {
                debug!("partial url hand-off ignored");
            }
            return None;
        }
        Some(Candidate {
            record: handoff.record,
            user_id: handoff.user_id,
            device_id: handoff.device_id,
        })
    }

    fn from_pre_install<B>(&self, page: &B, now: UnixTimeMs) -> Option<Candidate>
    where
        B: KeyValueBackend + ?Sized,
    {
        let stamped = read_pre_install(page)?;
        if stamped.age_ms(now) > self.policy.retention_ms {
            debug!(age_ms = stamped.age_ms(now), "pre-install snapshot expired");
            return None;
        }
        let payload = stamped.value;
        Some(Candidate {
            record: payload.attribution,
            user_id: Some(payload.user_id),
            device_id: Some(payload.device_id),
        })
    }

    fn from_landing<B>(&self, page: &B, now: UnixTimeMs) -> Option<Candidate>
    where
        B: KeyValueBackend + ?Sized,
    {
        let stamped: Stamped<AttributionRecord> = read_stamped(page, storage_keys::LANDING_ATTRIBUTION)?;
        if stamped.age_ms(now) > self.policy.retention_ms {
            return None;
        }
        Some(Candidate::from_record(stamped.value))
    }

    async fn from_extension<C: MessageChannel>(&self, channel: &C) -> Option<Candidate> {
        let response = match request_with_timeout(
            channel,
            ContextMessage::fetch_attribution(),
            self.policy.message_timeout_ms,
        )
        .await
        {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "extension attribution unavailable");
                return None;
            }
        };
        if !response.success {
            debug!(error = response.error.as_deref().unwrap_or(""), "extension refused attribution request");
            return None;
        }
        let record: AttributionRecord = match serde_json::from_value(response.data?) {
            Ok(record) => record,
            Err(err) => {
                debug!(error = %err, "extension attribution malformed");
                return None;
            }
        };
        match record.validate() {
            Ok(()) => Some(Candidate::from_record(record)),
            Err(err) => {
                debug!(error = %err, "extension attribution invalid");
                None
            }
        }
    }
}

fn from_cookie(cookies: &CookieJar, host: &str, now: UnixTimeMs) -> Option<Candidate> {
    let cookie = read_attribution_cookie(cookies, host, now)?;
    let record = AttributionRecord {
        utm: UtmParams {
            utm_source: cookie.utm,
            ..UtmParams::default()
        },
        captured_at: now,
        fingerprint: Some(cookie.did.clone()),
        user_id: Some(cookie.uid.clone()),
        ..AttributionRecord::default()
    };
    Some(Candidate {
        record,
        user_id: Some(cookie.uid),
        device_id: Some(cookie.did),
    })
}
