#![forbid(unsafe_code)]

use mb_kernel_contracts::attribution::{
    AttributionRecord, ReferralCode, TrafficChannel, TrafficSource, UtmParams,
};
use mb_kernel_contracts::identity::ResolvedIdentity;
use mb_kernel_contracts::transport::{query_params, REFERRAL_COOKIE_NAME};
use mb_kernel_contracts::{storage_keys, UnixTimeMs};
use mb_storage::cookie::domain_matches;
use mb_storage::{read_stamped, write_stamped, CookieJar, KeyValueBackend, SameSite, SetCookie, Stamped};
use tracing::{debug, info, warn};
use url::Url;

use crate::policy::AttributionPolicy;

/// Referrer hosts with a known channel: (registrable domain, reported source, channel).
const KNOWN_REFERRERS: &[(&str, &str, TrafficChannel)] = &[
    ("google.com", "google", TrafficChannel::Organic),
    ("bing.com", "bing", TrafficChannel::Organic),
    ("duckduckgo.com", "duckduckgo", TrafficChannel::Organic),
    ("reddit.com", "reddit", TrafficChannel::Social),
    ("twitter.com", "twitter", TrafficChannel::Social),
    ("x.com", "twitter", TrafficChannel::Social),
    ("t.co", "twitter", TrafficChannel::Social),
    ("facebook.com", "facebook", TrafficChannel::Social),
    ("youtube.com", "youtube", TrafficChannel::Video),
];

/// One page load as seen by a page context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageVisit {
    pub url: Url,
    pub referrer: Option<String>,
}

impl PageVisit {
    pub fn parse(url: &str, referrer: Option<&str>) -> Result<Self, url::ParseError> {
        Ok(Self {
            url: Url::parse(url)?,
            referrer: referrer
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
        })
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// First value of `name` in the query string.
    pub fn query(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    pub fn utm(&self) -> UtmParams {
        let pairs: Vec<(String, String)> = self
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        UtmParams::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// The referrer, unless it points back at this site.
    pub fn external_referrer(&self) -> Option<&str> {
        let referrer = self.referrer.as_deref()?;
        let same_site = Url::parse(referrer)
            .ok()
            .and_then(|r| r.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|h| h == self.host().to_ascii_lowercase());
        (!same_site).then_some(referrer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(AttributionRecord),
    /// No UTM field and no external referrer; the stored record is untouched.
    NotAttributable,
    /// Attributable, but the medium refused the write.
    NotPersisted(AttributionRecord),
}

/// Captures landing attribution on page loads and serves it back within the retention
/// window.
#[derive(Debug, Clone, Copy)]
pub struct AttributionRecorder {
    policy: AttributionPolicy,
}

impl AttributionRecorder {
    pub fn new(policy: AttributionPolicy) -> Self {
        Self { policy }
    }

    /// Writes the visit's attribution under the landing key when it carries any signal.
    /// A visit without signal never overwrites an earlier record.
    pub fn record_if_attributable<B>(
        &self,
        backend: &mut B,
        visit: &PageVisit,
        identity: &ResolvedIdentity,
        now: UnixTimeMs,
    ) -> RecordOutcome
    where
        B: KeyValueBackend + ?Sized,
    {
        let utm = visit.utm();
        let referrer = visit.external_referrer().map(str::to_string);
        let record = AttributionRecord {
            traffic_source: Some(classify_traffic(&utm, referrer.as_deref())),
            referral_code: visit
                .query(query_params::REFERRAL)
                .and_then(|code| ReferralCode::parse(code).ok())
                .map(|code| code.as_str().to_string()),
            utm,
            referrer,
            landing_page: Some(visit.url.path().to_string()),
            captured_at: now,
            fingerprint: Some(identity.device_id.clone()),
            user_id: Some(identity.user_id.clone()),
            ..AttributionRecord::default()
        };
        if !record.has_signal() {
            debug!(page = %visit.url, "visit carries no attribution signal");
            return RecordOutcome::NotAttributable;
        }
        match write_stamped(backend, storage_keys::LANDING_ATTRIBUTION, &record, now) {
            Ok(()) => {
                info!(
                    source = record.traffic_source.as_ref().map(|t| t.source.as_str()).unwrap_or_default(),
                    "landing attribution recorded"
                );
                RecordOutcome::Recorded(record)
            }
            Err(err) => {
                warn!(medium = %backend.medium(), error = %err, "landing attribution not persisted");
                RecordOutcome::NotPersisted(record)
            }
        }
    }

    /// The stored landing record, or `None` when absent, corrupt or older than the
    /// retention window. Expired records are removed.
    pub fn load_landing<B>(&self, backend: &mut B, now: UnixTimeMs) -> Option<AttributionRecord>
    where
        B: KeyValueBackend + ?Sized,
    {
        let stamped: Stamped<AttributionRecord> =
            read_stamped(&*backend, storage_keys::LANDING_ATTRIBUTION)?;
        if stamped.value.is_expired(now, self.policy.retention_ms) {
            debug!(age_ms = stamped.age_ms(now), "landing attribution expired");
            if let Err(err) = backend.remove(storage_keys::LANDING_ATTRIBUTION) {
                warn!(medium = %backend.medium(), error = %err, "expired attribution not removed");
            }
            return None;
        }
        Some(stamped.value)
    }

    /// Stores a valid `ref` query parameter in page storage and in a 30 day cookie on the
    /// visited host. Invalid codes are ignored.
    pub fn capture_referral<B>(
        &self,
        backend: &mut B,
        cookies: &CookieJar,
        visit: &PageVisit,
        now: UnixTimeMs,
    ) -> Option<ReferralCode>
    where
        B: KeyValueBackend + ?Sized,
    {
        let raw = visit.query(query_params::REFERRAL)?;
        let code = match ReferralCode::parse(raw) {
            Ok(code) => code,
            Err(err) => {
                debug!(error = %err, "ignoring invalid referral code");
                return None;
            }
        };
        if let Err(err) = write_stamped(backend, storage_keys::REFERRAL_CODE, &code, now) {
            warn!(medium = %backend.medium(), error = %err, "referral code not stored");
        }
        let cookie = SetCookie::new(REFERRAL_COOKIE_NAME, code.as_str())
            .max_age_secs(self.policy.retention_ms / 1_000)
            .same_site(SameSite::Lax);
        if let Err(err) = cookies.set(visit.host(), cookie, now) {
            warn!(error = %err, "referral cookie not set");
        }
        Some(code)
    }
}

/// Reporting label: UTM source wins, then well-known referrer hosts, then the referrer
/// host itself; no referrer at all is direct traffic.
pub fn classify_traffic(utm: &UtmParams, referrer: Option<&str>) -> TrafficSource {
    if let Some(source) = utm.utm_source.as_deref() {
        return TrafficSource {
            source: source.to_string(),
            channel: TrafficChannel::Campaign,
        };
    }
    let Some(referrer) = referrer.filter(|r| !r.trim().is_empty()) else {
        return TrafficSource {
            source: "direct".to_string(),
            channel: TrafficChannel::Direct,
        };
    };
    let Some(host) = Url::parse(referrer)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    else {
        return TrafficSource {
            source: "unknown".to_string(),
            channel: TrafficChannel::Unknown,
        };
    };
    for (domain, source, channel) in KNOWN_REFERRERS {
        if domain_matches(&host, domain) {
            return TrafficSource {
                source: source.to_string(),
                channel: *channel,
            };
        }
    }
    TrafficSource {
        source: host.trim_start_matches("www.").to_string(),
        channel: TrafficChannel::Referral,
    }
}
