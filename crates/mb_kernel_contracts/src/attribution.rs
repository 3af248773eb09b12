#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::fingerprint::DeviceFingerprint;
use crate::identity::UserIdentifier;
use crate::{ContractViolation, UnixTimeMs, Validate};

pub const UTM_FIELDS: [&str; 5] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_content",
    "utm_term",
];

pub const ATTRIBUTION_TEXT_MAX_LEN: usize = 2048;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct UtmParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
}

impl UtmParams {
    /// Builds from `(name, value)` pairs; unknown names and empty values are ignored and the
    /// first occurrence of a field wins.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut utm = Self::default();
        for (name, value) in pairs {
            if value.trim().is_empty() {
                continue;
            }
            let slot = match utm.slot_mut(name) {
                Some(slot) => slot,
                None => continue,
            };
            if slot.is_none() {
                *slot = Some(value.to_string());
            }
        }
        utm
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "utm_source" => self.utm_source.as_deref(),
            "utm_medium" => self.utm_medium.as_deref(),
            "utm_campaign" => self.utm_campaign.as_deref(),
            "utm_content" => self.utm_content.as_deref(),
            "utm_term" => self.utm_term.as_deref(),
            _ => None,
        }
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "utm_source" => Some(&mut self.utm_source),
            "utm_medium" => Some(&mut self.utm_medium),
            "utm_campaign" => Some(&mut self.utm_campaign),
            "utm_content" => Some(&mut self.utm_content),
            "utm_term" => Some(&mut self.utm_term),
            _ => None,
        }
    }

    /// Non-empty fields in canonical order.
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        UTM_FIELDS
            .iter()
            .filter_map(|name| self.get(name).map(|v| (*name, v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }
}

impl Validate for UtmParams {
    fn validate(&self) -> Result<(), ContractViolation> {
        for (_, value) in self.pairs() {
            if value.len() > ATTRIBUTION_TEXT_MAX_LEN {
                return Err(ContractViolation::InvalidRange {
                    field: "utm_params.value",
                    min: 1,
                    max: ATTRIBUTION_TEXT_MAX_LEN as u64,
                    got: value.len() as u64,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficChannel {
    Campaign,
    Organic,
    Social,
    Video,
    Referral,
    Direct,
    Unknown,
}

impl TrafficChannel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Campaign => "campaign",
            Self::Organic => "organic",
            Self::Social => "social",
            Self::Video => "video",
            Self::Referral => "referral",
            Self::Direct => "direct",
            Self::Unknown => "unknown",
        }
    }
}

/// Best-effort reporting label derived from UTM fields and the referrer host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficSource {
    pub source: String,
    pub channel: TrafficChannel,
}

/// Marketing attribution observed at one page visit, plus the identifiers that observed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionRecord {
    pub utm: UtmParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,
    pub captured_at: UnixTimeMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<DeviceFingerprint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserIdentifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_source: Option<TrafficSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub from_extension: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_date: Option<String>,
}

impl AttributionRecord {
    /// A visit carries attribution signal when it has any UTM field or a referrer.
    pub fn has_signal(&self) -> bool {
        !self.utm.is_empty() || self.referrer.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    pub fn is_expired(&self, now: UnixTimeMs, retention_ms: u64) -> bool {
        now.elapsed_since(self.captured_at) > retention_ms
    }
}

impl Validate for AttributionRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.utm.validate()?;
        for (field, value) in [
            ("attribution_record.referrer", self.referrer.as_deref()),
            ("attribution_record.landing_page", self.landing_page.as_deref()),
            ("attribution_record.button_location", self.button_location.as_deref()),
        ] {
            if let Some(v) = value {
                if v.len() > ATTRIBUTION_TEXT_MAX_LEN {
                    return Err(ContractViolation::InvalidRange {
                        field,
                        min: 0,
                        max: ATTRIBUTION_TEXT_MAX_LEN as u64,
                        got: v.len() as u64,
                    });
                }
            }
        }
        if let Some(fp) = &self.fingerprint {
            fp.validate()?;
        }
        if let Some(uid) = &self.user_id {
            uid.validate()?;
        }
        if let Some(code) = &self.referral_code {
            ReferralCode::parse(code.as_str())?;
        }
        Ok(())
    }
}

/// Written when the user activates an install call-to-action; consumed by the next context
/// to corroborate an ambiguous fingerprint match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallIntentRecord {
    pub created_at: UnixTimeMs,
    pub button_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_path: Option<String>,
}

impl InstallIntentRecord {
    pub fn age_ms(&self, now: UnixTimeMs) -> u64 {
        now.elapsed_since(self.created_at)
    }

    pub fn is_recent(&self, now: UnixTimeMs, window_ms: u64) -> bool {
        self.created_at <= now && self.age_ms(now) < window_ms
    }
}

impl Validate for InstallIntentRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        crate::common::ensure_bounded_text(
            "install_intent_record.button_location",
            &self.button_location,
            256,
        )
    }
}

/// Friend-referral code carried in the `ref` query parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReferralCode(String);

impl ReferralCode {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let raw = raw.into();
        if !(4..=20).contains(&raw.len()) {
            return Err(ContractViolation::InvalidRange {
                field: "referral_code",
                min: 4,
                max: 20,
                got: raw.len() as u64,
            });
        }
        if !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ContractViolation::InvalidValue {
                field: "referral_code",
                reason: "must be ascii alphanumeric",
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ReferralCode {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ReferralCode> for String {
    fn from(value: ReferralCode) -> Self {
        value.0
    }
}
