#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, UnixTimeMs, Validate};

pub const FINGERPRINT_PREFIX: &str = "fp_";
pub const FINGERPRINT_FALLBACK_TAG: &str = "fallback";
pub const FINGERPRINT_MAX_LEN: usize = 64;

pub const DEFAULT_HARDWARE_CONCURRENCY: u32 = 4;
pub const DEFAULT_DO_NOT_TRACK: &str = "unspecified";
pub const DEFAULT_MAX_TOUCH_POINTS: u32 = 0;
pub const DEFAULT_VENDOR_SUB: &str = "";
pub const DEFAULT_PRODUCT_SUB: &str = "20030107";
pub const DEFAULT_WEBDRIVER: bool = false;

/// Canonical attribute keys, in the exact order they are serialized before hashing.
///
/// Every context that mints a fingerprint must walk this list; adding, dropping or
/// reordering a key silently breaks cross-context matching.
pub const FINGERPRINT_ATTRIBUTE_ORDER: [&str; 12] = [
    "cookieEnabled",
    "doNotTrack",
    "hardwareConcurrency",
    "language",
    "languages",
    "maxTouchPoints",
    "platform",
    "productSub",
    "timezone",
    "vendor",
    "vendorSub",
    "webdriver",
];

/// Raw environment attributes as reported by the host. `None` means the host did not
/// expose the capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentAttributes {
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub platform: Option<String>,
    pub languages: Option<Vec<String>>,
    pub hardware_concurrency: Option<u32>,
    pub cookie_enabled: Option<bool>,
    pub do_not_track: Option<String>,
    pub max_touch_points: Option<u32>,
    pub vendor: Option<String>,
    pub vendor_sub: Option<String>,
    pub product_sub: Option<String>,
    pub webdriver: Option<bool>,
}

impl EnvironmentAttributes {
    pub fn effective_hardware_concurrency(&self) -> u32 {
        match self.hardware_concurrency {
            Some(0) | None => DEFAULT_HARDWARE_CONCURRENCY,
            Some(n) => n,
        }
    }

    /// `languages` joined with commas, falling back to the single `language`.
    pub fn effective_languages(&self) -> Option<String> {
        match &self.languages {
            Some(list) => Some(list.join(",")),
            None => self.language.clone(),
        }
    }

    pub fn effective_do_not_track(&self) -> &str {
        non_empty_or(self.do_not_track.as_deref(), DEFAULT_DO_NOT_TRACK)
    }

    pub fn effective_max_touch_points(&self) -> u32 {
        self.max_touch_points.unwrap_or(DEFAULT_MAX_TOUCH_POINTS)
    }

    pub fn effective_vendor_sub(&self) -> &str {
        non_empty_or(self.vendor_sub.as_deref(), DEFAULT_VENDOR_SUB)
    }

    pub fn effective_product_sub(&self) -> &str {
        non_empty_or(self.product_sub.as_deref(), DEFAULT_PRODUCT_SUB)
    }

    pub fn effective_webdriver(&self) -> bool {
        self.webdriver.unwrap_or(DEFAULT_WEBDRIVER)
    }
}

fn non_empty_or<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => default,
    }
}

/// `fp_<hash1>_<hash2>`: a non-cryptographic grouping key for one browser profile.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceFingerprint(String);

impl DeviceFingerprint {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let raw = raw.into();
        let fp = Self(raw);
        fp.validate()?;
        Ok(fp)
    }

    /// `fp_<base36(|h1|)>_<base36(|h2|)>` from the two 32-bit rolling hashes.
    pub fn from_hashes(h1: i32, h2: i32) -> Self {
        Self(format!(
            "{FINGERPRINT_PREFIX}{}_{}",
            to_base36(u64::from(h1.unsigned_abs())),
            to_base36(u64::from(h2.unsigned_abs()))
        ))
    }

    /// Clearly marked time-derived identifier used when the environment cannot be read.
    pub fn fallback_at(now: UnixTimeMs) -> Self {
        Self(format!(
            "{FINGERPRINT_PREFIX}{FINGERPRINT_FALLBACK_TAG}_{}",
            to_base36(now.0)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fallback(&self) -> bool {
        self.0
            .strip_prefix(FINGERPRINT_PREFIX)
            .is_some_and(|rest| rest.starts_with(FINGERPRINT_FALLBACK_TAG))
    }

    /// Characters 3..11 of the fingerprint, embedded in user identifiers to aid matching.
    pub fn fragment(&self) -> &str {
        let end = self.0.len().min(11);
        &self.0[FINGERPRINT_PREFIX.len()..end]
    }
}

/// Lower-case base-36 rendering, as `Number.prototype.toString(36)` prints integers.
pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

pub fn is_valid_fingerprint(raw: &str) -> bool {
    let Some(rest) = raw.strip_prefix(FINGERPRINT_PREFIX) else {
        return false;
    };
    let mut parts = rest.split('_');
    let (Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    is_lower_alnum(a) && is_lower_alnum(b)
}

fn is_lower_alnum(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

impl Validate for DeviceFingerprint {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() > FINGERPRINT_MAX_LEN {
            return Err(ContractViolation::InvalidRange {
                field: "device_fingerprint",
                min: 6,
                max: FINGERPRINT_MAX_LEN as u64,
                got: self.0.len() as u64,
            });
        }
        if !is_valid_fingerprint(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "device_fingerprint",
                reason: "must match fp_<alnum>_<alnum>",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for DeviceFingerprint {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<DeviceFingerprint> for String {
    fn from(value: DeviceFingerprint) -> Self {
        value.0
    }
}

impl std::fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
