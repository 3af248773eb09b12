#![forbid(unsafe_code)]

use mb_kernel_contracts::fingerprint::{
    DeviceFingerprint, EnvironmentAttributes, FINGERPRINT_ATTRIBUTE_ORDER,
};
use mb_kernel_contracts::UnixTimeMs;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvironmentReadError {
    #[error("environment capability unavailable: {0}")]
    Unavailable(&'static str),
    #[error("environment probe failed: {0}")]
    Probe(String),
}

/// Where a context reads its environment attributes from.
pub trait EnvironmentSource {
    fn read_attributes(&self) -> Result<EnvironmentAttributes, EnvironmentReadError>;
}

/// Attributes captured ahead of time, e.g. reported by the page alongside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticEnvironment(pub EnvironmentAttributes);

impl EnvironmentSource for StaticEnvironment {
    fn read_attributes(&self) -> Result<EnvironmentAttributes, EnvironmentReadError> {
        Ok(self.0.clone())
    }
}

impl<E: EnvironmentSource + ?Sized> EnvironmentSource for &E {
    fn read_attributes(&self) -> Result<EnvironmentAttributes, EnvironmentReadError> {
        (**self).read_attributes()
    }
}

pub struct FingerprintGenerator;

impl FingerprintGenerator {
    /// Derives the device fingerprint for the current environment. Never fails: an
    /// unreadable environment yields `fp_fallback_<base36(now)>`.
    pub fn generate<E>(source: &E, now: UnixTimeMs) -> DeviceFingerprint
    where
        E: EnvironmentSource + ?Sized,
    {
        match source.read_attributes() {
            Ok(attrs) => {
                let fp = Self::from_attributes(&attrs);
                debug!(fingerprint = %fp, "fingerprint derived");
                fp
            }
            Err(err) => {
                let fp = DeviceFingerprint::fallback_at(now);
                warn!(error = %err, fingerprint = %fp, "environment unreadable, using fallback fingerprint");
                fp
            }
        }
    }

    pub fn from_attributes(attrs: &EnvironmentAttributes) -> DeviceFingerprint {
        let (h1, h2) = dual_hash(&canonical_attribute_string(attrs));
        DeviceFingerprint::from_hashes(h1, h2)
    }
}

/// JSON object of the canonical attributes, keys in `FINGERPRINT_ATTRIBUTE_ORDER`, no
/// whitespace. Attributes the host does not expose and that have no default are omitted.
pub fn canonical_attribute_string(attrs: &EnvironmentAttributes) -> String {
    let mut out = String::from("{");
    for key in FINGERPRINT_ATTRIBUTE_ORDER {
        let Some(value) = attribute_value(attrs, key) else {
            continue;
        };
        if out.len() > 1 {
            out.push(',');
        }
        out.push_str(&Value::String(key.to_string()).to_string());
        out.push(':');
        out.push_str(&value.to_string());
    }
    out.push('}');
    out
}

fn attribute_value(attrs: &EnvironmentAttributes, key: &str) -> Option<Value> {
    let text = |v: &str| Value::String(v.to_string());
    match key {
        "cookieEnabled" => attrs.cookie_enabled.map(Value::Bool),
        "doNotTrack" => Some(text(attrs.effective_do_not_track())),
        "hardwareConcurrency" => Some(Value::from(attrs.effective_hardware_concurrency())),
        "language" => attrs.language.as_deref().map(text),
        "languages" => attrs.effective_languages().map(Value::String),
        "maxTouchPoints" => Some(Value::from(attrs.effective_max_touch_points())),
        "platform" => attrs.platform.as_deref().map(text),
        "productSub" => Some(text(attrs.effective_product_sub())),
        "timezone" => attrs.timezone.as_deref().map(text),
        "vendor" => attrs.vendor.as_deref().map(text),
        "vendorSub" => Some(text(attrs.effective_vendor_sub())),
        "webdriver" => Some(Value::Bool(attrs.effective_webdriver())),
        _ => None,
    }
}

/// Two 32-bit rolling hashes over UTF-16 code units with wrapping arithmetic:
/// `h = h*31 + c` seeded with 0 and `h = h*33 + c` seeded with 5381.
pub fn dual_hash(input: &str) -> (i32, i32) {
    let mut h1: i32 = 0;
    let mut h2: i32 = 5381;
    for unit in input.encode_utf16() {
        let c = i32::from(unit);
        h1 = h1.wrapping_shl(5).wrapping_sub(h1).wrapping_add(c);
        h2 = h2.wrapping_shl(5).wrapping_add(h2).wrapping_add(c);
    }
    (h1, h2)
}
