#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::attribution::AttributionRecord;
use crate::fingerprint::DeviceFingerprint;
use crate::identity::UserIdentifier;
use crate::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const TRANSPORT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const ATTRIBUTION_COOKIE_NAME: &str = "mb_attr";
pub const REFERRAL_COOKIE_NAME: &str = "mb_referral";
pub const ATTRIBUTION_COOKIE_MAX_AGE_SECS: u64 = 2_592_000;
/// Browsers reject cookies whose name=value exceeds this many bytes.
pub const COOKIE_MAX_BYTES: usize = 4096;

/// Query parameter names used for URL hand-off between contexts.
pub mod query_params {
    pub const USER_ID: &str = "uid";
    pub const DEVICE_ID: &str = "did";
    pub const FINGERPRINT: &str = "fp";
    pub const EXTENSION_ID: &str = "ext_id";
    pub const VERSION: &str = "v";
    pub const REFERRAL: &str = "ref";
    pub const FROM_EXTENSION: &str = "ext";
    pub const INSTALL_DATE: &str = "install_date";
    pub const REFERRER: &str = "referrer";
    pub const LANDING_PAGE: &str = "landing_page";
    pub const CAPTURED_AT: &str = "captured_at";
    pub const BUTTON_LOCATION: &str = "button_location";
    pub const TRAFFIC_SOURCE: &str = "traffic_source";
    pub const TRAFFIC_CHANNEL: &str = "traffic_channel";
}

/// Everything one context knows about the user at the moment it hands off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportPayload {
    pub schema_version: SchemaVersion,
    pub user_id: UserIdentifier,
    pub device_id: DeviceFingerprint,
    pub attribution: AttributionRecord,
    pub snapshot_at: UnixTimeMs,
}

impl TransportPayload {
    pub fn v1(
        user_id: UserIdentifier,
        device_id: DeviceFingerprint,
        attribution: AttributionRecord,
        snapshot_at: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let payload = Self {
            schema_version: TRANSPORT_CONTRACT_VERSION,
            user_id,
            device_id,
            attribution,
            snapshot_at,
        };
        payload.validate()?;
        Ok(payload)
    }
}

impl Validate for TransportPayload {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != TRANSPORT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "transport_payload.schema_version",
                reason: "must match TRANSPORT_CONTRACT_VERSION",
            });
        }
        self.user_id.validate()?;
        self.device_id.validate()?;
        self.attribution.validate()?;
        if self.attribution.user_id.as_ref().is_some_and(|u| u != &self.user_id) {
            return Err(ContractViolation::InvalidValue {
                field: "transport_payload.attribution.user_id",
                reason: "must match transport_payload.user_id",
            });
        }
        Ok(())
    }
}

/// Reduced payload that fits in the cross-subdomain `mb_attr` cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookiePayload {
    pub uid: UserIdentifier,
    pub did: DeviceFingerprint,
    /// Only the UTM source survives the size cut.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm: Option<String>,
}

/// How a context recovered attribution data, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    UrlParametersComplete,
    #[serde(rename = "localStorage_pre_install")]
    LocalStoragePreInstall,
    #[serde(rename = "localStorage_landing")]
    LocalStorageLanding,
    Cookie,
    ExtensionMessage,
}

impl RecoveryMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UrlParametersComplete => "url_parameters_complete",
            Self::LocalStoragePreInstall => "localStorage_pre_install",
            Self::LocalStorageLanding => "localStorage_landing",
            Self::Cookie => "cookie",
            Self::ExtensionMessage => "extension_message",
        }
    }
}

/// Attribution handed to the background context once another context recovered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedAttribution {
    #[serde(flatten)]
    pub record: AttributionRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_method: Option<RecoveryMethod>,
    pub recovered_at: UnixTimeMs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentifierSource;

    fn ids() -> (UserIdentifier, DeviceFingerprint) {
        let fp = DeviceFingerprint::parse("fp_abc_def").unwrap();
        let uid = UserIdentifier::mint(IdentifierSource::Web, UnixTimeMs(1), Some(&fp), "r4nd0m");
        (uid, fp)
    }

    #[test]
    fn at_transport_contract_01_payload_rejects_mismatched_record_owner() {
        let (uid, fp) = ids();
        let other = UserIdentifier::parse("user_web_2_x_y").unwrap();
        let record = AttributionRecord {
            user_id: Some(other),
            ..AttributionRecord::default()
        };
        assert!(TransportPayload::v1(uid.clone(), fp.clone(), record, UnixTimeMs(3)).is_err());
        assert!(TransportPayload::v1(uid, fp, AttributionRecord::default(), UnixTimeMs(3)).is_ok());
    }

    #[test]
    fn at_transport_contract_02_recovery_method_labels_match_serde() {
        for method in [
            RecoveryMethod::UrlParametersComplete,
            RecoveryMethod::LocalStoragePreInstall,
            RecoveryMethod::LocalStorageLanding,
            RecoveryMethod::Cookie,
            RecoveryMethod::ExtensionMessage,
        ] {
            let json = serde_json::to_string(&method).unwrap();
            assert_eq!(json, format!("\"{}\"", method.as_str()));
        }
    }

    #[test]
    fn at_transport_contract_03_cookie_payload_omits_missing_utm() {
        let (uid, fp) = ids();
        let json = serde_json::to_string(&CookiePayload {
            uid,
            did: fp,
            utm: None,
        })
        .unwrap();
        assert!(!json.contains("utm"));
    }

    #[test]
    fn at_transport_contract_04_forwarded_attribution_is_flat_on_the_wire() {
        let forwarded = ForwardedAttribution {
            record: AttributionRecord {
                referrer: Some("https://www.reddit.com/".to_string()),
                captured_at: UnixTimeMs(10),
                ..AttributionRecord::default()
            },
            recovery_method: Some(RecoveryMethod::Cookie),
            recovered_at: UnixTimeMs(20),
        };
        let value = serde_json::to_value(&forwarded).unwrap();
        assert_eq!(value["referrer"], "https://www.reddit.com/");
        assert_eq!(value["recovery_method"], "cookie");
        assert_eq!(value["recovered_at"], 20);
        let back: ForwardedAttribution = serde_json::from_value(value).unwrap();
        assert_eq!(back, forwarded);
    }
}
