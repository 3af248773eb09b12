#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::fingerprint::DeviceFingerprint;
use crate::{ContractViolation, ExecutionContextKind, UnixTimeMs, Validate};

pub const USER_ID_PREFIX: &str = "user_";
pub const USER_ID_MAX_LEN: usize = 128;

/// Which execution context minted a user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierSource {
    Web,
    Ext,
    Welcome,
    Feedback,
}

impl IdentifierSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Ext => "ext",
            Self::Welcome => "welcome",
            Self::Feedback => "feedback",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "web" => Some(Self::Web),
            "ext" => Some(Self::Ext),
            "welcome" => Some(Self::Welcome),
            "feedback" => Some(Self::Feedback),
            _ => None,
        }
    }

    pub const fn for_context(kind: ExecutionContextKind) -> Self {
        match kind {
            ExecutionContextKind::Website => Self::Web,
            ExecutionContextKind::Welcome => Self::Welcome,
            ExecutionContextKind::Extension => Self::Ext,
            ExecutionContextKind::Feedback => Self::Feedback,
        }
    }
}

/// `user_<source>_<timestamp>_<fingerprintFragment>_<random>`.
///
/// Identifiers minted elsewhere are accepted as long as they keep the `user_` prefix and
/// at least five underscore-separated parts; the fragment itself may contain underscores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserIdentifier(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUserIdentifier<'a> {
    pub source: &'a str,
    pub minted_at: Option<UnixTimeMs>,
    pub fingerprint_fragment: &'a str,
    pub random: &'a str,
}

impl UserIdentifier {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(raw.into());
        id.validate()?;
        Ok(id)
    }

    /// Mints a new identifier. `random` is reduced to at most 32 ascii alphanumerics so the
    /// result is always well-formed.
    pub fn mint(
        source: IdentifierSource,
        now: UnixTimeMs,
        fingerprint: Option<&DeviceFingerprint>,
        random: &str,
    ) -> Self {
        let mut random: String = random
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(32)
            .collect();
        if random.is_empty() {
            random.push('0');
        }
        let fragment = match fingerprint {
            Some(fp) => fp.fragment().to_string(),
            None => random.chars().take(8).collect(),
        };
        Self(format!(
            "{USER_ID_PREFIX}{}_{}_{}_{}",
            source.as_str(),
            now.0,
            fragment,
            random
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> ParsedUserIdentifier<'_> {
        // Validated on construction: prefix present and at least five parts.
        let rest = &self.0[USER_ID_PREFIX.len()..];
        let (source, rest) = rest.split_once('_').unwrap_or((rest, ""));
        let (timestamp, rest) = rest.split_once('_').unwrap_or((rest, ""));
        let (fingerprint_fragment, random) = rest.rsplit_once('_').unwrap_or((rest, ""));
        ParsedUserIdentifier {
            source,
            minted_at: timestamp.parse::<u64>().ok().map(UnixTimeMs),
            fingerprint_fragment,
            random,
        }
    }

    pub fn source(&self) -> Option<IdentifierSource> {
        IdentifierSource::parse(self.components().source)
    }

    pub fn is_website_identifier(&self) -> bool {
        self.source() == Some(IdentifierSource::Web)
    }
}

impl Validate for UserIdentifier {
    fn validate(&self) -> Result<(), ContractViolation> {
        crate::common::ensure_bounded_text("user_identifier", &self.0, USER_ID_MAX_LEN)?;
        if !self.0.starts_with(USER_ID_PREFIX) {
            return Err(ContractViolation::InvalidValue {
                field: "user_identifier",
                reason: "must start with user_",
            });
        }
        if self.0.split('_').count() < 5 || self.0.split('_').any(str::is_empty) {
            return Err(ContractViolation::InvalidValue {
                field: "user_identifier",
                reason: "must have at least five non-empty underscore-separated parts",
            });
        }
        if self.0.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ContractViolation::InvalidValue {
                field: "user_identifier",
                reason: "must not contain whitespace",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for UserIdentifier {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UserIdentifier> for String {
    fn from(value: UserIdentifier) -> Self {
        value.0
    }
}

impl std::fmt::Display for UserIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity a context settles on during startup; analytics can only be built from one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub user_id: UserIdentifier,
    pub device_id: DeviceFingerprint,
    /// Fingerprint computed in this context; differs from `device_id` when a stored or
    /// recovered device id was adopted.
    pub local_fingerprint: DeviceFingerprint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_uid_contract_01_mint_embeds_source_time_and_fragment() {
        let fp = DeviceFingerprint::parse("fp_k2j4h5g6f7_a1").unwrap();
        let id = UserIdentifier::mint(
            IdentifierSource::Web,
            UnixTimeMs(1_712_000_000_000),
            Some(&fp),
            "q8w7e6r5t",
        );
        assert_eq!(id.as_str(), "user_web_1712000000000_k2j4h5g6_q8w7e6r5t");
        let parts = id.components();
        assert_eq!(parts.source, "web");
        assert_eq!(parts.minted_at, Some(UnixTimeMs(1_712_000_000_000)));
        assert_eq!(parts.fingerprint_fragment, "k2j4h5g6");
        assert_eq!(parts.random, "q8w7e6r5t");
        assert!(id.is_website_identifier());
    }

    #[test]
    fn at_uid_contract_02_fragment_with_underscore_still_parses() {
        let fp = DeviceFingerprint::parse("fp_abc_def").unwrap();
        let id = UserIdentifier::mint(
            IdentifierSource::Ext,
            UnixTimeMs(1_700_000_000_123),
            Some(&fp),
            "zzz111",
        );
        let parts = id.components();
        assert_eq!(parts.fingerprint_fragment, "abc_def");
        assert_eq!(parts.random, "zzz111");
        assert_eq!(id.source(), Some(IdentifierSource::Ext));
    }

    #[test]
    fn at_uid_contract_03_without_fingerprint_uses_random_prefix() {
        let id = UserIdentifier::mint(IdentifierSource::Feedback, UnixTimeMs(5), None, "abcdefghi");
        assert_eq!(id.as_str(), "user_feedback_5_abcdefgh_abcdefghi");
    }

    #[test]
    fn at_uid_contract_04_rejects_malformed_identifiers() {
        for raw in ["", "user_web", "user_web_1_2", "uid_web_1_2_3", "user_web__x_y", "user_web_1 2_x_y"] {
            assert!(UserIdentifier::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn at_uid_contract_06_mint_sanitizes_random_suffix() {
        let empty = UserIdentifier::mint(IdentifierSource::Web, UnixTimeMs(1), None, "");
        assert_eq!(empty.as_str(), "user_web_1_0_0");
        assert!(empty.validate().is_ok());
        let noisy = UserIdentifier::mint(IdentifierSource::Web, UnixTimeMs(1), None, "a_b c-d");
        assert_eq!(noisy.components().random, "abcd");
        assert!(noisy.validate().is_ok());
    }

    #[test]
    fn at_uid_contract_05_non_numeric_timestamp_has_no_mint_time() {
        let id = UserIdentifier::parse("user_web_notatime_frag_rand").unwrap();
        assert_eq!(id.components().minted_at, None);
    }
}
