#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub u32);

/// Wall-clock milliseconds since the Unix epoch, as every context reports `Date.now()`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub const fn saturating_sub_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }

    pub const fn saturating_add_ms(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    /// Milliseconds elapsed from `earlier` to `self`; zero if `earlier` is in the future.
    pub const fn elapsed_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field} must be within {min}..={max}, got {got}")]
    InvalidRange {
        field: &'static str,
        min: u64,
        max: u64,
        got: u64,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

/// The isolated script environments that take part in the attribution chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContextKind {
    Website,
    Welcome,
    Extension,
    Feedback,
}

impl ExecutionContextKind {
    pub const fn platform_name(self) -> &'static str {
        match self {
            Self::Website => "website",
            Self::Welcome => "welcome",
            Self::Extension => "extension",
            Self::Feedback => "feedback",
        }
    }

    pub const fn all() -> &'static [Self] {
        &[Self::Website, Self::Welcome, Self::Extension, Self::Feedback]
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "website" | "web" => Some(Self::Website),
            "welcome" => Some(Self::Welcome),
            "extension" | "ext" => Some(Self::Extension),
            "feedback" => Some(Self::Feedback),
            _ => None,
        }
    }

    /// Page contexts can fall back to a cookie and a same-origin page store.
    pub const fn is_page(self) -> bool {
        !matches!(self, Self::Extension)
    }
}

pub(crate) fn ensure_bounded_text(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidRange {
            field,
            min: 1,
            max: max_len as u64,
            got: value.len() as u64,
        });
    }
    Ok(())
}
