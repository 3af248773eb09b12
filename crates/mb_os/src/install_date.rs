#![forbid(unsafe_code)]

use chrono::{DateTime, SecondsFormat, Utc};
use mb_engines::policy::DAY_MS;
use mb_kernel_contracts::identity::UserIdentifier;
use mb_kernel_contracts::UnixTimeMs;
use tracing::debug;

/// Mint timestamps at or below this (2020-09-13) are not trusted as install dates.
pub const EARLIEST_PLAUSIBLE_MINT_MS: u64 = 1_600_000_000_000;
pub const ASSUMED_INSTALL_AGE_MS: u64 = 7 * DAY_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallDateSource {
    UrlParameter,
    ExtensionMessage,
    UserIdMintTime,
    Assumed,
}

impl InstallDateSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UrlParameter => "url_parameter",
            Self::ExtensionMessage => "extension_message",
            Self::UserIdMintTime => "user_id_timestamp",
            Self::Assumed => "assumed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInstallDate {
    pub at: UnixTimeMs,
    pub source: InstallDateSource,
}

impl ResolvedInstallDate {
    pub fn days_installed(&self, now: UnixTimeMs) -> u64 {
        now.elapsed_since(self.at) / DAY_MS
    }
}

/// RFC 3339 (`2024-03-01T10:00:00.000Z`), else integer epoch milliseconds.
pub fn parse_install_date(raw: &str) -> Option<UnixTimeMs> {
    let raw = raw.trim();
    let ms = match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => u64::try_from(at.timestamp_millis()).ok()?,
        Err(_) => raw.parse::<u64>().ok()?,
    };
    (ms > 0).then_some(UnixTimeMs(ms))
}

/// Wire form of an install date: UTC, millisecond precision, `Z` suffix.
pub fn format_install_date(at: UnixTimeMs) -> String {
    i64::try_from(at.0)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| at.0.to_string())
}

/// First usable of: the `install_date` query parameter, the date the extension reported,
/// the mint time embedded in the user id, then a week before `now`.
pub fn resolve_install_date(
    url_parameter: Option<&str>,
    extension_reported: Option<UnixTimeMs>,
    user_id: Option<&UserIdentifier>,
    now: UnixTimeMs,
) -> ResolvedInstallDate {
    let from_url = url_parameter.and_then(|raw| match parse_install_date(raw) {
        Some(at) if at.0 <= now.0 => Some(at),
        _ => {
            debug!(raw, "ignoring unusable install_date parameter");
            None
        }
    });
    let resolved = if let Some(at) = from_url {
        ResolvedInstallDate {
            at,
            source: InstallDateSource::UrlParameter,
        }
    } else if let Some(at) = extension_reported.filter(|at| at.0 > 0) {
        ResolvedInstallDate {
            at,
            source: InstallDateSource::ExtensionMessage,
        }
    } else if let Some(at) = user_id
        .and_then(|id| id.components().minted_at)
        .filter(|at| at.0 > EARLIEST_PLAUSIBLE_MINT_MS)
    {
        ResolvedInstallDate {
            at,
            source: InstallDateSource::UserIdMintTime,
        }
    } else {
        ResolvedInstallDate {
            at: now.saturating_sub_ms(ASSUMED_INSTALL_AGE_MS),
            source: InstallDateSource::Assumed,
        }
    };
    debug!(at = resolved.at.0, source = resolved.source.as_str(), "install date resolved");
    resolved
}
