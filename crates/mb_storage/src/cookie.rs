#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use mb_kernel_contracts::transport::COOKIE_MAX_BYTES;
use mb_kernel_contracts::UnixTimeMs;

use crate::backend::{StorageError, StorageMedium};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

impl SameSite {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lax => "Lax",
            Self::Strict => "Strict",
            Self::None => "None",
        }
    }
}

/// A cookie write as a page script would issue it through `document.cookie`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    /// `Some(".example.com")` shares the cookie with every subdomain; `None` is host-only.
    pub domain: Option<String>,
    pub path: String,
    pub max_age_secs: Option<u64>,
    pub same_site: Option<SameSite>,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: "/".to_string(),
            max_age_secs: None,
            same_site: None,
        }
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn max_age_secs(mut self, secs: u64) -> Self {
        self.max_age_secs = Some(secs);
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// The `document.cookie` assignment string.
    pub fn to_cookie_string(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(max_age) = self.max_age_secs {
            out.push_str(&format!("; max-age={max_age}"));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; domain={domain}"));
        }
        out.push_str(&format!("; path={}", self.path));
        if let Some(same_site) = self.same_site {
            out.push_str(&format!("; SameSite={}", same_site.as_str()));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredCookie {
    name: String,
    value: String,
    /// Lower-cased domain without a leading dot.
    domain: String,
    host_only: bool,
    path: String,
    expires_at: Option<UnixTimeMs>,
}

impl StoredCookie {
    fn is_live(&self, now: UnixTimeMs) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }

    fn visible_to(&self, host: &str) -> bool {
        if self.host_only {
            host == self.domain
        } else {
            domain_matches(host, &self.domain)
        }
    }
}

#[derive(Debug, Default)]
struct CookieJarState {
    cookies: Vec<StoredCookie>,
    blocked: bool,
}

/// Cookie store shared by every page of a browser profile.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    state: Arc<Mutex<CookieJarState>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates third-party or user-level cookie blocking.
    pub fn set_blocked(&self, blocked: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.blocked = blocked;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CookieJarState>, StorageError> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned {
            medium: StorageMedium::Cookie,
        })?;
        if state.blocked {
            return Err(StorageError::Disabled {
                medium: StorageMedium::Cookie,
            });
        }
        Ok(state)
    }

    /// Stores `cookie` as if written by a page on `setter_host`.
    pub fn set(&self, setter_host: &str, cookie: SetCookie, now: UnixTimeMs) -> Result<(), StorageError> {
        let host = setter_host.trim().to_ascii_lowercase();
        if cookie.name.is_empty() || cookie.name.contains(['=', ';', ' ']) {
            return Err(StorageError::CookieRejected {
                name: cookie.name,
                reason: "invalid cookie name",
            });
        }
        if cookie.value.contains([';', ' ']) {
            return Err(StorageError::CookieRejected {
                name: cookie.name,
                reason: "cookie value must not contain ';' or spaces",
            });
        }
        let size = cookie.name.len() + 1 + cookie.value.len();
        if size > COOKIE_MAX_BYTES {
            return Err(StorageError::QuotaExceeded {
                medium: StorageMedium::Cookie,
                key: cookie.name,
                needed: size,
                limit: COOKIE_MAX_BYTES,
            });
        }
        let (domain, host_only) = match &cookie.domain {
            Some(d) => {
                let d = d.trim().trim_start_matches('.').to_ascii_lowercase();
                if !domain_matches(&host, &d) {
                    return Err(StorageError::CookieRejected {
                        name: cookie.name,
                        reason: "domain attribute does not cover the setting host",
                    });
                }
                (d, false)
            }
            None => (host.clone(), true),
        };
        let expires_at = cookie
            .max_age_secs
            .map(|secs| now.saturating_add_ms(secs.saturating_mul(1_000)));

        let mut state = self.lock()?;
        state
            .cookies
            .retain(|c| !(c.name == cookie.name && c.domain == domain && c.path == cookie.path));
        if cookie.max_age_secs == Some(0) {
            return Ok(());
        }
        state.cookies.push(StoredCookie {
            name: cookie.name,
            value: cookie.value,
            domain,
            host_only,
            path: cookie.path,
            expires_at,
        });
        Ok(())
    }

    pub fn get(&self, host: &str, name: &str, now: UnixTimeMs) -> Result<Option<String>, StorageError> {
        let host = host.trim().to_ascii_lowercase();
        let state = self.lock()?;
        Ok(state
            .cookies
            .iter()
            .filter(|c| c.name == name && c.is_live(now) && c.visible_to(&host))
            .max_by_key(|c| c.domain.len())
            .map(|c| c.value.clone()))
    }

    /// What `document.cookie` returns on `host`: `a=1; b=2`.
    pub fn cookie_header(&self, host: &str, now: UnixTimeMs) -> Result<String, StorageError> {
        let host = host.trim().to_ascii_lowercase();
        let state = self.lock()?;
        Ok(state
            .cookies
            .iter()
            .filter(|c| c.is_live(now) && c.visible_to(&host))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; "))
    }
}

/// `host` is `domain` or a subdomain of it.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Finds `name` in a `document.cookie` style header. Values keep any `=` padding.
pub fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|part| {
        let (k, v) = part.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}
