#![forbid(unsafe_code)]

//! Persisted key names. Identifiers are stored as bare strings; every other value is
//! written inside a timestamped envelope so readers can apply expiry.

pub const USER_ID: &str = "mb_user_id";
pub const DEVICE_ID: &str = "mb_amplitude_device_id";
pub const LANDING_ATTRIBUTION: &str = "mb_landing_attribution";
pub const PRE_INSTALL_ATTRIBUTION: &str = "mb_pre_install_attribution";
pub const INSTALL_INTENT: &str = "mb_install_intent";
pub const REFERRAL_CODE: &str = "mb_referral";
/// Extension-side copy of attribution received from a page context.
pub const WEBSITE_ATTRIBUTION: &str = "websiteAttribution";
/// Extension-side merged user-property map.
pub const USER_PROPERTIES: &str = "mb_user_properties";
pub const INSTALL_DATE: &str = "mb_install_date";
