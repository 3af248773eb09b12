#![forbid(unsafe_code)]

pub mod analytics;
pub mod fingerprint;
pub mod identifier;
pub mod policy;
pub mod recorder;
pub mod transport;

pub use analytics::{AnalyticsClient, AnalyticsConfig, DeliveryError, DeliveryMode, EventSink};
pub use fingerprint::{EnvironmentReadError, EnvironmentSource, FingerprintGenerator, StaticEnvironment};
pub use identifier::{IdentifierOrigin, IdentifierResolution, IdentifierStore};
pub use policy::AttributionPolicy;
pub use recorder::{classify_traffic, AttributionRecorder, PageVisit, RecordOutcome};
pub use transport::{AttributionTransport, InstallClick, TransportDecodeError, UrlHandoff};

use std::time::{SystemTime, UNIX_EPOCH};

use mb_kernel_contracts::UnixTimeMs;

/// Current wall-clock time; a clock before the epoch reads as zero.
pub fn now_unix_ms() -> UnixTimeMs {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    UnixTimeMs(u64::try_from(ms).unwrap_or(u64::MAX))
}
