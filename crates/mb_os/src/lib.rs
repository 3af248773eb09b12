#![forbid(unsafe_code)]

pub mod background;
pub mod channel;
pub mod context;
pub mod install_date;
pub mod reconciler;

pub use background::{BackgroundContext, InstallDetails, InstallReason};
pub use channel::{
    request_with_timeout, ChannelError, Envelope, InProcessChannel, MessageChannel,
    UnavailableChannel,
};
pub use context::{ContextClient, ContextStartup, PageContext};
pub use install_date::{
    format_install_date, parse_install_date, resolve_install_date, InstallDateSource,
    ResolvedInstallDate,
};
pub use reconciler::{
    AttributionReconciler, Corroboration, LocalEvidence, Recovered, RecoverySources, SourceKind,
};
