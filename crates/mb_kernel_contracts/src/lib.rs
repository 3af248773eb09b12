#![forbid(unsafe_code)]

pub mod analytics;
pub mod attribution;
pub mod common;
pub mod fingerprint;
pub mod identity;
pub mod message;
pub mod storage_keys;
pub mod transport;

pub use common::{ContractViolation, ExecutionContextKind, SchemaVersion, UnixTimeMs, Validate};
