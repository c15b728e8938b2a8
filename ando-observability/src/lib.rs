pub mod redact;

#[cfg(feature = "prometheus")]
pub mod metrics;

pub use redact::{REDACTED, RedactedRecord, redact};
