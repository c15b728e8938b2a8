pub mod config;
pub mod error;
pub mod fields;
pub mod filter;
pub mod record;
pub mod request;

pub use config::LogSearchConfig;
pub use error::{SearchError, ValidationError};
pub use fields::{FieldPolicy, Operator};
pub use filter::{FilterGroup, FilterNode, FilterRule, FilterValue, Scalar};
pub use record::LogRecord;
pub use request::{Mode, ModeKind, SearchParams, SearchRequest};
