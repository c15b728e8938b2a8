pub mod elasticsearch;
pub mod index;
pub mod memory;
pub mod query;

pub use elasticsearch::ElasticsearchIndex;
pub use index::{Bucket, LogIndex, ScrollBatch, ScrollCursor, SearchPage, StoreError};
pub use memory::MemoryIndex;
pub use query::{SearchQuery, translate};
