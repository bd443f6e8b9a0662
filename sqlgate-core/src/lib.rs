pub mod environment;
pub mod metadata;
pub mod promotion;
pub mod sql;

pub use environment::{Environment, UnknownEnvironment};
pub use metadata::{parse_metadata, ScriptMetadata, METADATA_WINDOW_LINES};
pub use promotion::{PromotionFlags, PromotionRefusal, PromotionState};
pub use sql::{classify, is_read_query, strip_comments, StatementKind};
