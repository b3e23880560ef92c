pub mod cache;
pub mod comparator;
pub mod crawler;
pub mod engine;
pub mod metadata;
pub mod resolver;
pub mod transfer;

pub use cache::{CacheStats, PathCache};
pub use comparator::{decide, Decision, ItemizedChange, SyncAction};
pub use crawler::{AllowAll, CrawlOptions, CrawlStats, Crawler, PathFilter, PatternFilter, Visitor};
pub use engine::{EntryOutcome, SyncEngine, SyncEvent, SyncReport};
pub use metadata::{AttributeSet, FileKind, FileMetadata, ModifiedTime, NativeAttributes};
pub use resolver::Resolver;
pub use transfer::{CancelFlag, ProgressCallback, TransferHandle, TransferProgress, TransferStatus};
