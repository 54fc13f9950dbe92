pub mod error;
pub mod memory;
pub mod postgres;
pub mod repo;
pub mod views;

pub use error::StoreError;
pub use memory::MemoryArticleStore;
pub use postgres::PgArticleStore;
pub use repo::{
    ArticleStore, ContentCandidate, EmailRecord, EmailStore, JobStore, SentimentBucket,
    TrendingKeyword,
};
pub use views::ViewRefresher;
