pub mod article;
pub mod clock;
pub mod config;
pub mod error;
pub mod sanitize;

pub use article::{
    Article, ArticleDraft, Email, Enrichment, EntitySet, JobStatus, KeywordScore, ScrapingJob,
    Sentiment, SentimentLabel, StockQuote,
};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use error::Error;
