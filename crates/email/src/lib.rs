pub mod convert;
pub mod ingest;

pub use convert::{parse_message, ParsedEmail};
pub use ingest::EmailIngester;
