//! Structured cache keys: `<prefix>:<arg1>-<arg2>...` with a default
//! TTL per namespace.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Article,
    Articles,
    Stats,
    AiTrending,
    AiSentiment,
    AiEntity,
    AiEnrichment,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Article => "article",
            Namespace::Articles => "articles",
            Namespace::Stats => "stats",
            Namespace::AiTrending => "ai:trending",
            Namespace::AiSentiment => "ai:sentiment",
            Namespace::AiEntity => "ai:entity",
            Namespace::AiEnrichment => "ai:enrichment",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        match self {
            Namespace::AiTrending => Duration::from_secs(120),
            Namespace::Article
            | Namespace::Articles
            | Namespace::Stats
            | Namespace::AiSentiment
            | Namespace::AiEntity
            | Namespace::AiEnrichment => Duration::from_secs(300),
        }
    }

    /// Glob matching every key in the namespace.
    pub fn pattern(&self) -> String {
        format!("{}:*", self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    namespace: Namespace,
    args: Vec<String>,
}

impl CacheKey {
    pub fn new(namespace: Namespace, args: &[&str]) -> Self {
        Self {
            namespace,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn enrichment(article_id: i64) -> Self {
        Self::new(Namespace::AiEnrichment, &[&article_id.to_string()])
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.namespace.prefix())
        } else {
            write!(f, "{}:{}", self.namespace.prefix(), self.args.join("-"))
        }
    }
}
