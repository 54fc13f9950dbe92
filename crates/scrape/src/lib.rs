pub mod agents;
pub mod breaker;
pub mod browser;
pub mod extract;
pub mod feed;
pub mod http;
pub mod limiter;
pub mod orchestrator;
pub mod robots;
pub mod scheduler;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use browser::{BrowserPool, SessionFactory, SessionGuard, SessionPool};
pub use extract::HtmlExtractor;
pub use feed::FeedParser;
pub use http::FetchClient;
pub use limiter::HostRateLimiter;
pub use orchestrator::{
    default_feed_url, FeedFetch, FeedSource, ScrapeOrchestrator, ScrapeReport, ScrapeRunner,
};
pub use robots::RobotsCache;
pub use scheduler::ScrapeScheduler;
