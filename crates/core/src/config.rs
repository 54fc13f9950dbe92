use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_opt(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env_opt(key) {
        Some(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active canned profile name.
    pub profile: Profile,
    pub scraper: ScraperConfig,
    pub scheduler: SchedulerConfig,
    pub content: ContentConfig,
    pub browser: BrowserConfig,
    pub ai: AiConfig,
    pub cache: CacheConfig,
    pub email: EmailConfig,
    pub stock: StockConfig,
    pub postgres: PostgresConfig,
    pub redis: RedisConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// The profile named in `NIEUWS_PROFILE` is applied over the env values.
    pub fn from_env() -> Self {
        let mut config = Self {
            profile: Profile::Balanced,
            scraper: ScraperConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            content: ContentConfig::from_env(),
            browser: BrowserConfig::from_env(),
            ai: AiConfig::from_env(),
            cache: CacheConfig::from_env(),
            email: EmailConfig::from_env(),
            stock: StockConfig::from_env(),
            postgres: PostgresConfig::from_env(),
            redis: RedisConfig::from_env(),
        };
        if let Some(name) = env_opt("NIEUWS_PROFILE") {
            if let Some(profile) = Profile::parse(&name) {
                config.apply_profile(profile);
            } else {
                tracing::warn!("Unknown profile '{}' — keeping balanced", name);
            }
        }
        config
    }

    /// Overlay one of the canned profiles. Only the tunables the profiles
    /// bundle are touched; credentials and endpoints stay as configured.
    pub fn apply_profile(&mut self, profile: Profile) {
        let p = profile.values();
        self.profile = profile;
        self.scraper.rate_limit_seconds = p.rate_limit_seconds;
        self.scraper.max_concurrent = p.max_concurrent;
        self.scraper.retry_attempts = p.retry_attempts;
        self.scheduler.interval_minutes = p.scrape_interval_minutes;
        self.content.batch_size = p.content_batch_size;
        self.browser.fallback_only = p.browser_fallback_only;
        self.ai.batch_size = p.ai_batch_size;
        self.ai.process_interval_secs = p.ai_interval_secs;
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile.as_str());
        tracing::info!(
            "  scraper:   {} sites, rate_limit={}s, max_concurrent={}",
            self.scraper.target_sites.len(),
            self.scraper.rate_limit_seconds,
            self.scraper.max_concurrent
        );
        tracing::info!(
            "  scheduler: enabled={}, interval={}m",
            self.scheduler.enabled,
            self.scheduler.interval_minutes
        );
        tracing::info!(
            "  browser:   pool={}, fallback_only={}",
            self.browser.pool_size,
            self.browser.fallback_only
        );
        tracing::info!(
            "  ai:        enabled={}, model={}, batch={}",
            self.ai.enabled,
            self.ai.model,
            self.ai.batch_size
        );
        tracing::info!("  email:     enabled={}, host={}", self.email.enabled, self.email.host);
        tracing::info!(
            "  postgres:  host={}, db={}, pool={}",
            self.postgres.host,
            self.postgres.database,
            self.postgres.max_connections
        );
        tracing::info!("  redis:     url={}", self.redis.redacted_url());
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile.as_str(),
            "scraper": {
                "target_sites": self.scraper.target_sites,
                "rate_limit_seconds": self.scraper.rate_limit_seconds,
                "max_concurrent": self.scraper.max_concurrent,
                "retry_attempts": self.scraper.retry_attempts,
                "robots_txt_check": self.scraper.enable_robots_txt_check,
            },
            "scheduler": {
                "enabled": self.scheduler.enabled,
                "interval_minutes": self.scheduler.interval_minutes,
            },
            "content": {
                "extraction_enabled": self.content.extraction_enabled,
                "interval_secs": self.content.interval_secs,
                "batch_size": self.content.batch_size,
            },
            "browser": {
                "pool_size": self.browser.pool_size,
                "fallback_only": self.browser.fallback_only,
            },
            "ai": {
                "enabled": self.ai.enabled,
                "model": self.ai.model,
                "batch_size": self.ai.batch_size,
                "configured": self.ai.is_configured(),
            },
            "email": {
                "enabled": self.email.enabled,
                "host": self.email.host,
                "allowed_senders": self.email.allowed_senders.len(),
            },
            "postgres": {
                "host": self.postgres.host,
                "database": self.postgres.database,
                "configured": self.postgres.is_configured(),
            },
        })
    }
}

// ── Canned profiles ───────────────────────────────────────────

/// The four canned tuning profiles, switchable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Fast,
    Balanced,
    Deep,
    Conservative,
}

pub struct ProfileValues {
    pub rate_limit_seconds: u64,
    pub max_concurrent: usize,
    pub retry_attempts: u32,
    pub scrape_interval_minutes: u64,
    pub content_batch_size: usize,
    pub browser_fallback_only: bool,
    pub ai_batch_size: usize,
    pub ai_interval_secs: u64,
}

impl Profile {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "fast" => Some(Profile::Fast),
            "balanced" => Some(Profile::Balanced),
            "deep" => Some(Profile::Deep),
            "conservative" => Some(Profile::Conservative),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Fast => "fast",
            Profile::Balanced => "balanced",
            Profile::Deep => "deep",
            Profile::Conservative => "conservative",
        }
    }

    pub fn all() -> &'static [Profile] {
        &[Profile::Fast, Profile::Balanced, Profile::Deep, Profile::Conservative]
    }

    pub fn values(&self) -> ProfileValues {
        match self {
            Profile::Fast => ProfileValues {
                rate_limit_seconds: 1,
                max_concurrent: 5,
                retry_attempts: 2,
                scrape_interval_minutes: 10,
                content_batch_size: 20,
                browser_fallback_only: true,
                ai_batch_size: 10,
                ai_interval_secs: 120,
            },
            Profile::Balanced => ProfileValues {
                rate_limit_seconds: 2,
                max_concurrent: 3,
                retry_attempts: 3,
                scrape_interval_minutes: 30,
                content_batch_size: 10,
                browser_fallback_only: true,
                ai_batch_size: 10,
                ai_interval_secs: 300,
            },
            Profile::Deep => ProfileValues {
                rate_limit_seconds: 2,
                max_concurrent: 3,
                retry_attempts: 3,
                scrape_interval_minutes: 60,
                content_batch_size: 20,
                browser_fallback_only: false,
                ai_batch_size: 10,
                ai_interval_secs: 300,
            },
            Profile::Conservative => ProfileValues {
                rate_limit_seconds: 5,
                max_concurrent: 2,
                retry_attempts: 2,
                scrape_interval_minutes: 120,
                content_batch_size: 5,
                browser_fallback_only: true,
                ai_batch_size: 5,
                ai_interval_secs: 600,
            },
        }
    }
}

// ── Scraper ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Minimum gap between requests to the same host.
    pub rate_limit_seconds: u64,
    /// Fan-out semaphore for concurrent per-source scrapes.
    pub max_concurrent: usize,
    pub retry_attempts: u32,
    /// Source tags to scrape, e.g. ["nu.nl", "nos.nl"].
    pub target_sites: Vec<String>,
    pub enable_robots_txt_check: bool,
    /// Test hook only — duplicate detection stays on in production.
    pub enable_duplicate_detection: bool,
    pub fetch_timeout_secs: u64,
}

impl ScraperConfig {
    fn from_env() -> Self {
        Self {
            rate_limit_seconds: env_u64("SCRAPER_RATE_LIMIT_SECONDS", 2),
            max_concurrent: env_u32("SCRAPER_MAX_CONCURRENT", 3) as usize,
            retry_attempts: env_u32("SCRAPER_RETRY_ATTEMPTS", 3),
            target_sites: env_list("SCRAPER_TARGET_SITES", &["nu.nl", "ad.nl", "nos.nl"]),
            enable_robots_txt_check: env_bool("SCRAPER_ENABLE_ROBOTS_TXT_CHECK", true),
            enable_duplicate_detection: env_bool("SCRAPER_ENABLE_DUPLICATE_DETECTION", true),
            fetch_timeout_secs: env_u64("SCRAPER_FETCH_TIMEOUT_SECS", 30),
        }
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs(self.rate_limit_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
}

impl SchedulerConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("SCHEDULER_ENABLED", true),
            interval_minutes: env_u64("SCHEDULER_INTERVAL_MINUTES", 30),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

// ── Content extraction ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    pub extraction_enabled: bool,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub max_concurrent: usize,
}

impl ContentConfig {
    fn from_env() -> Self {
        Self {
            extraction_enabled: env_bool("CONTENT_EXTRACTION_ENABLED", true),
            interval_secs: env_u64("CONTENT_INTERVAL_SECS", 600),
            batch_size: env_u32("CONTENT_BATCH_SIZE", 10) as usize,
            max_concurrent: env_u32("CONTENT_MAX_CONCURRENT", 3) as usize,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ── Browser ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub pool_size: usize,
    pub timeout_secs: u64,
    /// Extra wait after page load so client-side scripts can populate
    /// the DOM.
    pub wait_after_load_ms: u64,
    /// When true the browser is only used after plain-HTML extraction
    /// fails.
    pub fallback_only: bool,
    pub max_concurrent: usize,
    /// Sessions are recycled after this many uses.
    pub max_session_uses: u32,
}

impl BrowserConfig {
    fn from_env() -> Self {
        Self {
            pool_size: env_u32("BROWSER_POOL_SIZE", 3) as usize,
            timeout_secs: env_u64("BROWSER_TIMEOUT_SECS", 15),
            wait_after_load_ms: env_u64("BROWSER_WAIT_AFTER_LOAD_MS", 2000),
            fallback_only: env_bool("BROWSER_FALLBACK_ONLY", true),
            max_concurrent: env_u32("BROWSER_MAX_CONCURRENT", 3) as usize,
            max_session_uses: env_u32("BROWSER_MAX_SESSION_USES", 50),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.wait_after_load_ms)
    }
}

// ── AI enrichment ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub batch_size: usize,
    pub process_interval_secs: u64,
    pub worker_count: usize,
    /// Re-admit errored rows to the pending queue.
    pub retry_failed: bool,
    /// Attempt ceiling for errored rows.
    pub max_retries: u32,
    pub enable_sentiment: bool,
    pub enable_entities: bool,
    pub enable_categories: bool,
    pub enable_keywords: bool,
    pub enable_summary: bool,
    /// Estimated spend ceiling per day (USD). Enrichment pauses past it.
    pub max_daily_cost: f64,
    pub rate_limit_per_minute: u32,
    pub timeout_secs: u64,
}

impl AiConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("AI_ENABLED", true),
            api_key: env_opt("AI_API_KEY"),
            base_url: env_or("AI_BASE_URL", "https://api.openai.com"),
            model: env_or("AI_MODEL", "gpt-4o-mini"),
            max_tokens: env_u32("AI_MAX_TOKENS", 1024),
            temperature: env_f64("AI_TEMPERATURE", 0.4) as f32,
            batch_size: env_u32("AI_BATCH_SIZE", 10) as usize,
            process_interval_secs: env_u64("AI_PROCESS_INTERVAL_SECS", 300),
            worker_count: env_u32("AI_WORKER_COUNT", 4) as usize,
            retry_failed: env_bool("AI_RETRY_FAILED", true),
            max_retries: env_u32("AI_MAX_RETRIES", 3),
            enable_sentiment: env_bool("AI_ENABLE_SENTIMENT", true),
            enable_entities: env_bool("AI_ENABLE_ENTITIES", true),
            enable_categories: env_bool("AI_ENABLE_CATEGORIES", true),
            enable_keywords: env_bool("AI_ENABLE_KEYWORDS", true),
            enable_summary: env_bool("AI_ENABLE_SUMMARY", false),
            max_daily_cost: env_f64("AI_MAX_DAILY_COST", 10.0),
            rate_limit_per_minute: env_u32("AI_RATE_LIMIT_PER_MINUTE", 60),
            timeout_secs: env_u64("AI_TIMEOUT_SECS", 30),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_secs(self.process_interval_secs)
    }
}

// ── Cache ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
}

impl CacheConfig {
    fn from_env() -> Self {
        Self {
            default_ttl_secs: env_u64("CACHE_DEFAULT_TTL_SECS", 300),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

// ── Email ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub poll_interval_secs: u64,
    pub allowed_senders: Vec<String>,
}

impl EmailConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("EMAIL_ENABLED", false),
            host: env_or("EMAIL_HOST", "localhost"),
            port: env_u32("EMAIL_PORT", 993) as u16,
            username: env_opt("EMAIL_USERNAME"),
            password: env_opt("EMAIL_PASSWORD"),
            poll_interval_secs: env_u64("EMAIL_POLL_INTERVAL_SECS", 300),
            allowed_senders: env_list("EMAIL_ALLOWED_SENDERS", &[]),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

// ── Stock quotes ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl StockConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("STOCK_ENABLED", true),
            base_url: env_or("STOCK_BASE_URL", "https://financialmodelingprep.com/api/v3"),
            api_key: env_opt("STOCK_API_KEY"),
            timeout_secs: env_u64("STOCK_TIMEOUT_SECS", 10),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
    pub conn_lifetime_secs: u64,
}

impl PostgresConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("PG_HOST", "localhost"),
            port: env_u32("PG_PORT", 5432) as u16,
            database: env_or("PG_DATABASE", "nieuws"),
            username: env_opt("PG_USERNAME"),
            password: env_opt("PG_PASSWORD"),
            ssl_mode: env_or("PG_SSL_MODE", "prefer"),
            max_connections: env_u32("PG_MAX_CONNECTIONS", 25),
            conn_lifetime_secs: env_u64("PG_CONN_LIFETIME_SECS", 3600),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── Redis ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    fn from_env() -> Self {
        Self {
            url: env_or("REDIS_URL", "redis://localhost:6379"),
        }
    }

    /// Strip userinfo for logs.
    pub fn redacted_url(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(mut u) => {
                let _ = u.set_password(None);
                let _ = u.set_username("");
                u.to_string()
            }
            Err(_) => "<invalid redis url>".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_parse_roundtrip() {
        for p in Profile::all() {
            assert_eq!(Profile::parse(p.as_str()), Some(*p));
        }
        assert_eq!(Profile::parse("turbo"), None);
    }

    #[test]
    fn apply_profile_overrides_tunables_only() {
        let mut config = Config::from_env();
        let db_host = config.postgres.host.clone();
        config.apply_profile(Profile::Conservative);
        assert_eq!(config.profile, Profile::Conservative);
        assert_eq!(config.scraper.rate_limit_seconds, 5);
        assert_eq!(config.scraper.max_concurrent, 2);
        assert_eq!(config.postgres.host, db_host);
    }

    #[test]
    fn connection_string_shape() {
        let pg = PostgresConfig {
            host: "db".into(),
            port: 5432,
            database: "nieuws".into(),
            username: Some("app".into()),
            password: Some("s3cret".into()),
            ssl_mode: "require".into(),
            max_connections: 25,
            conn_lifetime_secs: 3600,
        };
        assert_eq!(
            pg.connection_string(),
            "postgres://app:s3cret@db:5432/nieuws?sslmode=require"
        );
    }

    #[test]
    fn redis_url_redaction() {
        let r = RedisConfig { url: "redis://user:pw@cache:6379".into() };
        let redacted = r.redacted_url();
        assert!(!redacted.contains("pw"));
    }
}
