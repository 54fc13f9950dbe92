//! robots.txt policy cache. Policies are fetched per host, parsed into
//! agent groups, and cached with a TTL. Any fetch or parse problem
//! fails open: the path is treated as allowed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use nieuws_core::{Clock, SystemClock};

#[derive(Debug, Clone, PartialEq)]
enum Rule {
    Allow(String),
    Disallow(String),
}

#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
}

/// Parsed policy for one host.
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    groups: Vec<Group>,
}

impl RobotsPolicy {
    pub fn parse(text: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current = Group::default();
        let mut saw_rule = false;

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else { continue };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    // A user-agent line after rules starts a new group.
                    if saw_rule {
                        if !current.agents.is_empty() {
                            groups.push(std::mem::take(&mut current));
                        }
                        saw_rule = false;
                    }
                    current.agents.push(value.to_ascii_lowercase());
                }
                "allow" => {
                    saw_rule = true;
                    if !value.is_empty() {
                        current.rules.push(Rule::Allow(value.to_string()));
                    }
                }
                "disallow" => {
                    saw_rule = true;
                    // An empty Disallow means everything is allowed.
                    if !value.is_empty() {
                        current.rules.push(Rule::Disallow(value.to_string()));
                    }
                }
                _ => {}
            }
        }
        if !current.agents.is_empty() {
            groups.push(current);
        }
        Self { groups }
    }

    /// Longest-prefix match across the group that applies to
    /// `user_agent` (falling back to `*`); Allow wins length ties.
    pub fn allowed(&self, path: &str, user_agent: &str) -> bool {
        let agent = user_agent.to_ascii_lowercase();
        let group = self
            .groups
            .iter()
            .find(|g| g.agents.iter().any(|a| a != "*" && agent.contains(a.as_str())))
            .or_else(|| self.groups.iter().find(|g| g.agents.iter().any(|a| a == "*")));

        let Some(group) = group else { return true };

        let mut best_len = 0usize;
        let mut allowed = true;
        for rule in &group.rules {
            let (prefix, is_allow) = match rule {
                Rule::Allow(p) => (p, true),
                Rule::Disallow(p) => (p, false),
            };
            if path.starts_with(prefix.as_str()) {
                let len = prefix.len();
                if len > best_len || (len == best_len && is_allow) {
                    best_len = len;
                    allowed = is_allow;
                }
            }
        }
        allowed
    }
}

struct CachedPolicy {
    policy: RobotsPolicy,
    fetched_at: DateTime<Utc>,
}

/// Per-host policy cache with TTL. Disabled entirely via config; the
/// orchestrator then skips the check.
pub struct RobotsCache {
    client: reqwest::Client,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedPolicy>>,
    clock: Arc<dyn Clock>,
}

impl RobotsCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: reqwest::Client::new(),
            ttl,
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Whether `user_agent` may fetch `path` on `host`. Fetch failures,
    /// non-200 responses and parse oddities all fail open.
    pub async fn allowed(&self, host: &str, path: &str, user_agent: &str) -> bool {
        if let Some(policy) = self.cached(host) {
            return policy.allowed(path, user_agent);
        }

        let policy = match self.fetch(host).await {
            Some(policy) => policy,
            None => {
                debug!(host, "robots.txt unavailable — failing open");
                RobotsPolicy::default()
            }
        };
        let verdict = policy.allowed(path, user_agent);
        self.store(host, policy);
        verdict
    }

    /// Seed a parsed policy directly (tests).
    pub fn store_policy(&self, host: &str, text: &str) {
        self.store(host, RobotsPolicy::parse(text));
    }

    fn cached(&self, host: &str) -> Option<RobotsPolicy> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(host)?;
        let age = (self.clock.now() - entry.fetched_at).to_std().unwrap_or(Duration::MAX);
        if age < self.ttl {
            Some(entry.policy.clone())
        } else {
            None
        }
    }

    fn store(&self, host: &str, policy: RobotsPolicy) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            host.to_string(),
            CachedPolicy { policy, fetched_at: self.clock.now() },
        );
    }

    async fn fetch(&self, host: &str) -> Option<RobotsPolicy> {
        let url = format!("https://{host}/robots.txt");
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| warn!(host, error = %e, "robots.txt fetch failed"))
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        Some(RobotsPolicy::parse(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBOTS: &str = "\
# nieuwssite robots
User-agent: *
Disallow: /zoeken
Disallow: /account/
Allow: /account/openbaar

User-agent: slurper
Disallow: /
";

    #[test]
    fn wildcard_group_applies_to_unknown_agents() {
        let policy = RobotsPolicy::parse(ROBOTS);
        assert!(!policy.allowed("/zoeken", "Mozilla/5.0"));
        assert!(policy.allowed("/artikel/1", "Mozilla/5.0"));
    }

    #[test]
    fn longest_prefix_wins_and_allow_overrides() {
        let policy = RobotsPolicy::parse(ROBOTS);
        assert!(!policy.allowed("/account/instellingen", "Mozilla/5.0"));
        assert!(policy.allowed("/account/openbaar", "Mozilla/5.0"));
    }

    #[test]
    fn named_group_takes_precedence_over_wildcard() {
        let policy = RobotsPolicy::parse(ROBOTS);
        assert!(!policy.allowed("/artikel/1", "slurper/2.0"));
    }

    #[test]
    fn empty_or_missing_policy_allows_everything() {
        let policy = RobotsPolicy::parse("");
        assert!(policy.allowed("/wat/dan/ook", "Mozilla/5.0"));
    }

    #[test]
    fn empty_disallow_means_allowed() {
        let policy = RobotsPolicy::parse("User-agent: *\nDisallow:\n");
        assert!(policy.allowed("/", "Mozilla/5.0"));
    }

    #[tokio::test]
    async fn cached_policy_is_served_within_ttl() {
        use nieuws_core::clock::ManualClock;

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = RobotsCache::with_clock(Duration::from_secs(3600), clock.clone());
        cache.store_policy("nu.nl", ROBOTS);

        assert!(!cache.allowed("nu.nl", "/zoeken", "Mozilla/5.0").await);
        assert!(cache.allowed("nu.nl", "/artikel/1", "Mozilla/5.0").await);
    }
}
