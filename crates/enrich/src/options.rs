use nieuws_core::config::AiConfig;

/// Explicit analysis toggles for one enrichment request. The prompt
/// composes only the enabled analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisOptions {
    pub sentiment: bool,
    pub entities: bool,
    pub categories: bool,
    pub keywords: bool,
    pub summary: bool,
    /// Bypass the response cache.
    pub force: bool,
}

impl AnalysisOptions {
    pub fn from_config(config: &AiConfig) -> Self {
        Self {
            sentiment: config.enable_sentiment,
            entities: config.enable_entities,
            categories: config.enable_categories,
            keywords: config.enable_keywords,
            summary: config.enable_summary,
            force: false,
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.sentiment || self.entities || self.categories || self.keywords || self.summary
    }
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            sentiment: true,
            entities: true,
            categories: true,
            keywords: true,
            summary: false,
            force: false,
        }
    }
}
