//! Content-extraction worker: a ticker that picks articles without
//! content and drives the extractor under a small semaphore.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use nieuws_core::config::ContentConfig;
use nieuws_core::Error;
use nieuws_store::ArticleStore;

use nieuws_scrape::HtmlExtractor;

/// Seam over article-text extraction so the worker is testable without
/// a network or browser.
#[async_trait]
pub trait ContentExtract: Send + Sync {
    async fn extract(&self, url: &str, source: &str) -> Result<String, Error>;
}

#[async_trait]
impl ContentExtract for HtmlExtractor {
    async fn extract(&self, url: &str, source: &str) -> Result<String, Error> {
        HtmlExtractor::extract(self, url, source).await
    }
}

pub struct ContentProcessor {
    store: Arc<dyn ArticleStore>,
    extractor: Arc<dyn ContentExtract>,
    config: ContentConfig,
    semaphore: Arc<Semaphore>,
}

impl ContentProcessor {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        extractor: Arc<dyn ContentExtract>,
        config: ContentConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { store, extractor, config, semaphore }
    }

    /// Ticker loop; runs until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.extraction_enabled {
            info!("Content extraction disabled");
            return;
        }
        info!(
            interval_secs = self.config.interval_secs,
            batch_size = self.config.batch_size,
            "Content processor started"
        );
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.process_batch().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Content processor stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One extraction pass. Returns how many articles got content.
    pub async fn process_batch(&self) -> usize {
        let candidates = match self.store.missing_content_ids(self.config.batch_size).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Could not list articles missing content");
                return 0;
            }
        };
        if candidates.is_empty() {
            return 0;
        }
        debug!(count = candidates.len(), "Extracting article content");

        let mut set = JoinSet::new();
        for candidate in candidates {
            let store = self.store.clone();
            let extractor = self.extractor.clone();
            let semaphore = self.semaphore.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                match extractor.extract(&candidate.url, &candidate.source).await {
                    Ok(text) => match store.update_content(candidate.id, &text).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(article_id = candidate.id, error = %e, "Content write failed");
                            false
                        }
                    },
                    Err(e) => {
                        // Terminal extraction failures stay unextracted;
                        // a later pass may still succeed via the browser.
                        debug!(article_id = candidate.id, url = %candidate.url, error = %e,
                               "Extraction failed");
                        false
                    }
                }
            });
        }

        let mut extracted = 0;
        while let Some(result) = set.join_next().await {
            if matches!(result, Ok(true)) {
                extracted += 1;
            }
        }
        if extracted > 0 {
            info!(extracted, "Content extraction pass finished");
        }
        extracted
    }
}
