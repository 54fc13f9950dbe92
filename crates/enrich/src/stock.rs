//! Stock-quote enrichment. Symbols are deduplicated across the AI
//! batch and fetched with exactly one provider call; each article then
//! receives the subset of quotes it mentioned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use nieuws_core::config::StockConfig;
use nieuws_core::{Error, StockQuote};
use nieuws_store::ArticleStore;

/// The batch-quote endpoint takes at most this many symbols.
pub const MAX_SYMBOLS: usize = 100;

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Fetch quotes for a set of symbols in one request. Symbols the
    /// provider does not know are simply absent from the result.
    async fn get_multiple_quotes(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, StockQuote>, Error>;
}

/// HTTPS batch-quote client.
pub struct HttpQuoteProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpQuoteProvider {
    pub fn from_config(config: &StockConfig) -> Result<Self, Error> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::InvalidInput("STOCK_API_KEY not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Transient(format!("stock client init: {e}")))?;
        Ok(Self { client, base_url: config.base_url.clone(), api_key })
    }
}

#[derive(serde::Deserialize)]
struct QuoteRow {
    symbol: String,
    price: f64,
    #[serde(default)]
    change: f64,
    #[serde(default, rename = "changesPercentage")]
    changes_percentage: f64,
}

#[async_trait]
impl QuoteProvider for HttpQuoteProvider {
    async fn get_multiple_quotes(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, StockQuote>, Error> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = symbols[..symbols.len().min(MAX_SYMBOLS)].join(",");
        let url = format!("{}/quote/{}?apikey={}", self.base_url, joined, self.api_key);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("stock request: {e}")))?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimited("stock provider throttled".into()));
        }
        if !status.is_success() {
            return Err(Error::Transient(format!("stock provider: {status}")));
        }

        let rows: Vec<QuoteRow> = response
            .json()
            .await
            .map_err(|e| Error::Terminal(format!("stock response parse: {e}")))?;

        let now = Utc::now();
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.symbol.clone(),
                    StockQuote {
                        symbol: row.symbol,
                        price: row.price,
                        change: row.change,
                        change_percent: row.changes_percentage,
                        fetched_at: now,
                    },
                )
            })
            .collect())
    }
}

pub struct StockEnricher {
    provider: Arc<dyn QuoteProvider>,
    store: Arc<dyn ArticleStore>,
}

impl StockEnricher {
    pub fn new(provider: Arc<dyn QuoteProvider>, store: Arc<dyn ArticleStore>) -> Self {
        Self { provider, store }
    }

    /// Join stock data onto freshly enriched articles. Provider errors
    /// are logged and swallowed: the AI batch must never fail on quote
    /// trouble. Returns the number of articles updated.
    pub async fn enrich_articles(&self, ids: &[i64]) -> usize {
        if ids.is_empty() {
            return 0;
        }

        let per_article = match self.store.stock_tickers_for(ids).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Could not read tickers for stock enrichment");
                return 0;
            }
        };
        if per_article.is_empty() {
            return 0;
        }

        let mut union: BTreeSet<String> = BTreeSet::new();
        for (_, tickers) in &per_article {
            union.extend(tickers.iter().cloned());
        }
        let symbols: Vec<String> = union.into_iter().take(MAX_SYMBOLS).collect();
        debug!(articles = per_article.len(), symbols = symbols.len(), "Fetching quote batch");

        let quotes = match self.provider.get_multiple_quotes(&symbols).await {
            Ok(quotes) => quotes,
            Err(e) => {
                warn!(error = %e, "Stock provider failed — articles keep no quote data");
                return 0;
            }
        };

        let mut updated = 0;
        for (id, tickers) in per_article {
            let subset: BTreeMap<String, StockQuote> = tickers
                .iter()
                .filter_map(|t| quotes.get(t).map(|q| (t.clone(), q.clone())))
                .collect();
            if subset.is_empty() {
                continue;
            }
            match self.store.update_stock_data(id, &subset).await {
                Ok(()) => updated += 1,
                Err(e) => warn!(article_id = id, error = %e, "Stock data write failed"),
            }
        }
        if updated > 0 {
            info!(updated, "Stock data joined onto enriched articles");
        }
        updated
    }
}
