//! Article text extraction: fetch the HTML, try site-specific CSS
//! selectors, fall back to generic ones, and escalate to the headless
//! browser when the static HTML yields too little text.
//!
//! `scraper::Html` is not `Send`, so all selector work stays inside
//! sync helpers; the async paths only move `String`s around.

use std::sync::Arc;

use scraper::{Html, Selector};
use tracing::{debug, info};

use nieuws_core::sanitize::collapse_whitespace;
use nieuws_core::Error;

use crate::browser::BrowserPool;
use crate::http::FetchClient;

/// A selector match below this many characters is treated as a miss.
pub const MIN_TEXT_LEN: usize = 200;

/// Paragraphs shorter than this are boilerplate (cookie bars, bylines).
const MIN_PARAGRAPH_LEN: usize = 50;

/// Site-specific article-body selectors, tried before the generic
/// ladder.
const SITE_SELECTORS: &[(&str, &[&str])] = &[
    ("nu.nl", &[".article__body", "[data-type='article.body']"]),
    ("ad.nl", &[".article__body", ".article__paragraphs"]),
    ("nos.nl", &[".article-content", "#content article"]),
    ("telegraaf.nl", &[".ArticleBodyBlocks", ".body-text"]),
    ("rtlnieuws.nl", &[".article-body", ".paragraph-collection"]),
];

const GENERIC_SELECTORS: &[&str] = &["article", "main", "[role='main']"];

pub struct HtmlExtractor {
    fetch: Arc<FetchClient>,
    browser: Option<Arc<BrowserPool>>,
    /// When false, pages render in the browser up front instead of
    /// only after static extraction comes up short.
    browser_fallback_only: bool,
}

impl HtmlExtractor {
    pub fn new(
        fetch: Arc<FetchClient>,
        browser: Option<Arc<BrowserPool>>,
        browser_fallback_only: bool,
    ) -> Self {
        Self { fetch, browser, browser_fallback_only }
    }

    /// Extract the readable article text for `url`. Tries static HTML
    /// first; if that yields under [`MIN_TEXT_LEN`] characters and a
    /// browser pool is available, reruns the ladder on the rendered DOM.
    pub async fn extract(&self, url: &str, source: &str) -> Result<String, Error> {
        if let (Some(browser), false) = (&self.browser, self.browser_fallback_only) {
            return self.extract_rendered(browser, url, source).await;
        }

        let html = self.fetch.fetch_text(url).await?;
        if let Some(text) = extract_from_html(&html, source) {
            debug!(url, chars = text.len(), "Extracted from static HTML");
            return Ok(text);
        }

        let Some(browser) = &self.browser else {
            return Err(extraction_failed(url));
        };
        info!(url, "Static extraction too short — escalating to browser");
        self.extract_rendered(browser, url, source).await
    }

    async fn extract_rendered(
        &self,
        browser: &Arc<BrowserPool>,
        url: &str,
        source: &str,
    ) -> Result<String, Error> {
        let rendered = browser.render(url).await?;
        match extract_from_html(&rendered, source) {
            Some(text) => {
                debug!(url, chars = text.len(), "Extracted from rendered DOM");
                Ok(text)
            }
            None => Err(extraction_failed(url)),
        }
    }
}

fn extraction_failed(url: &str) -> Error {
    Error::Terminal(format!("extraction failed after all selectors: {url}"))
}

/// Run the selector ladder against one HTML document. Returns `None`
/// when no rung produces at least [`MIN_TEXT_LEN`] characters.
pub fn extract_from_html(html: &str, source: &str) -> Option<String> {
    let document = Html::parse_document(html);

    for (site, selectors) in SITE_SELECTORS {
        if source.contains(site) {
            for selector in *selectors {
                if let Some(text) = select_text(&document, selector) {
                    return Some(text);
                }
            }
        }
    }

    for selector in GENERIC_SELECTORS {
        if let Some(text) = select_text(&document, selector) {
            return Some(text);
        }
    }

    paragraph_text(&document)
}

/// Text of the first element matching `selector`, if long enough.
fn select_text(document: &Html, selector: &str) -> Option<String> {
    let parsed = Selector::parse(selector).ok()?;
    for element in document.select(&parsed) {
        let text = collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "));
        if text.chars().count() >= MIN_TEXT_LEN {
            return Some(text);
        }
    }
    None
}

/// Last rung: concatenate substantial `<p>` elements.
fn paragraph_text(document: &Html) -> Option<String> {
    let selector = Selector::parse("p").ok()?;
    let paragraphs: Vec<String> = document
        .select(&selector)
        .map(|p| collapse_whitespace(&p.text().collect::<Vec<_>>().join(" ")))
        .filter(|t| t.chars().count() >= MIN_PARAGRAPH_LEN)
        .collect();
    if paragraphs.is_empty() {
        return None;
    }
    let text = paragraphs.join(" ");
    if text.chars().count() >= MIN_TEXT_LEN {
        Some(text)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(len: usize) -> String {
        // Readable filler with word boundaries.
        let mut out = String::new();
        while out.chars().count() < len {
            out.push_str("woord ");
        }
        out.truncate(len);
        out
    }

    #[test]
    fn site_selector_wins_over_generic() {
        let body = body_of(300);
        let html = format!(
            "<html><body><article>kort</article>\
             <div class=\"article__body\">{body}</div></body></html>"
        );
        let text = extract_from_html(&html, "nu.nl").unwrap();
        assert!(text.starts_with("woord"));
        assert!(text.chars().count() >= MIN_TEXT_LEN);
    }

    #[test]
    fn generic_ladder_catches_unknown_sources() {
        let body = body_of(300);
        let html = format!("<html><body><main>{body}</main></body></html>");
        let text = extract_from_html(&html, "onbekend.example").unwrap();
        assert!(text.chars().count() >= MIN_TEXT_LEN);
    }

    #[test]
    fn exactly_200_chars_is_accepted() {
        let body = body_of(200);
        assert_eq!(body.chars().count(), 200);
        let html = format!("<html><body><article>{body}</article></body></html>");
        assert!(extract_from_html(&html, "nu.nl").is_some());
    }

    #[test]
    fn exactly_199_chars_is_rejected() {
        let body = body_of(199);
        let html = format!("<html><body><article>{body}</article></body></html>");
        assert!(extract_from_html(&html, "nu.nl").is_none());
    }

    #[test]
    fn paragraph_fallback_skips_short_boilerplate() {
        let long_a = body_of(150);
        let long_b = body_of(150);
        let html = format!(
            "<html><body>\
             <p>cookies!</p>\
             <p>{long_a}</p>\
             <p>deel dit</p>\
             <p>{long_b}</p>\
             </body></html>"
        );
        let text = extract_from_html(&html, "nu.nl").unwrap();
        assert!(!text.contains("cookies"));
        assert!(!text.contains("deel dit"));
    }

    #[test]
    fn spa_shell_yields_none() {
        let html = "<html><body><div id=\"app\">Laden...</div>\
                    <script>window.__data={}</script></body></html>";
        assert!(extract_from_html(html, "nu.nl").is_none());
    }

    #[test]
    fn output_contains_no_residual_markup() {
        let body = body_of(250);
        let html = format!(
            "<html><body><article><p>{body}</p><img src=\"x.jpg\"/>\
             <span>extra tekst hier</span></article></body></html>"
        );
        let text = extract_from_html(&html, "x").unwrap();
        assert!(!text.contains('<'));
        assert!(!text.contains('>'));
        assert!(!text.contains("  "));
    }
}
