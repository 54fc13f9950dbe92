//! Prompt composition. Only the enabled analyses appear in the prompt,
//! keeping token usage proportional to what was asked for.

use crate::options::AnalysisOptions;

pub const SYSTEM_PROMPT: &str = "You are a news analysis engine. You receive Dutch or English \
news articles and return ONLY a valid JSON object with the requested analyses. No explanation, \
no markdown.";

/// Build the user prompt for a single article.
pub fn article_prompt(title: &str, content: &str, options: &AnalysisOptions) -> String {
    let mut fields = Vec::new();
    if options.sentiment {
        fields.push(
            "\"sentiment\": {\"score\": <float -1..1>, \"label\": \
             \"positive\"|\"neutral\"|\"negative\"}",
        );
    }
    if options.entities {
        fields.push(
            "\"entities\": {\"persons\": [..], \"organizations\": [..], \"locations\": [..], \
             \"stock_tickers\": [..]}",
        );
    }
    if options.categories {
        fields.push("\"categories\": {\"<category>\": <confidence 0..1>, ...}");
    }
    if options.keywords {
        fields.push("\"keywords\": [{\"word\": <string>, \"score\": <relevance 0..1>}, ...]");
    }
    if options.summary {
        fields.push("\"summary\": <max two sentences>");
    }

    format!(
        "Analyse this article and reply with a JSON object containing exactly these fields:\n\
         {{{}}}\n\n\
         Title: {title}\n\n\
         {content}",
        fields.join(", ")
    )
}

/// Build the user prompt for a packed batch. The response must be a
/// JSON array aligned with the input order.
pub fn batch_prompt(articles: &[(String, String)], options: &AnalysisOptions) -> String {
    let mut prompt = format!(
        "Analyse the {} numbered articles below. Reply with a JSON array of {} objects, one per \
         article, in the same order. Each object has the fields described here:\n{}\n\n",
        articles.len(),
        articles.len(),
        article_prompt("<title>", "<content>", options)
            .lines()
            .take(2)
            .collect::<Vec<_>>()
            .join("\n")
    );
    for (index, (title, content)) in articles.iter().enumerate() {
        prompt.push_str(&format!("### Article {}\nTitle: {title}\n{content}\n\n", index + 1));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_analyses_stay_out_of_the_prompt() {
        let options = AnalysisOptions {
            sentiment: true,
            entities: false,
            categories: false,
            keywords: false,
            summary: false,
            force: false,
        };
        let prompt = article_prompt("Titel", "Tekst", &options);
        assert!(prompt.contains("sentiment"));
        assert!(!prompt.contains("entities"));
        assert!(!prompt.contains("keywords"));
    }

    #[test]
    fn batch_prompt_numbers_articles() {
        let articles = vec![
            ("Eerste".to_string(), "inhoud a".to_string()),
            ("Tweede".to_string(), "inhoud b".to_string()),
        ];
        let prompt = batch_prompt(&articles, &AnalysisOptions::default());
        assert!(prompt.contains("### Article 1"));
        assert!(prompt.contains("### Article 2"));
        assert!(prompt.contains("Eerste"));
        assert!(prompt.contains("JSON array of 2 objects"));
    }
}
