//! Robust parsing of LLM responses: markdown fences are stripped, the
//! first balanced JSON value is extracted, entity fields accept both
//! `["A"]` and `[{"name": "A"}]` shapes, and every numeric field is
//! clamped to its documented range.

use std::collections::BTreeMap;

use serde_json::Value;

use nieuws_core::{Enrichment, EntitySet, KeywordScore, Sentiment, SentimentLabel};

/// Extract the first balanced JSON object or array from a response,
/// tolerating markdown fences and prose around it.
pub fn extract_json(response: &str) -> Option<&str> {
    let trimmed = response.trim();

    // ```json ... ``` and bare ``` ... ``` fences.
    if let Some(start) = trimmed.find("```") {
        let after_tick = &trimmed[start + 3..];
        let content_start = after_tick.find('\n').map_or(0, |n| n + 1);
        let fenced = &after_tick[content_start..];
        let fenced = match fenced.find("```") {
            Some(end) => &fenced[..end],
            None => fenced,
        };
        if let Some(json) = balanced_json(fenced) {
            return Some(json);
        }
    }

    balanced_json(trimmed)
}

/// Scan for the first `{...}` or `[...]` with balanced delimiters,
/// ignoring braces inside string literals.
fn balanced_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find(|c| c == '{' || c == '[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn clamp(value: f64, low: f64, high: f64) -> f64 {
    value.clamp(low, high)
}

/// Accept either an array of strings or an array of objects carrying a
/// `name`/`symbol`/`word` field.
fn string_list(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(map) => map
                .get("name")
                .or_else(|| map.get("symbol"))
                .or_else(|| map.get("word"))
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_sentiment(value: Option<&Value>) -> Option<Sentiment> {
    let value = value?;
    let score = match value {
        Value::Object(map) => map.get("score")?.as_f64()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    let score = clamp(score, -1.0, 1.0);
    let label = value
        .get("label")
        .and_then(|l| l.as_str())
        .and_then(|l| match l {
            "positive" => Some(SentimentLabel::Positive),
            "neutral" => Some(SentimentLabel::Neutral),
            "negative" => Some(SentimentLabel::Negative),
            _ => None,
        })
        .unwrap_or_else(|| SentimentLabel::from_score(score));
    Some(Sentiment { score, label })
}

fn parse_categories(value: Option<&Value>) -> BTreeMap<String, f64> {
    let Some(Value::Object(map)) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(category, confidence)| {
            confidence.as_f64().map(|c| (category.clone(), clamp(c, 0.0, 1.0)))
        })
        .collect()
}

fn parse_keywords(value: Option<&Value>) -> Vec<KeywordScore> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();
    for item in items {
        let (word, score) = match item {
            Value::String(word) => (word.trim().to_string(), 0.5),
            Value::Object(map) => {
                let Some(word) = map.get("word").and_then(|w| w.as_str()) else { continue };
                let score = map.get("score").and_then(|s| s.as_f64()).unwrap_or(0.5);
                (word.trim().to_string(), score)
            }
            _ => continue,
        };
        if word.is_empty() || !seen.insert(word.to_lowercase()) {
            continue;
        }
        keywords.push(KeywordScore { word, score: clamp(score, 0.0, 1.0) });
    }
    keywords
}

fn enrichment_from_value(value: &Value) -> Enrichment {
    let entities_value = value.get("entities");
    let entities = EntitySet {
        persons: string_list(entities_value.and_then(|e| e.get("persons"))),
        organizations: string_list(entities_value.and_then(|e| e.get("organizations"))),
        locations: string_list(entities_value.and_then(|e| e.get("locations"))),
        stock_tickers: string_list(entities_value.and_then(|e| e.get("stock_tickers"))),
    };

    Enrichment {
        sentiment: parse_sentiment(value.get("sentiment")),
        categories: parse_categories(value.get("categories")),
        entities,
        keywords: parse_keywords(value.get("keywords")),
        summary: value
            .get("summary")
            .and_then(|s| s.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    }
}

/// Parse a single-article response.
pub fn parse_enrichment(response: &str) -> Result<Enrichment, String> {
    let json = extract_json(response).ok_or("no JSON object in response")?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| format!("malformed JSON: {e}"))?;
    if !value.is_object() {
        return Err("response is not a JSON object".into());
    }
    Ok(enrichment_from_value(&value))
}

/// Parse a batch response: a JSON array aligned with the input order.
/// Short or long arrays are an error; the caller falls back to
/// per-article processing.
pub fn parse_enrichment_batch(response: &str, expected: usize) -> Result<Vec<Enrichment>, String> {
    let json = extract_json(response).ok_or("no JSON array in response")?;
    let value: Value =
        serde_json::from_str(json).map_err(|e| format!("malformed JSON: {e}"))?;
    let Value::Array(items) = value else {
        return Err("batch response is not a JSON array".into());
    };
    if items.len() != expected {
        return Err(format!("expected {expected} results, got {}", items.len()));
    }
    Ok(items.iter().map(enrichment_from_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_json_fence() {
        let response = "Here you go:\n```json\n{\"sentiment\": {\"score\": 0.5}}\n```\nDone.";
        let json = extract_json(response).unwrap();
        assert_eq!(json, "{\"sentiment\": {\"score\": 0.5}}");
    }

    #[test]
    fn extracts_with_trailing_fence_only() {
        let response = "{\"sentiment\": {\"score\": 0.5}}\n```";
        let enrichment = parse_enrichment(response).unwrap();
        assert_eq!(enrichment.sentiment.unwrap().score, 0.5);
    }

    #[test]
    fn balanced_scan_ignores_braces_in_strings() {
        let response = r#"noise {"summary": "bevat { en } tekens", "categories": {}} trailer"#;
        let enrichment = parse_enrichment(response).unwrap();
        assert_eq!(enrichment.summary.as_deref(), Some("bevat { en } tekens"));
    }

    #[test]
    fn entity_arrays_accept_strings_and_objects() {
        let plain = parse_enrichment(r#"{"entities": {"persons": ["Mark Rutte"]}}"#).unwrap();
        let named =
            parse_enrichment(r#"{"entities": {"persons": [{"name": "Mark Rutte"}]}}"#).unwrap();
        assert_eq!(plain.entities.persons, vec!["Mark Rutte"]);
        assert_eq!(plain.entities, named.entities);
    }

    #[test]
    fn ticker_objects_use_symbol_field() {
        let enrichment = parse_enrichment(
            r#"{"entities": {"stock_tickers": [{"symbol": "ASML"}, "BESI"]}}"#,
        )
        .unwrap();
        assert_eq!(enrichment.entities.stock_tickers, vec!["ASML", "BESI"]);
    }

    #[test]
    fn sentiment_score_is_clamped_and_label_derived() {
        let enrichment = parse_enrichment(r#"{"sentiment": {"score": 3.5}}"#).unwrap();
        let sentiment = enrichment.sentiment.unwrap();
        assert_eq!(sentiment.score, 1.0);
        assert_eq!(sentiment.label, SentimentLabel::Positive);
    }

    #[test]
    fn explicit_label_wins_over_bands() {
        let enrichment =
            parse_enrichment(r#"{"sentiment": {"score": 0.9, "label": "neutral"}}"#).unwrap();
        assert_eq!(enrichment.sentiment.unwrap().label, SentimentLabel::Neutral);
    }

    #[test]
    fn label_band_boundaries() {
        let at_positive = parse_enrichment(r#"{"sentiment": {"score": 0.2}}"#).unwrap();
        assert_eq!(at_positive.sentiment.unwrap().label, SentimentLabel::Positive);
        let at_negative = parse_enrichment(r#"{"sentiment": {"score": -0.2}}"#).unwrap();
        assert_eq!(at_negative.sentiment.unwrap().label, SentimentLabel::Negative);
        let neutral = parse_enrichment(r#"{"sentiment": {"score": 0.19}}"#).unwrap();
        assert_eq!(neutral.sentiment.unwrap().label, SentimentLabel::Neutral);
    }

    #[test]
    fn category_confidences_are_clamped() {
        let enrichment =
            parse_enrichment(r#"{"categories": {"politiek": 1.7, "economie": -0.2}}"#).unwrap();
        assert_eq!(enrichment.categories["politiek"], 1.0);
        assert_eq!(enrichment.categories["economie"], 0.0);
    }

    #[test]
    fn keywords_deduplicate_by_word() {
        let enrichment = parse_enrichment(
            r#"{"keywords": [
                {"word": "kabinet", "score": 0.9},
                {"word": "Kabinet", "score": 0.4},
                {"word": "begroting", "score": 1.4}
            ]}"#,
        )
        .unwrap();
        assert_eq!(enrichment.keywords.len(), 2);
        assert_eq!(enrichment.keywords[0].word, "kabinet");
        assert_eq!(enrichment.keywords[0].score, 0.9);
        assert_eq!(enrichment.keywords[1].score, 1.0);
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let enrichment = parse_enrichment("{}").unwrap();
        assert!(enrichment.sentiment.is_none());
        assert!(enrichment.categories.is_empty());
        assert!(enrichment.entities.is_empty());
        assert!(enrichment.keywords.is_empty());
        assert!(enrichment.summary.is_none());
    }

    #[test]
    fn scenario_fenced_response_parses_fully() {
        let response = "```json\n{\"sentiment\":{\"score\":0.55,\"label\":\"positive\"},\
            \"entities\":{\"persons\":[{\"name\":\"Mark Rutte\"}],\
            \"stock_tickers\":[{\"symbol\":\"ASML\"}]}}\n```";
        let enrichment = parse_enrichment(response).unwrap();
        assert_eq!(enrichment.sentiment.unwrap().score, 0.55);
        assert_eq!(enrichment.entities.persons, vec!["Mark Rutte"]);
        assert_eq!(enrichment.entities.stock_tickers, vec!["ASML"]);
    }

    #[test]
    fn batch_parse_aligns_positions() {
        let response = r#"[{"sentiment": {"score": 0.3}}, {"sentiment": {"score": -0.6}}]"#;
        let batch = parse_enrichment_batch(response, 2).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].sentiment.unwrap().score, 0.3);
        assert_eq!(batch[1].sentiment.unwrap().score, -0.6);
    }

    #[test]
    fn batch_length_mismatch_is_an_error() {
        let response = r#"[{"sentiment": {"score": 0.3}}]"#;
        assert!(parse_enrichment_batch(response, 2).is_err());
    }

    #[test]
    fn prose_without_json_is_an_error() {
        assert!(parse_enrichment("Sorry, I cannot analyse that.").is_err());
    }
}
