//! Mail → article conversion: subject becomes the title, the plain-text
//! body becomes summary and content, the received date becomes the
//! publication date.

use chrono::{DateTime, Utc};
use mailparse::MailHeaderMap;

use nieuws_core::sanitize::{collapse_whitespace, strip_html, truncate_words};
use nieuws_core::{ArticleDraft, Error};

const MAX_SUMMARY_CHARS: usize = 2000;

/// The fields the ingester needs from one raw message.
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
}

impl ParsedEmail {
    /// Whether the sender address matches the allowlist
    /// (case-insensitive; an entry matches the full address or its
    /// domain).
    pub fn sender_allowed(&self, allowed: &[String]) -> bool {
        let sender = self.sender.to_lowercase();
        allowed.iter().any(|entry| {
            let entry = entry.to_lowercase();
            sender == entry || sender.ends_with(&format!("@{entry}")) || {
                entry.starts_with('@') && sender.ends_with(&entry)
            }
        })
    }

    pub fn into_draft(self) -> ArticleDraft {
        let body = truncate_words(
            &collapse_whitespace(&strip_html(&self.body)),
            MAX_SUMMARY_CHARS,
        );
        ArticleDraft {
            title: collapse_whitespace(&self.subject),
            summary: body,
            // Mail has no canonical URL; the message id keeps the
            // natural key unique.
            url: format!("email://{}", self.message_id.trim_matches(['<', '>'])),
            published_at: Some(self.received_at),
            source: "email".to_string(),
            keywords: Vec::new(),
            image_url: None,
            author: Some(self.sender),
            category: Some("Persbericht".to_string()),
        }
    }
}

/// Parse a raw RFC 822 message.
pub fn parse_message(raw: &[u8]) -> Result<ParsedEmail, Error> {
    let mail = mailparse::parse_mail(raw)
        .map_err(|e| Error::Corruption(format!("mail parse: {e}")))?;

    let headers = mail.get_headers();
    let message_id = headers
        .get_first_value("Message-ID")
        .ok_or_else(|| Error::Corruption("mail without Message-ID".into()))?;
    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let sender = headers
        .get_first_value("From")
        .map(|from| extract_address(&from))
        .ok_or_else(|| Error::Corruption("mail without From".into()))?;
    let received_at = headers
        .get_first_value("Date")
        .and_then(|date| mailparse::dateparse(&date).ok())
        .and_then(|epoch| DateTime::from_timestamp(epoch, 0))
        .unwrap_or_else(Utc::now);

    let body = text_body(&mail)?;

    Ok(ParsedEmail { message_id, sender, subject, received_at, body })
}

fn extract_address(from: &str) -> String {
    match mailparse::addrparse(from) {
        Ok(list) => list
            .extract_single_info()
            .map(|info| info.addr)
            .unwrap_or_else(|| from.trim().to_string()),
        Err(_) => from.trim().to_string(),
    }
}

/// Prefer the first text/plain part; fall back to text/html, then to
/// the top-level body.
fn text_body(mail: &mailparse::ParsedMail<'_>) -> Result<String, Error> {
    fn find_part(mail: &mailparse::ParsedMail<'_>, wanted: &str) -> Option<String> {
        if mail.ctype.mimetype == wanted {
            return mail.get_body().ok();
        }
        mail.subparts.iter().find_map(|part| find_part(part, wanted))
    }

    if let Some(plain) = find_part(mail, "text/plain") {
        return Ok(plain);
    }
    if let Some(html) = find_part(mail, "text/html") {
        return Ok(strip_html(&html));
    }
    mail.get_body().map_err(|e| Error::Corruption(format!("mail body: {e}")))
}
