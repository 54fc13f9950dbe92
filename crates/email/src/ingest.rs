//! IMAP mailbox polling. Each tick connects over TLS, fetches unseen
//! messages, filters senders against the allowlist and stores the
//! accepted ones as articles. Connection trouble backs off locally
//! (doubling, capped) without involving the scrape circuit breakers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use nieuws_core::config::EmailConfig;
use nieuws_core::Error;
use nieuws_store::{ArticleStore, EmailRecord, EmailStore};

use crate::convert::{parse_message, ParsedEmail};

const MAX_BACKOFF: Duration = Duration::from_secs(1800);

/// Counts for one poll round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub fetched: usize,
    pub stored: usize,
    pub filtered: usize,
    pub duplicates: usize,
}

pub struct EmailIngester {
    config: EmailConfig,
    articles: Arc<dyn ArticleStore>,
    emails: Arc<dyn EmailStore>,
}

impl EmailIngester {
    pub fn new(
        config: EmailConfig,
        articles: Arc<dyn ArticleStore>,
        emails: Arc<dyn EmailStore>,
    ) -> Self {
        Self { config, articles, emails }
    }

    /// Poll loop; runs until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Email ingestion disabled");
            return;
        }
        if !self.config.is_configured() {
            warn!("Email ingestion enabled but credentials missing — not starting");
            return;
        }
        info!(
            host = %self.config.host,
            interval_secs = self.config.poll_interval_secs,
            "Email ingester started"
        );

        let mut backoff = Duration::ZERO;
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                    match self.poll_once().await {
                        Ok(outcome) => {
                            backoff = Duration::ZERO;
                            if outcome.fetched > 0 {
                                info!(
                                    fetched = outcome.fetched,
                                    stored = outcome.stored,
                                    filtered = outcome.filtered,
                                    "Mailbox poll finished"
                                );
                            }
                        }
                        Err(e) => {
                            backoff = if backoff.is_zero() {
                                Duration::from_secs(30)
                            } else {
                                (backoff * 2).min(MAX_BACKOFF)
                            };
                            warn!(
                                error = %e,
                                backoff_secs = backoff.as_secs(),
                                "Mailbox poll failed"
                            );
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Email ingester stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One full poll: connect, fetch UNSEEN, ingest, logout.
    pub async fn poll_once(&self) -> Result<PollOutcome, Error> {
        let host = self.config.host.clone();
        let username = self.config.username.clone().unwrap_or_default();
        let password = self.config.password.clone().unwrap_or_default();

        let tcp = tokio::net::TcpStream::connect((host.as_str(), self.config.port))
            .await
            .map_err(|e| Error::Transient(format!("imap connect: {e}")))?;
        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = tls
            .connect(host.as_str(), tcp)
            .await
            .map_err(|e| Error::Transient(format!("imap tls: {e}")))?;

        let client = async_imap::Client::new(tls_stream);
        let mut session = client
            .login(&username, &password)
            .await
            .map_err(|(e, _)| Error::Terminal(format!("imap login: {e}")))?;

        session
            .select("INBOX")
            .await
            .map_err(|e| Error::Transient(format!("imap select: {e}")))?;

        let unseen = session
            .uid_search("UNSEEN")
            .await
            .map_err(|e| Error::Transient(format!("imap search: {e}")))?;

        let mut outcome = PollOutcome::default();
        if !unseen.is_empty() {
            let sequence = unseen
                .iter()
                .map(|uid| uid.to_string())
                .collect::<Vec<_>>()
                .join(",");
            debug!(count = unseen.len(), "Fetching unseen messages");

            let mut bodies = Vec::new();
            {
                let mut fetches = session
                    .uid_fetch(&sequence, "RFC822")
                    .await
                    .map_err(|e| Error::Transient(format!("imap fetch: {e}")))?;
                while let Some(fetch) = fetches.next().await {
                    let fetch =
                        fetch.map_err(|e| Error::Transient(format!("imap fetch item: {e}")))?;
                    if let Some(body) = fetch.body() {
                        bodies.push(body.to_vec());
                    }
                }
            }

            outcome.fetched = bodies.len();
            for raw in bodies {
                self.ingest_raw(&raw, &mut outcome).await;
            }
        }

        if let Err(e) = session.logout().await {
            debug!(error = %e, "IMAP logout failed");
        }
        Ok(outcome)
    }

    async fn ingest_raw(&self, raw: &[u8], outcome: &mut PollOutcome) {
        match parse_message(raw) {
            Ok(parsed) => {
                if let Err(e) = self.ingest_message(parsed, outcome).await {
                    warn!(error = %e, "Email ingestion failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "Unparseable message skipped");
            }
        }
    }

    /// Ingest one parsed message: allowlist filter, message-id dedup,
    /// article creation, tracking row.
    pub async fn ingest_message(
        &self,
        parsed: ParsedEmail,
        outcome: &mut PollOutcome,
    ) -> Result<(), Error> {
        if self.emails.email_seen(&parsed.message_id).await.map_err(Error::from)? {
            outcome.duplicates += 1;
            return Ok(());
        }

        if !parsed.sender_allowed(&self.config.allowed_senders) {
            debug!(sender = %parsed.sender, "Sender not on allowlist");
            outcome.filtered += 1;
            return Ok(());
        }

        let record_base = EmailRecord {
            message_id: parsed.message_id.clone(),
            sender: parsed.sender.clone(),
            subject: parsed.subject.clone(),
            received_at: parsed.received_at,
            article_id: None,
            error: None,
        };

        let draft = parsed.into_draft();
        match self.articles.create_batch(std::slice::from_ref(&draft)).await {
            Ok(ids) => {
                let record = EmailRecord { article_id: ids.first().copied(), ..record_base };
                self.emails.record_email(&record).await.map_err(Error::from)?;
                if !ids.is_empty() {
                    outcome.stored += 1;
                } else {
                    outcome.duplicates += 1;
                }
                Ok(())
            }
            Err(e) => {
                let record = EmailRecord {
                    error: Some(e.to_string()),
                    ..record_base
                };
                let _ = self.emails.record_email(&record).await;
                Err(Error::from(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nieuws_store::MemoryArticleStore;

    fn parsed(message_id: &str, sender: &str) -> ParsedEmail {
        ParsedEmail {
            message_id: message_id.to_string(),
            sender: sender.to_string(),
            subject: "Persbericht".to_string(),
            received_at: Utc::now(),
            body: "Inhoud van het bericht.".to_string(),
        }
    }

    fn ingester(store: Arc<MemoryArticleStore>, allowed: &[&str]) -> EmailIngester {
        let mut config = nieuws_core::Config::from_env().email;
        config.enabled = true;
        config.allowed_senders = allowed.iter().map(|s| s.to_string()).collect();
        EmailIngester::new(config, store.clone(), store)
    }

    #[tokio::test]
    async fn allowed_sender_becomes_an_article() {
        let store = Arc::new(MemoryArticleStore::new());
        let ingester = ingester(store.clone(), &["anp.nl"]);

        let mut outcome = PollOutcome::default();
        ingester
            .ingest_message(parsed("<m1@anp.nl>", "nieuws@anp.nl"), &mut outcome)
            .await
            .unwrap();

        assert_eq!(outcome.stored, 1);
        assert_eq!(store.article_count(), 1);
        assert!(store.email_seen("<m1@anp.nl>").await.unwrap());
    }

    #[tokio::test]
    async fn disallowed_sender_is_filtered_without_storing() {
        let store = Arc::new(MemoryArticleStore::new());
        let ingester = ingester(store.clone(), &["anp.nl"]);

        let mut outcome = PollOutcome::default();
        ingester
            .ingest_message(parsed("<m1@spam>", "aanbieding@spam.example"), &mut outcome)
            .await
            .unwrap();

        assert_eq!(outcome.filtered, 1);
        assert_eq!(store.article_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_not_reprocessed() {
        let store = Arc::new(MemoryArticleStore::new());
        let ingester = ingester(store.clone(), &["anp.nl"]);

        let mut outcome = PollOutcome::default();
        ingester
            .ingest_message(parsed("<m1@anp.nl>", "nieuws@anp.nl"), &mut outcome)
            .await
            .unwrap();
        ingester
            .ingest_message(parsed("<m1@anp.nl>", "nieuws@anp.nl"), &mut outcome)
            .await
            .unwrap();

        assert_eq!(outcome.stored, 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(store.article_count(), 1);
    }
}
