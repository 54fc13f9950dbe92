//! Materialised-view refresher: periodic `REFRESH MATERIALIZED VIEW
//! CONCURRENTLY` plus a manual trigger used after big writes.

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const VIEWS: &[&str] = &["trending_keywords", "sentiment_timeline", "hot_entities"];

pub struct ViewRefresher {
    pool: PgPool,
    interval: Duration,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: mpsc::Receiver<()>,
}

impl ViewRefresher {
    pub fn new(pool: PgPool, interval: Duration) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self { pool, interval, trigger_tx, trigger_rx }
    }

    /// Handle for requesting an out-of-band refresh. A refresh already
    /// in flight absorbs the request.
    pub fn trigger(&self) -> RefreshTrigger {
        RefreshTrigger { tx: self.trigger_tx.clone() }
    }

    /// Run until `shutdown` flips. Refresh failures are logged and
    /// retried on the next tick.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "View refresher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; that initial
        // refresh is wanted.
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    refresh_all(&self.pool).await;
                }
                Some(()) = self.trigger_rx.recv() => {
                    debug!("Manual view refresh requested");
                    refresh_all(&self.pool).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("View refresher stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct RefreshTrigger {
    tx: mpsc::Sender<()>,
}

impl RefreshTrigger {
    /// Fire-and-forget: a full channel means a refresh is already queued.
    pub fn refresh_now(&self) {
        let _ = self.tx.try_send(());
    }
}

async fn refresh_all(pool: &PgPool) {
    for &view in VIEWS {
        let started = std::time::Instant::now();
        let sql = format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {view}");
        match sqlx::query(&sql).execute(pool).await {
            Ok(_) => {
                debug!(view, elapsed_ms = started.elapsed().as_millis() as u64, "View refreshed");
            }
            Err(e) => {
                warn!(view, error = %e, "View refresh failed — will retry next tick");
            }
        }
    }
}
