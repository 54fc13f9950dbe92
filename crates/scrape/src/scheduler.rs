//! Ticker-driven scrape scheduling. An immediate run on start, then a
//! tick per interval; `update_interval` re-arms the ticker without a
//! stray tick in the old cadence; a tick that fires while the previous
//! scrape still runs is coalesced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::orchestrator::{ScrapeReport, ScrapeRunner};

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

pub struct ScrapeScheduler {
    runner: Arc<dyn ScrapeRunner>,
    interval_tx: watch::Sender<Duration>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    busy: Arc<AtomicBool>,
    run_count: Arc<AtomicU64>,
    last_run: Arc<Mutex<Option<DateTime<Utc>>>>,
    last_results: Arc<Mutex<HashMap<String, ScrapeReport>>>,
}

impl ScrapeScheduler {
    pub fn new(runner: Arc<dyn ScrapeRunner>, interval: Duration) -> Self {
        let (interval_tx, _) = watch::channel(interval);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            runner,
            interval_tx,
            shutdown_tx,
            task: Mutex::new(None),
            running: AtomicBool::new(false),
            busy: Arc::new(AtomicBool::new(false)),
            run_count: Arc::new(AtomicU64::new(0)),
            last_run: Arc::new(Mutex::new(None)),
            last_results: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the scheduling loop: one immediate scrape, then ticks.
    /// Starting an already-running scheduler is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running — start ignored");
            return;
        }
        let _ = self.shutdown_tx.send(false);

        let runner = self.runner.clone();
        let mut interval_rx = self.interval_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let busy = self.busy.clone();
        let run_count = self.run_count.clone();
        let last_run = self.last_run.clone();
        let last_results = self.last_results.clone();

        let handle = tokio::spawn(async move {
            run_once(&runner, &busy, &run_count, &last_run, &last_results).await;

            let mut current = *interval_rx.borrow();
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + current, current);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_once(&runner, &busy, &run_count, &last_run, &last_results).await;
                    }
                    result = interval_rx.changed() => {
                        if result.is_err() {
                            return;
                        }
                        current = *interval_rx.borrow();
                        info!(interval_secs = current.as_secs(), "Scrape interval updated");
                        ticker = tokio::time::interval_at(
                            tokio::time::Instant::now() + current,
                            current,
                        );
                        ticker.set_missed_tick_behavior(
                            tokio::time::MissedTickBehavior::Skip,
                        );
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Scrape scheduler stopping");
                            return;
                        }
                    }
                }
            }
        });

        *self.task.lock().unwrap() = Some(handle);
        info!(
            interval_secs = self.interval_tx.borrow().as_secs(),
            "Scrape scheduler started"
        );
    }

    /// Signal shutdown and wait for the in-flight scrape to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Re-arm the ticker: the next tick fires `interval` from now.
    pub fn update_interval(&self, interval: Duration) {
        let _ = self.interval_tx.send(interval);
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            interval_secs: self.interval_tx.borrow().as_secs(),
            last_run: *self.last_run.lock().unwrap(),
            run_count: self.run_count.load(Ordering::SeqCst),
        }
    }

    pub fn last_results(&self) -> HashMap<String, ScrapeReport> {
        self.last_results.lock().unwrap().clone()
    }
}

async fn run_once(
    runner: &Arc<dyn ScrapeRunner>,
    busy: &Arc<AtomicBool>,
    run_count: &Arc<AtomicU64>,
    last_run: &Arc<Mutex<Option<DateTime<Utc>>>>,
    last_results: &Arc<Mutex<HashMap<String, ScrapeReport>>>,
) {
    // Re-entrancy is forbidden: a tick overlapping a running scrape
    // (e.g. a manually triggered one) is skipped.
    if busy.swap(true, Ordering::SeqCst) {
        info!("Previous scrape still running — tick coalesced");
        return;
    }
    let results = runner.run_all().await;
    *last_results.lock().unwrap() = results;
    *last_run.lock().unwrap() = Some(Utc::now());
    run_count.fetch_add(1, Ordering::SeqCst);
    busy.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingRunner {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl CountingRunner {
        fn new(delay: Duration) -> Self {
            Self {
                runs: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl ScrapeRunner for CountingRunner {
        async fn run_all(&self) -> HashMap<String, ScrapeReport> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            HashMap::new()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initial_scrape_runs_immediately() {
        let runner = Arc::new(CountingRunner::new(Duration::ZERO));
        let scheduler = ScrapeScheduler::new(runner.clone(), Duration::from_secs(600));
        scheduler.start();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_fire_at_the_configured_interval() {
        let runner = Arc::new(CountingRunner::new(Duration::ZERO));
        let scheduler = ScrapeScheduler::new(runner.clone(), Duration::from_secs(60));
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(185)).await;
        // Initial run plus ticks at 60s, 120s, 180s.
        assert_eq!(runner.runs.load(Ordering::SeqCst), 4);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn update_interval_rearms_the_ticker() {
        let runner = Arc::new(CountingRunner::new(Duration::ZERO));
        let scheduler = ScrapeScheduler::new(runner.clone(), Duration::from_secs(3600));
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        scheduler.update_interval(Duration::from_secs(5));
        // Next tick lands within the new cadence, not the old one.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
        // And keeps ticking at the new interval.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_scrape_and_halts_ticks() {
        let runner = Arc::new(CountingRunner::new(Duration::from_secs(2)));
        let scheduler = ScrapeScheduler::new(runner.clone(), Duration::from_secs(30));
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.stop().await;
        let runs_at_stop = runner.runs.load(Ordering::SeqCst);
        assert_eq!(runs_at_stop, 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), runs_at_stop);
        assert!(!scheduler.status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_runs_never_happen() {
        // Scrape takes 90s, interval is 30s: ticks during the run are
        // coalesced instead of stacking.
        let runner = Arc::new(CountingRunner::new(Duration::from_secs(90)));
        let scheduler = ScrapeScheduler::new(runner.clone(), Duration::from_secs(30));
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(runner.runs.load(Ordering::SeqCst) >= 2);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn status_reflects_runs() {
        let runner = Arc::new(CountingRunner::new(Duration::ZERO));
        let scheduler = ScrapeScheduler::new(runner, Duration::from_secs(60));
        assert!(!scheduler.status().running);
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = scheduler.status();
        assert!(status.running);
        assert_eq!(status.run_count, 1);
        assert!(status.last_run.is_some());
        assert_eq!(status.interval_secs, 60);
        scheduler.stop().await;
    }
}
