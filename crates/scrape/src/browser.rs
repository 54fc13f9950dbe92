//! Bounded pool of headless-browser sessions.
//!
//! The pool is a channel of live sessions: acquisition is a bounded
//! `recv` with timeout, release pushes the session back. Sessions carry
//! a usage counter and are recycled past a threshold. A [`SessionGuard`]
//! consumed by `release` makes double-release unrepresentable; its
//! `Drop` impl returns the session on panic or early-return paths.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nieuws_core::Error;

/// Creates and tears down pooled sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + 'static;

    async fn create(&self) -> Result<Self::Session, Error>;

    async fn destroy(&self, session: Self::Session);
}

struct Entry<S> {
    session: S,
    uses: u32,
}

pub struct SessionPool<F: SessionFactory> {
    factory: Arc<F>,
    tx: mpsc::Sender<Entry<F::Session>>,
    rx: Mutex<mpsc::Receiver<Entry<F::Session>>>,
    max_uses: u32,
}

impl<F: SessionFactory> SessionPool<F> {
    /// Open `size` sessions up front.
    pub async fn new(factory: Arc<F>, size: usize, max_uses: u32) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel(size.max(1));
        for _ in 0..size.max(1) {
            let session = factory.create().await?;
            tx.send(Entry { session, uses: 0 })
                .await
                .map_err(|_| Error::ResourceExhausted("session pool channel closed".into()))?;
        }
        Ok(Self {
            factory,
            tx,
            rx: Mutex::new(rx),
            max_uses: max_uses.max(1),
        })
    }

    /// Receive a session or give up after `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<SessionGuard<F>, Error> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(entry)) => Ok(SessionGuard {
                entry: Some(entry),
                tx: self.tx.clone(),
                factory: self.factory.clone(),
                max_uses: self.max_uses,
            }),
            Ok(None) => Err(Error::ResourceExhausted("session pool closed".into())),
            Err(_) => Err(Error::ResourceExhausted("session pool acquire timed out".into())),
        }
    }

    /// Drain and destroy every pooled session.
    pub async fn shutdown(&self) {
        let mut rx = self.rx.lock().await;
        while let Ok(entry) = rx.try_recv() {
            self.factory.destroy(entry.session).await;
        }
    }
}

/// A borrowed session. Release it exactly once via [`release`] or
/// [`discard`]; dropping it (a panic unwinding, an early `?`) returns
/// the session to the pool untouched.
///
/// [`release`]: SessionGuard::release
/// [`discard`]: SessionGuard::discard
pub struct SessionGuard<F: SessionFactory> {
    entry: Option<Entry<F::Session>>,
    tx: mpsc::Sender<Entry<F::Session>>,
    factory: Arc<F>,
    max_uses: u32,
}

impl<F: SessionFactory> std::fmt::Debug for SessionGuard<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard").finish_non_exhaustive()
    }
}

impl<F: SessionFactory> SessionGuard<F> {
    pub fn session(&mut self) -> &mut F::Session {
        // Entry is only None after release/discard, which consume self.
        &mut self.entry.as_mut().expect("session already released").session
    }

    /// Return the session after successful use. Sessions past the usage
    /// threshold are recycled into a fresh one.
    pub async fn release(mut self) {
        let Some(mut entry) = self.entry.take() else { return };
        entry.uses += 1;
        if entry.uses >= self.max_uses {
            debug!(uses = entry.uses, "Recycling pooled session");
            self.factory.destroy(entry.session).await;
            match self.factory.create().await {
                Ok(session) => {
                    let _ = self.tx.send(Entry { session, uses: 0 }).await;
                }
                Err(e) => {
                    // Keep pool capacity: retry creation once, then give
                    // the slot up with a loud warning.
                    warn!(error = %e, "Session recycle failed — retrying once");
                    match self.factory.create().await {
                        Ok(session) => {
                            let _ = self.tx.send(Entry { session, uses: 0 }).await;
                        }
                        Err(e) => warn!(error = %e, "Session slot lost"),
                    }
                }
            }
        } else {
            let _ = self.tx.send(entry).await;
        }
    }

    /// Destroy the session (after a render failure or timeout) and
    /// replace it with a fresh one.
    pub async fn discard(mut self) {
        let Some(entry) = self.entry.take() else { return };
        self.factory.destroy(entry.session).await;
        match self.factory.create().await {
            Ok(session) => {
                let _ = self.tx.send(Entry { session, uses: 0 }).await;
            }
            Err(e) => warn!(error = %e, "Could not replace discarded session"),
        }
    }
}

impl<F: SessionFactory> Drop for SessionGuard<F> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            // Unclean exit path: put the session back without counting
            // the use. try_send cannot fail on capacity — we hold the
            // slot we took.
            if self.tx.try_send(entry).is_err() {
                warn!("Session pool closed during guard drop — session leaked");
            }
        }
    }
}

// ── Chromium-backed pool ──────────────────────────────────────

pub struct ChromeSessionFactory {
    browser: Mutex<Browser>,
}

pub struct ChromeSession {
    pub page: Page,
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    type Session = ChromeSession;

    async fn create(&self) -> Result<ChromeSession, Error> {
        let browser = self.browser.lock().await;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| Error::Transient(format!("browser page open: {e}")))?;
        Ok(ChromeSession { page })
    }

    async fn destroy(&self, session: ChromeSession) {
        if let Err(e) = session.page.close().await {
            debug!(error = %e, "Page close failed during recycle");
        }
    }
}

/// The browser pool: one underlying launcher, N pooled pages.
pub struct BrowserPool {
    pool: SessionPool<ChromeSessionFactory>,
    factory: Arc<ChromeSessionFactory>,
    handler_task: JoinHandle<()>,
    timeout: Duration,
    settle: Duration,
}

impl BrowserPool {
    /// Launch the browser and open the pooled pages.
    pub async fn launch(
        pool_size: usize,
        max_session_uses: u32,
        timeout: Duration,
        settle: Duration,
    ) -> Result<Self, Error> {
        let config = BrowserConfig::builder()
            .build()
            .map_err(|e| Error::Transient(format!("browser config: {e}")))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| Error::Transient(format!("browser launch: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "Browser handler event error");
                }
            }
        });

        let factory = Arc::new(ChromeSessionFactory { browser: Mutex::new(browser) });
        let pool = SessionPool::new(factory.clone(), pool_size, max_session_uses).await?;
        info!(pool_size, "Browser pool ready");

        Ok(Self { pool, factory, handler_task, timeout, settle })
    }

    /// Render a page and return the settled DOM as HTML. A timeout or
    /// render failure discards the session and retries once against a
    /// fresh one.
    pub async fn render(&self, url: &str) -> Result<String, Error> {
        match self.render_once(url).await {
            Ok(html) => Ok(html),
            Err(err) if err.is_retryable() => {
                debug!(url, error = %err, "Render failed — retrying with fresh session");
                self.render_once(url).await
            }
            Err(err) => Err(err),
        }
    }

    async fn render_once(&self, url: &str) -> Result<String, Error> {
        let mut guard = self.pool.acquire(self.timeout).await?;

        let budget = self.timeout + self.settle;
        let attempt = tokio::time::timeout(budget, async {
            let page = &guard.session().page;
            page.goto(url)
                .await
                .map_err(|e| Error::Transient(format!("page goto: {e}")))?;
            if let Err(e) = page.wait_for_navigation().await {
                debug!(url, error = %e, "Navigation wait ended early");
            }
            tokio::time::sleep(self.settle).await;
            page.content()
                .await
                .map_err(|e| Error::Transient(format!("page content: {e}")))
        })
        .await;

        match attempt {
            Ok(Ok(html)) => {
                guard.release().await;
                Ok(html)
            }
            Ok(Err(err)) => {
                guard.discard().await;
                Err(err)
            }
            Err(_) => {
                guard.discard().await;
                Err(Error::Transient(format!("page render timed out: {url}")))
            }
        }
    }

    /// Close every page and the underlying browser process.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        {
            let mut browser = self.factory.browser.lock().await;
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Browser close failed");
            }
        }
        self.handler_task.abort();
        info!("Browser pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeFactory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl FakeFactory {
        fn new() -> Self {
            Self { created: AtomicUsize::new(0), destroyed: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        type Session = usize;

        async fn create(&self) -> Result<usize, Error> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _session: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn acquire_release_roundtrip() {
        let factory = Arc::new(FakeFactory::new());
        let pool = SessionPool::new(factory.clone(), 2, 100).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        let guard = pool.acquire(Duration::from_millis(100)).await.unwrap();
        guard.release().await;

        // Session came back: acquiring twice still works.
        let a = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(100)).await.unwrap();
        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_is_drained() {
        let factory = Arc::new(FakeFactory::new());
        let pool = SessionPool::new(factory, 1, 100).await.unwrap();

        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        held.release().await;
    }

    #[tokio::test]
    async fn sessions_recycle_past_max_uses() {
        let factory = Arc::new(FakeFactory::new());
        let pool = SessionPool::new(factory.clone(), 1, 2).await.unwrap();

        for _ in 0..2 {
            let guard = pool.acquire(Duration::from_millis(100)).await.unwrap();
            guard.release().await;
        }
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        // The fresh session is usable.
        let guard = pool.acquire(Duration::from_millis(100)).await.unwrap();
        guard.release().await;
    }

    #[tokio::test]
    async fn dropped_guard_returns_session_without_counting_a_use() {
        let factory = Arc::new(FakeFactory::new());
        let pool = SessionPool::new(factory.clone(), 1, 2).await.unwrap();

        for _ in 0..5 {
            let guard = pool.acquire(Duration::from_millis(100)).await.unwrap();
            drop(guard);
        }
        // No recycles happened: drops do not count toward max_uses.
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 0);

        let guard = pool.acquire(Duration::from_millis(100)).await.unwrap();
        guard.discard().await;
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }
}
