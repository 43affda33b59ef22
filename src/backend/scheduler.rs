use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use super::cache::{ImageCache, ImageHandle};
use super::error::{ErrorKind, NavigationError};

/// What the reader reports back to the screen. Pages are 1-based.
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    PageReady { page: usize, image: ImageHandle },
    PageLoadFailed { page: usize, reason: ErrorKind },
    /// Informational only.
    PreloadFailed { page: usize, reason: ErrorKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationIntent {
    pub target_page: usize,
    pub issued_at_token: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    #[default]
    Idle,
    Debouncing(usize),
    Resolving {
        page: usize,
        token: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    pub intents: u64,
    pub resolutions: u64,
    pub short_circuits: u64,
    pub stale_discarded: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerSnapshot {
    pub state: SchedulerState,
    pub stats: SchedulerStats,
    pub displayed_page: Option<usize>,
}

/// Turns navigation intents into page loads.
///
/// Bursts of intents inside the debounce window collapse into the last one.
/// Every load that actually starts takes a fresh token, and a result is only
/// reported while its token is still the newest, so a slow old page can never
/// replace a newer one on screen.
pub struct NavigationScheduler {
    intents: mpsc::UnboundedSender<NavigationIntent>,
    token: Arc<AtomicU64>,
    snapshot: watch::Receiver<SchedulerSnapshot>,
    total_pages: usize,
    task: JoinHandle<()>,
}

impl NavigationScheduler {
    pub fn spawn(
        cache: ImageCache,
        total_pages: usize,
        debounce: Duration,
        events: mpsc::UnboundedSender<ReaderEvent>,
    ) -> Self {
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SchedulerSnapshot::default());
        let token = Arc::new(AtomicU64::new(0));

        let actor = SchedulerActor {
            cache,
            total_pages,
            debounce,
            token: Arc::clone(&token),
            events,
            settled_tx,
            snapshot: snapshot_tx,
            state: SchedulerState::Idle,
            stats: SchedulerStats::default(),
            displayed: None,
            deadline: None,
        };
        let task = tokio::spawn(actor.run(intent_rx, settled_rx));

        Self {
            intents: intent_tx,
            token,
            snapshot: snapshot_rx,
            total_pages,
            task,
        }
    }

    /// Asks for a 1-based page. Pages outside the gallery are rejected here
    /// and never reach the scheduler.
    pub fn navigate(&self, page: usize) -> Result<(), NavigationError> {
        if page == 0 || page > self.total_pages {
            return Err(NavigationError::OutOfRange {
                page,
                total: self.total_pages,
            });
        }

        let intent = NavigationIntent {
            target_page: page,
            issued_at_token: self.token(),
        };
        self.intents
            .send(intent)
            .map_err(|_| NavigationError::SessionClosed)
    }

    pub fn token(&self) -> u64 {
        self.token.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        *self.snapshot.borrow()
    }

    #[cfg(test)]
    pub fn state(&self) -> SchedulerState {
        self.snapshot().state
    }

    #[cfg(test)]
    pub fn stats(&self) -> SchedulerStats {
        self.snapshot().stats
    }

    /// Stops accepting intents. Loads already running still finish and fill
    /// the cache, but nothing more is reported.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

struct Settled {
    page: usize,
    token: u64,
    result: Result<ImageHandle, ErrorKind>,
}

struct SchedulerActor {
    cache: ImageCache,
    total_pages: usize,
    debounce: Duration,
    token: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<ReaderEvent>,
    settled_tx: mpsc::UnboundedSender<Settled>,
    snapshot: watch::Sender<SchedulerSnapshot>,
    state: SchedulerState,
    stats: SchedulerStats,
    displayed: Option<usize>,
    deadline: Option<Instant>,
}

impl SchedulerActor {
    async fn run(
        mut self,
        mut intents: mpsc::UnboundedReceiver<NavigationIntent>,
        mut settled: mpsc::UnboundedReceiver<Settled>,
    ) {
        loop {
            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => self.accept(intent),
                    None => break,
                },
                Some(done) = settled.recv() => self.settle(done),
                _ = timer => self.fire(),
            }

            self.publish();
        }
        log::debug!("navigation scheduler stopped");
    }

    fn accept(&mut self, intent: NavigationIntent) {
        self.stats.intents += 1;
        log::debug!(
            "intent for page {} (token {})",
            intent.target_page,
            intent.issued_at_token
        );
        self.state = SchedulerState::Debouncing(intent.target_page);
        self.deadline = Some(Instant::now() + self.debounce);
    }

    fn fire(&mut self) {
        self.deadline = None;
        let SchedulerState::Debouncing(page) = self.state else {
            return;
        };

        let token = self.token.fetch_add(1, Ordering::SeqCst) + 1;
        if self.displayed == Some(page) {
            self.stats.short_circuits += 1;
            self.state = SchedulerState::Idle;
            return;
        }

        self.stats.resolutions += 1;
        self.state = SchedulerState::Resolving { page, token };
        log::debug!("loading page {} with token {}", page, token);

        let cache = self.cache.clone();
        let settled = self.settled_tx.clone();
        tokio::spawn(async move {
            let result = cache.get(page - 1).await;
            let _ = settled.send(Settled {
                page,
                token,
                result,
            });
        });
    }

    fn settle(&mut self, done: Settled) {
        let current = self.token.load(Ordering::SeqCst);
        if done.token != current {
            self.stats.stale_discarded += 1;
            log::debug!(
                "page {} with token {} discarded ({}, now {})",
                done.page,
                done.token,
                ErrorKind::Cancelled,
                current
            );
            return;
        }

        if self.state == (SchedulerState::Resolving { page: done.page, token: done.token }) {
            self.state = SchedulerState::Idle;
        }

        match done.result {
            Ok(image) => {
                self.displayed = Some(done.page);
                self.emit(ReaderEvent::PageReady {
                    page: done.page,
                    image,
                });
                self.prefetch_neighbors(done.page);
            }
            Err(reason) => {
                log::error!("page {} failed to load: {}", done.page, reason);
                self.displayed = None;
                self.emit(ReaderEvent::PageLoadFailed {
                    page: done.page,
                    reason,
                });
            }
        }
    }

    fn prefetch_neighbors(&self, page: usize) {
        for neighbor in [page - 1, page + 1] {
            if neighbor < 1 || neighbor > self.total_pages {
                continue;
            }

            let cache = self.cache.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                if cache.has(neighbor - 1).await {
                    return;
                }
                if let Err(reason) = cache.get(neighbor - 1).await {
                    log::warn!("preload of page {} failed: {}", neighbor, reason);
                    let _ = events.send(ReaderEvent::PreloadFailed {
                        page: neighbor,
                        reason,
                    });
                }
            });
        }
    }

    fn emit(&self, event: ReaderEvent) {
        // A closed receiver means the screen is gone; nothing to report to.
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(SchedulerSnapshot {
            state: self.state,
            stats: self.stats,
            displayed_page: self.displayed,
        });
    }
}
