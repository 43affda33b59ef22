use std::sync::Arc;
use tokio::sync::mpsc;

use super::cache::{CacheOptions, EntryState, ImageCache};
use super::ehentai::{Fetcher, OpenedGallery};
use super::error::NavigationError;
use super::gallery::{DescriptorStore, GalleryContext};
use super::progress::ProgressStore;
use super::scheduler::{NavigationScheduler, ReaderEvent, SchedulerSnapshot};
use crate::config::ReaderConfig;

/// One open gallery: its pages, their images and the navigation over them.
pub struct ReaderSession {
    context: Arc<GalleryContext>,
    cache: ImageCache,
    scheduler: NavigationScheduler,
    events: mpsc::UnboundedReceiver<ReaderEvent>,
    progress: Option<ProgressStore>,
    start_page: usize,
}

impl ReaderSession {
    /// Builds the session and asks for the first page right away.
    ///
    /// An explicit `requested_start` wins over the remembered page, which
    /// wins over page 1. Out-of-range values are ignored.
    pub fn start(
        opened: OpenedGallery,
        fetcher: Arc<dyn Fetcher>,
        config: &ReaderConfig,
        progress: Option<ProgressStore>,
        requested_start: Option<usize>,
    ) -> Self {
        let context = Arc::new(opened.context);
        let total_pages = context.total_pages;

        let store = DescriptorStore::new(opened.descriptors);
        if store.page_count() < total_pages {
            log::warn!(
                "gallery {} describes only {} of {} pages; later pages cannot load",
                context.gallery_id,
                store.page_count(),
                total_pages
            );
        }

        let cache = ImageCache::new(
            Arc::clone(&context),
            store,
            fetcher,
            opened.enricher,
            CacheOptions {
                image_timeout: config.image_timeout(),
                max_entries: config.max_cached_pages,
            },
        );

        let (event_tx, events) = mpsc::unbounded_channel();
        let scheduler =
            NavigationScheduler::spawn(cache.clone(), total_pages, config.debounce(), event_tx);

        let remembered = progress
            .as_ref()
            .and_then(|store| store.load(&context.gallery_id));
        let start_page = choose_start_page(total_pages, requested_start, remembered);
        log::info!(
            "reading gallery {} from page {} of {}",
            context.gallery_id,
            start_page,
            total_pages
        );
        if let Err(e) = scheduler.navigate(start_page) {
            log::error!("could not open page {}: {}", start_page, e);
        }

        Self {
            context,
            cache,
            scheduler,
            events,
            progress,
            start_page,
        }
    }

    pub fn context(&self) -> &GalleryContext {
        &self.context
    }

    pub fn start_page(&self) -> usize {
        self.start_page
    }

    pub fn navigate(&self, page: usize) -> Result<(), NavigationError> {
        self.scheduler.navigate(page)
    }

    /// Forgets a failed page and asks for it again.
    pub async fn retry(&self, page: usize) -> Result<(), NavigationError> {
        if page == 0 || page > self.context.total_pages {
            return Err(NavigationError::OutOfRange {
                page,
                total: self.context.total_pages,
            });
        }
        // A page still loading or already shown is simply navigated to.
        if let EntryState::Failed(reason) = self.cache.state(page - 1).await {
            log::info!("retrying page {} after {}", page, reason.label());
            self.cache.invalidate(page - 1).await;
        }
        self.scheduler.navigate(page)
    }

    /// Next event for the screen. Successful pages are remembered as the
    /// reading position.
    pub async fn next_event(&mut self) -> Option<ReaderEvent> {
        let event = self.events.recv().await?;
        if let ReaderEvent::PageReady { page, .. } = &event {
            if let Some(progress) = self.progress.as_mut() {
                progress.save(&self.context.gallery_id, *page);
            }
        }
        Some(event)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.scheduler.snapshot()
    }

    pub fn shutdown(self) {
        let snapshot = self.scheduler.snapshot();
        let stats = snapshot.stats;
        log::info!(
            "closing gallery {} on page {}: {} intents, {} loads, {} repeats, {} stale results dropped",
            self.context.gallery_id,
            snapshot
                .displayed_page
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            stats.intents,
            stats.resolutions,
            stats.short_circuits,
            stats.stale_discarded
        );
        self.scheduler.shutdown();
    }
}

fn choose_start_page(total: usize, requested: Option<usize>, remembered: Option<usize>) -> usize {
    let in_range = |page: &usize| (1..=total).contains(page);
    requested
        .filter(in_range)
        .or(remembered.filter(in_range))
        .unwrap_or(1)
}
