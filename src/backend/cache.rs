use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use image::DynamicImage;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::ehentai::{Fetcher, KeyEnricher, Resolver};
use super::error::ErrorKind;
use super::gallery::{DescriptorStore, GalleryContext, PageDescriptor};

/// A decoded page image. Clones share the same pixels.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    pub url: String,
    pub image: Arc<DynamicImage>,
}

impl ImageHandle {
    #[cfg(test)]
    pub fn same_image(&self, other: &ImageHandle) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

pub type PendingImage = Shared<BoxFuture<'static, Result<ImageHandle, ErrorKind>>>;

enum CacheEntry {
    Loading(PendingImage),
    Loaded(ImageHandle),
    Failed(ErrorKind),
}

/// Observable state of one page in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    NotStarted,
    Loading,
    Loaded,
    Failed(ErrorKind),
}

/// Page images by index, with at most one load in flight per index.
///
/// Loads run on their own task, so a load whose waiters have all gone away
/// still finishes and fills the cache.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<RwLock<ImageCacheInner>>,
    loader: Arc<PageLoader>,
}

struct ImageCacheInner {
    entries: HashMap<usize, CacheEntry>,
    access_order: Vec<usize>,
    max_entries: Option<usize>,
}

/// Descriptor → URL → bytes → image.
struct PageLoader {
    resolver: Resolver,
    fetcher: Arc<dyn Fetcher>,
    enricher: Option<Arc<dyn KeyEnricher>>,
    store: DescriptorStore,
    context: Arc<GalleryContext>,
    image_timeout: Duration,
}

pub struct CacheOptions {
    pub image_timeout: Duration,
    pub max_entries: Option<usize>,
}

impl ImageCache {
    pub fn new(
        context: Arc<GalleryContext>,
        store: DescriptorStore,
        fetcher: Arc<dyn Fetcher>,
        enricher: Option<Arc<dyn KeyEnricher>>,
        options: CacheOptions,
    ) -> Self {
        let loader = PageLoader {
            resolver: Resolver::new(Arc::clone(&fetcher)),
            fetcher,
            enricher,
            store,
            context,
            image_timeout: options.image_timeout,
        };

        Self {
            inner: Arc::new(RwLock::new(ImageCacheInner {
                entries: HashMap::new(),
                access_order: Vec::new(),
                max_entries: options.max_entries.map(|n| n.max(1)),
            })),
            loader: Arc::new(loader),
        }
    }

    /// Returns the image for a 0-based page index, loading it if needed.
    ///
    /// A caller arriving while the page is loading waits on the same load.
    /// A failed page is loaded again.
    pub async fn get(&self, index: usize) -> Result<ImageHandle, ErrorKind> {
        let pending = {
            let mut inner = self.inner.write().await;
            match inner.entries.get(&index) {
                Some(CacheEntry::Loaded(handle)) => {
                    let handle = handle.clone();
                    inner.touch(index);
                    return Ok(handle);
                }
                Some(CacheEntry::Loading(pending)) => pending.clone(),
                Some(CacheEntry::Failed(_)) | None => self.start_load(&mut inner, index),
            }
        };

        pending.await
    }

    /// True once the page has a decoded image.
    pub async fn has(&self, index: usize) -> bool {
        let inner = self.inner.read().await;
        matches!(inner.entries.get(&index), Some(CacheEntry::Loaded(_)))
    }

    /// Drops a finished page so the next `get` loads it again. A page that
    /// is still loading is left alone; its result is coming anyway.
    pub async fn invalidate(&self, index: usize) {
        let mut inner = self.inner.write().await;
        if let Some(CacheEntry::Loading(_)) = inner.entries.get(&index) {
            log::debug!("page {} is loading, not invalidated", index + 1);
            return;
        }
        inner.entries.remove(&index);
        inner.access_order.retain(|&i| i != index);
    }

    pub async fn state(&self, index: usize) -> EntryState {
        let inner = self.inner.read().await;
        match inner.entries.get(&index) {
            None => EntryState::NotStarted,
            Some(CacheEntry::Loading(_)) => EntryState::Loading,
            Some(CacheEntry::Loaded(_)) => EntryState::Loaded,
            Some(CacheEntry::Failed(reason)) => EntryState::Failed(reason.clone()),
        }
    }

    fn start_load(&self, inner: &mut ImageCacheInner, index: usize) -> PendingImage {
        let loader = Arc::clone(&self.loader);
        let cache = Arc::clone(&self.inner);
        let orphaned = Arc::clone(&self.inner);
        // The write lock held by our caller keeps the task from settling
        // before the Loading entry below is in place.
        let task = tokio::spawn(async move {
            let result = loader.load(index).await;
            cache.write().await.settle(index, &result);
            result
        });

        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    log::error!("load task for page {} died: {}", index + 1, e);
                    let reason = ErrorKind::Internal(format!("load task failed: {}", e));
                    orphaned.write().await.settle(index, &Err(reason.clone()));
                    Err(reason)
                }
            }
        }
        .boxed()
        .shared();

        inner
            .entries
            .insert(index, CacheEntry::Loading(pending.clone()));
        pending
    }
}

impl ImageCacheInner {
    /// Moves a loading page to its final state.
    fn settle(&mut self, index: usize, result: &Result<ImageHandle, ErrorKind>) {
        if !matches!(self.entries.get(&index), Some(CacheEntry::Loading(_))) {
            return;
        }

        let entry = match result {
            Ok(handle) => CacheEntry::Loaded(handle.clone()),
            Err(reason) => CacheEntry::Failed(reason.clone()),
        };
        self.entries.insert(index, entry);
        self.touch(index);
        self.evict();
    }

    fn touch(&mut self, index: usize) {
        self.access_order.retain(|&i| i != index);
        self.access_order.push(index);
    }

    /// Oldest finished entries go first. Loads in flight are never evicted.
    fn evict(&mut self) {
        let Some(max) = self.max_entries else {
            return;
        };

        while self.access_order.len() > max {
            let oldest = self.access_order.remove(0);
            if let Some(CacheEntry::Loading(_)) = self.entries.get(&oldest) {
                continue;
            }
            self.entries.remove(&oldest);
            log::debug!("evicted page {} from cache", oldest + 1);
        }
    }
}

impl PageLoader {
    async fn load(&self, index: usize) -> Result<ImageHandle, ErrorKind> {
        let descriptor = self
            .store
            .get(index)
            .await
            .ok_or(ErrorKind::MissingKey)?;

        let url = match self.resolver.resolve(&descriptor, &self.context).await {
            Err(ErrorKind::MissingKey) => self.resolve_enriched(descriptor).await?,
            other => other?,
        };

        let bytes = tokio::time::timeout(self.image_timeout, self.fetcher.fetch_bytes(&url))
            .await
            .map_err(|_| {
                log::warn!("page {} image timed out: {}", index + 1, url);
                ErrorKind::Timeout
            })??;

        let image = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ErrorKind::Decode(e.to_string()))?
            .decode()?;

        log::debug!(
            "page {} loaded ({}x{})",
            index + 1,
            image.width(),
            image.height()
        );
        Ok(ImageHandle {
            url,
            image: Arc::new(image),
        })
    }

    async fn resolve_enriched(&self, descriptor: PageDescriptor) -> Result<String, ErrorKind> {
        let Some(enricher) = &self.enricher else {
            return Err(ErrorKind::MissingKey);
        };

        let key = enricher.fetch_key_for_page(descriptor.index).await?;
        self.store.set_key(descriptor.index, key.clone()).await;

        let enriched = PageDescriptor {
            key: Some(key),
            ..descriptor
        };
        self.resolver.resolve(&enriched, &self.context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::{
        FakeFetcher, Reply, context, descriptors, image_url, page_doc, page_doc_url,
        serve_gallery,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache_for(fetcher: Arc<FakeFetcher>, total: usize, max_entries: Option<usize>) -> ImageCache {
        ImageCache::new(
            Arc::new(context(total)),
            DescriptorStore::new(descriptors(total)),
            fetcher,
            None,
            CacheOptions {
                image_timeout: Duration::from_secs(30),
                max_entries,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_gets_share_one_fetch() {
        let fetcher = FakeFetcher::new();
        serve_gallery(&fetcher, 5, Duration::from_millis(200));
        let cache = cache_for(fetcher.clone(), 5, None);

        let (a, b) = tokio::join!(cache.get(2), cache.get(2));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.same_image(&b));
        assert_eq!(a.url, image_url(3));
        assert_eq!(fetcher.calls(&page_doc_url(3)), 1);
        assert_eq!(fetcher.calls(&image_url(3)), 1);
    }

    #[tokio::test]
    async fn test_loaded_get_is_idempotent() {
        let fetcher = FakeFetcher::new();
        serve_gallery(&fetcher, 3, Duration::ZERO);
        let cache = cache_for(fetcher.clone(), 3, None);

        assert_eq!(cache.state(0).await, EntryState::NotStarted);
        let first = cache.get(0).await.unwrap();
        assert!(cache.has(0).await);
        let again = cache.get(0).await.unwrap();

        assert!(first.same_image(&again));
        assert_eq!(fetcher.total_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_reports_loading_while_in_flight() {
        let fetcher = FakeFetcher::new();
        serve_gallery(&fetcher, 3, Duration::from_secs(1));
        let cache = cache_for(fetcher.clone(), 3, None);

        let background = cache.clone();
        let task = tokio::spawn(async move { background.get(1).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(cache.state(1).await, EntryState::Loading);
        assert!(!cache.has(1).await);
        task.await.unwrap().unwrap();
        assert_eq!(cache.state(1).await, EntryState::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_timeout_fails_entry() {
        let fetcher = FakeFetcher::new();
        fetcher.route(&page_doc_url(1), Reply::Text(page_doc(1)));
        fetcher.route(&image_url(1), Reply::Hang);
        let cache = cache_for(fetcher.clone(), 1, None);

        let started = tokio::time::Instant::now();
        let result = cache.get(0).await;

        assert_eq!(result.unwrap_err(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(cache.state(0).await, EntryState::Failed(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_http_error_leaves_failed_entry() {
        let fetcher = FakeFetcher::new();
        fetcher.route(&page_doc_url(1), Reply::Status(404));
        let cache = cache_for(fetcher.clone(), 1, None);

        let result = cache.get(0).await;
        assert!(matches!(result, Err(ErrorKind::Network(_))));
        assert!(matches!(
            cache.state(0).await,
            EntryState::Failed(ErrorKind::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_undecodable_bytes() {
        let fetcher = FakeFetcher::new();
        fetcher.route(&page_doc_url(1), Reply::Text(page_doc(1)));
        fetcher.route(&image_url(1), Reply::Bytes(b"<html>not an image</html>".to_vec()));
        let cache = cache_for(fetcher.clone(), 1, None);

        assert!(matches!(cache.get(0).await, Err(ErrorKind::Decode(_))));
    }

    #[tokio::test]
    async fn test_invalidate_allows_retry() {
        let fetcher = FakeFetcher::new();
        fetcher.route(&page_doc_url(1), Reply::Status(503));
        let cache = cache_for(fetcher.clone(), 1, None);
        assert!(cache.get(0).await.is_err());

        cache.invalidate(0).await;
        assert_eq!(cache.state(0).await, EntryState::NotStarted);

        serve_gallery(&fetcher, 1, Duration::ZERO);
        assert!(cache.get(0).await.is_ok());
        assert_eq!(fetcher.calls(&page_doc_url(1)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_keeps_load_in_flight() {
        let fetcher = FakeFetcher::new();
        serve_gallery(&fetcher, 1, Duration::from_secs(1));
        let cache = cache_for(fetcher.clone(), 1, None);

        let background = cache.clone();
        let first = tokio::spawn(async move { background.get(0).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        cache.invalidate(0).await;
        assert_eq!(cache.state(0).await, EntryState::Loading);

        // A caller arriving now joins the running load.
        let second = cache.get(0).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert!(first.same_image(&second));
        assert_eq!(fetcher.calls(&page_doc_url(1)), 1);
        assert_eq!(fetcher.calls(&image_url(1)), 1);
        assert_eq!(cache.state(0).await, EntryState::Loaded);
    }

    struct PanickingFetcher;

    #[async_trait]
    impl Fetcher for PanickingFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, ErrorKind> {
            panic!("fetcher blew up on {}", url);
        }

        async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ErrorKind> {
            panic!("fetcher blew up on {}", url);
        }
    }

    #[tokio::test]
    async fn test_dead_load_task_is_an_internal_failure() {
        let cache = ImageCache::new(
            Arc::new(context(1)),
            DescriptorStore::new(descriptors(1)),
            Arc::new(PanickingFetcher),
            None,
            CacheOptions {
                image_timeout: Duration::from_secs(30),
                max_entries: None,
            },
        );

        let result = cache.get(0).await;
        assert!(matches!(result, Err(ErrorKind::Internal(_))));
        assert!(matches!(
            cache.state(0).await,
            EntryState::Failed(ErrorKind::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_bounded_cache_evicts_least_recent() {
        let fetcher = FakeFetcher::new();
        serve_gallery(&fetcher, 4, Duration::ZERO);
        let cache = cache_for(fetcher.clone(), 4, Some(2));

        cache.get(0).await.unwrap();
        cache.get(1).await.unwrap();
        cache.get(0).await.unwrap();
        cache.get(2).await.unwrap();

        assert!(cache.has(0).await);
        assert!(!cache.has(1).await);
        assert!(cache.has(2).await);
    }

    #[tokio::test]
    async fn test_missing_key_without_enricher() {
        let fetcher = FakeFetcher::new();
        let cache = ImageCache::new(
            Arc::new(context(1)),
            DescriptorStore::new(vec![PageDescriptor::keyless(0)]),
            fetcher.clone(),
            None,
            CacheOptions {
                image_timeout: Duration::from_secs(30),
                max_entries: None,
            },
        );

        assert_eq!(cache.get(0).await.unwrap_err(), ErrorKind::MissingKey);
        assert_eq!(fetcher.total_calls(), 0);
    }

    struct CountingEnricher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl KeyEnricher for CountingEnricher {
        async fn fetch_key_for_page(&self, index: usize) -> Result<String, ErrorKind> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("key{}", index + 1))
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_enriched_and_stored() {
        let fetcher = FakeFetcher::new();
        serve_gallery(&fetcher, 2, Duration::ZERO);
        let store = DescriptorStore::new(vec![PageDescriptor::keyless(0), PageDescriptor::keyless(1)]);
        let enricher = Arc::new(CountingEnricher {
            calls: AtomicUsize::new(0),
        });
        let cache = ImageCache::new(
            Arc::new(context(2)),
            store.clone(),
            fetcher.clone(),
            Some(enricher.clone()),
            CacheOptions {
                image_timeout: Duration::from_secs(30),
                max_entries: None,
            },
        );

        let handle = cache.get(1).await.unwrap();
        assert_eq!(handle.url, image_url(2));
        assert_eq!(store.get(1).await.unwrap().key.as_deref(), Some("key2"));
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);
    }
}
