use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use tokio::sync::{Mutex, OnceCell};

use super::error::ErrorKind;
use super::gallery::{
    GalleryContext, PageDescriptor, is_gallery_url, parse_gallery_listing, parse_mpv_document,
    parse_page_links,
};
use crate::config::ReaderConfig;

static IMG_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<img[^>]+id="img"[^>]+src="([^"]+)""#).expect("img tag regex should compile")
});
static SRC_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)src="(https?://[^"]+\.(?:jpg|jpeg|png|gif|webp)[^"]*)""#)
        .expect("src attribute regex should compile")
});
static BARE_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(https?://[^\s"'<>]+\.(?:jpg|jpeg|png|gif|webp))"#)
        .expect("bare url regex should compile")
});
static DIMENSIONS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)-(\d{2,5})-(\d{2,5})-(?:jpg|jpeg|png|gif|webp)")
        .expect("dimensions regex should compile")
});

/// Raw HTTP access. Everything that touches the network goes through here.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String, ErrorKind>;
    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ErrorKind>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &ReaderConfig) -> Result<Self, ErrorKind> {
        Ok(Self {
            client: build_client(config)?,
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ErrorKind> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ErrorKind::Network(format!("HTTP {} for {}", status, url)));
        }
        Ok(response)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, ErrorKind> {
        let response = self.get(url).await?;
        Ok(response.text().await?)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ErrorKind> {
        let response = self.get(url).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn build_client(config: &ReaderConfig) -> Result<reqwest::Client, ErrorKind> {
    let mut headers = HeaderMap::new();
    if let Some(cookie) = config.cookie.as_deref() {
        let value = HeaderValue::from_str(cookie)
            .map_err(|e| ErrorKind::Network(format!("invalid cookie header: {}", e)))?;
        headers.insert(COOKIE, value);
    }

    reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .default_headers(headers)
        .build()
        .map_err(|e| ErrorKind::Network(format!("failed to build HTTP client: {}", e)))
}

/// Turns a page descriptor into the URL of its full-size image.
#[derive(Clone)]
pub struct Resolver {
    fetcher: Arc<dyn Fetcher>,
}

impl Resolver {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    /// `{base}/s/{key}/{gid}-{page}` with a 1-based page number.
    pub fn intermediate_url(
        descriptor: &PageDescriptor,
        context: &GalleryContext,
    ) -> Result<String, ErrorKind> {
        let key = descriptor.key.as_deref().ok_or(ErrorKind::MissingKey)?;
        Ok(format!(
            "{}/s/{}/{}-{}",
            context.base_url.trim_end_matches('/'),
            key,
            context.gallery_id,
            descriptor.index + 1
        ))
    }

    pub async fn resolve(
        &self,
        descriptor: &PageDescriptor,
        context: &GalleryContext,
    ) -> Result<String, ErrorKind> {
        let page_url = Self::intermediate_url(descriptor, context)?;
        log::debug!("fetching image page {}", page_url);

        let html = self.fetcher.fetch_text(&page_url).await?;
        extract_image_url(&html).ok_or_else(|| {
            log::warn!(
                "no image URL in {} ({} bytes of HTML)",
                page_url,
                html.len()
            );
            ErrorKind::Parse(format!("no image URL in {}", page_url))
        })
    }
}

/// Finds the full-size image URL in an image page, most precise pattern
/// first.
pub fn extract_image_url(html: &str) -> Option<String> {
    [&*IMG_TAG_RE, &*SRC_ATTR_RE, &*BARE_URL_RE]
        .iter()
        .find_map(|re| re.captures(html).and_then(|c| c.get(1)))
        .map(|m| m.as_str().replace("&amp;", "&"))
}

/// Width and height encoded in image URLs like `...-1280-1800-jpg`.
pub fn dimensions_from_url(url: &str) -> Option<(u32, u32)> {
    let caps = DIMENSIONS_RE.captures(url)?;
    let width = caps[1].parse::<u32>().ok()?;
    let height = caps[2].parse::<u32>().ok()?;
    if width > 0 && height > 0 {
        Some((width, height))
    } else {
        None
    }
}

/// Supplies keys for pages whose descriptor was listed without one.
#[async_trait]
pub trait KeyEnricher: Send + Sync {
    async fn fetch_key_for_page(&self, index: usize) -> Result<String, ErrorKind>;
}

/// Finds page keys by reading the gallery listing page that shows `index`.
///
/// The number of thumbnails per listing page is measured on the first
/// listing page unless it is already known.
pub struct GalleryKeyEnricher {
    fetcher: Arc<dyn Fetcher>,
    gallery_url: String,
    gallery_id: String,
    thumbs_per_page: OnceCell<usize>,
    fallback_per_page: usize,
    memo: Mutex<ListingMemo>,
    listing_locks: Mutex<HashMap<usize, Arc<Mutex<()>>>>,
}

struct ListingMemo {
    keys: HashMap<usize, String>,
    read_pages: HashSet<usize>,
}

impl GalleryKeyEnricher {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        context: &GalleryContext,
        gallery_url: String,
        fallback_per_page: usize,
        known: &[PageDescriptor],
    ) -> Self {
        let keys = known
            .iter()
            .filter_map(|d| d.key.clone().map(|k| (d.index, k)))
            .collect();

        Self {
            fetcher,
            gallery_url,
            gallery_id: context.gallery_id.clone(),
            thumbs_per_page: OnceCell::new(),
            fallback_per_page: fallback_per_page.max(1),
            memo: Mutex::new(ListingMemo {
                keys,
                read_pages: HashSet::new(),
            }),
            listing_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Skips measuring when the first listing page has already been seen.
    pub fn with_thumbs_per_page(self, thumbs_per_page: usize) -> Self {
        Self {
            thumbs_per_page: OnceCell::new_with(Some(thumbs_per_page.max(1))),
            ..self
        }
    }

    fn listing_url(&self, listing_page: usize) -> String {
        format!(
            "{}?p={}",
            self.gallery_url.trim_end_matches('/'),
            listing_page
        )
    }

    async fn known_key(&self, index: usize) -> Option<String> {
        self.memo.lock().await.keys.get(&index).cloned()
    }

    async fn thumbs_per_page(&self) -> Result<usize, ErrorKind> {
        self.thumbs_per_page
            .get_or_try_init(|| async {
                let listed = self.read_listing(0).await?;
                if listed == 0 {
                    log::warn!(
                        "no thumbnails on {}, assuming {} per listing page",
                        self.listing_url(0),
                        self.fallback_per_page
                    );
                    return Ok::<_, ErrorKind>(self.fallback_per_page);
                }
                log::debug!("gallery {} shows {} thumbnails per listing page", self.gallery_id, listed);
                Ok::<_, ErrorKind>(listed)
            })
            .await
            .copied()
    }

    /// Fetches one listing page and remembers every key on it. Returns how
    /// many of this gallery's pages it links to.
    async fn read_listing(&self, listing_page: usize) -> Result<usize, ErrorKind> {
        let url = self.listing_url(listing_page);
        log::info!("fetching page keys from {}", url);
        let html = self.fetcher.fetch_text(&url).await?;

        let mut memo = self.memo.lock().await;
        let mut listed = 0;
        for link in parse_page_links(&html) {
            if link.gallery_id == self.gallery_id {
                listed += 1;
                memo.keys.entry(link.page - 1).or_insert(link.key);
            }
        }
        memo.read_pages.insert(listing_page);
        Ok(listed)
    }
}

#[async_trait]
impl KeyEnricher for GalleryKeyEnricher {
    async fn fetch_key_for_page(&self, index: usize) -> Result<String, ErrorKind> {
        if let Some(key) = self.known_key(index).await {
            return Ok(key);
        }

        let listing_page = index / self.thumbs_per_page().await?;
        let lock = {
            let mut locks = self.listing_locks.lock().await;
            Arc::clone(locks.entry(listing_page).or_default())
        };
        let _guard = lock.lock().await;

        // Another caller may have read this listing page while we waited.
        let already_read = {
            let memo = self.memo.lock().await;
            if let Some(key) = memo.keys.get(&index) {
                return Ok(key.clone());
            }
            memo.read_pages.contains(&listing_page)
        };
        if !already_read {
            self.read_listing(listing_page).await?;
        }

        self.known_key(index).await.ok_or_else(|| {
            ErrorKind::Parse(format!(
                "page {} not listed on {}",
                index + 1,
                self.listing_url(listing_page)
            ))
        })
    }
}

/// What the reader needs to start on a gallery.
pub struct OpenedGallery {
    pub context: GalleryContext,
    pub descriptors: Vec<PageDescriptor>,
    pub enricher: Option<Arc<dyn KeyEnricher>>,
}

/// Loads reader state from either a multi-page viewer URL or a gallery
/// listing URL.
pub async fn open_gallery(
    fetcher: Arc<dyn Fetcher>,
    url: &str,
    config: &ReaderConfig,
) -> Result<OpenedGallery, ErrorKind> {
    let html = fetcher.fetch_text(url).await?;

    if is_gallery_url(url) {
        let listing = parse_gallery_listing(&html, url)?;
        log::info!(
            "gallery {} opened from listing: {} pages, {} thumbnails on the first listing page",
            listing.context.gallery_id,
            listing.context.total_pages,
            listing.thumbs_per_page
        );

        let mut enricher = GalleryKeyEnricher::new(
            Arc::clone(&fetcher),
            &listing.context,
            url.to_string(),
            config.thumbs_per_listing_page,
            &listing.descriptors,
        );
        if listing.thumbs_per_page > 0 {
            enricher = enricher.with_thumbs_per_page(listing.thumbs_per_page);
        }
        return Ok(OpenedGallery {
            context: listing.context,
            descriptors: listing.descriptors,
            enricher: Some(Arc::new(enricher)),
        });
    }

    let (context, descriptors) = parse_mpv_document(&html, url)?;
    log::info!(
        "gallery {} opened from viewer: {} pages",
        context.gallery_id,
        context.total_pages
    );

    let needs_enrichment = descriptors.iter().any(|d| d.key.is_none());
    let enricher: Option<Arc<dyn KeyEnricher>> = match context.gallery_url.clone() {
        Some(gallery_url) if needs_enrichment => Some(Arc::new(GalleryKeyEnricher::new(
            Arc::clone(&fetcher),
            &context,
            gallery_url,
            config.thumbs_per_listing_page,
            &descriptors,
        ))),
        _ => None,
    };

    Ok(OpenedGallery {
        context,
        descriptors,
        enricher,
    })
}
