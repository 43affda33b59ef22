use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;

use super::error::ErrorKind;

const DEFAULT_ORIGIN: &str = "https://e-hentai.org";

static IMAGELIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)var\s+imagelist\s*=\s*(\[.*?\]);").expect("imagelist regex should compile")
});
static GID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"var\s+gid\s*=\s*(\d+);").expect("gid regex should compile"));
static MPVKEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"var\s+mpvkey\s*=\s*"([^"]+)";"#).expect("mpvkey regex should compile")
});
static PAGECOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"var\s+pagecount\s*=\s*(\d+);").expect("pagecount regex should compile")
});
static GALLERY_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"var\s+gallery_url\s*=\s*"([^"]+)";"#).expect("gallery_url regex should compile")
});
static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<title>\s*(.+?)\s*(?:-\s*E-Hentai[^<]*)?</title>")
        .expect("title regex should compile")
});
static PATH_GID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(?:mpv|g)/(\d+)/([0-9a-fA-F]+)").expect("path gid regex should compile")
});
static PAGE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href="([^"]*/s/([0-9a-f]+)/(\d+)-(\d+)(?:[?#][^"]*)?)""#)
        .expect("page link regex should compile")
});
static PAGE_COUNT_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)>\s*(\d+)\s+pages?\s*<").expect("page count regex should compile")
});
static GALLERY_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<h1\s+id="gn"\s*>(.*?)</h1>"#).expect("gallery name regex should compile")
});

/// One page of the gallery as the site lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub index: usize,
    pub key: Option<String>,
    pub thumbnail_spec: Option<String>,
}

impl PageDescriptor {
    pub fn keyless(index: usize) -> Self {
        Self {
            index,
            key: None,
            thumbnail_spec: None,
        }
    }
}

/// Read-only facts about the open gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryContext {
    pub gallery_id: String,
    pub total_pages: usize,
    pub base_url: String,
    pub title: Option<String>,
    pub gallery_url: Option<String>,
}

/// Ordered page descriptors shared by the session.
///
/// Only `key` ever changes after construction, filled in by enrichment.
#[derive(Clone)]
pub struct DescriptorStore {
    inner: Arc<RwLock<Vec<PageDescriptor>>>,
    page_count: usize,
}

impl DescriptorStore {
    pub fn new(descriptors: Vec<PageDescriptor>) -> Self {
        let page_count = descriptors.len();
        Self {
            inner: Arc::new(RwLock::new(descriptors)),
            page_count,
        }
    }

    /// Number of descriptors. Fixed at construction.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub async fn get(&self, index: usize) -> Option<PageDescriptor> {
        let inner = self.inner.read().await;
        inner.get(index).cloned()
    }

    /// Records a key found out of band. Existing keys are left alone.
    pub async fn set_key(&self, index: usize, key: String) {
        let mut inner = self.inner.write().await;
        if let Some(descriptor) = inner.get_mut(index) {
            if descriptor.key.is_none() {
                descriptor.key = Some(key);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MpvImage {
    #[serde(default)]
    k: Option<String>,
    #[serde(default)]
    t: Option<String>,
}

/// Reads the inline script state of a multi-page viewer document.
pub fn parse_mpv_document(
    html: &str,
    doc_url: &str,
) -> Result<(GalleryContext, Vec<PageDescriptor>), ErrorKind> {
    let list_json = capture(&IMAGELIST_RE, html)
        .ok_or_else(|| ErrorKind::Parse("no imagelist in viewer document".to_string()))?;
    let images: Vec<MpvImage> = serde_json::from_str(list_json)
        .map_err(|e| ErrorKind::Parse(format!("imagelist is not valid JSON: {}", e)))?;
    if images.is_empty() {
        return Err(ErrorKind::Parse("imagelist is empty".to_string()));
    }

    let gallery_id = capture(&GID_RE, html)
        .map(str::to_string)
        .or_else(|| PATH_GID_RE.captures(doc_url).map(|c| c[1].to_string()))
        .ok_or_else(|| ErrorKind::Parse("no gallery id".to_string()))?;

    let total_pages = capture(&PAGECOUNT_RE, html)
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(images.len());

    let gallery_url = capture(&GALLERY_URL_RE, html).map(str::to_string);
    let base_url = gallery_url
        .as_deref()
        .and_then(origin_of)
        .or_else(|| origin_of(doc_url))
        .unwrap_or_else(|| DEFAULT_ORIGIN.to_string());

    if let Some(mpvkey) = capture(&MPVKEY_RE, html) {
        log::debug!("viewer key present ({} chars)", mpvkey.len());
    }

    let mut descriptors: Vec<PageDescriptor> = images
        .into_iter()
        .take(total_pages)
        .enumerate()
        .map(|(index, image)| PageDescriptor {
            index,
            key: image.k.filter(|k| !k.is_empty()),
            thumbnail_spec: image.t.filter(|t| !t.is_empty()),
        })
        .collect();
    while descriptors.len() < total_pages {
        descriptors.push(PageDescriptor::keyless(descriptors.len()));
    }

    let context = GalleryContext {
        gallery_id,
        total_pages,
        base_url,
        title: capture(&TITLE_RE, html).map(str::to_string),
        gallery_url,
    };

    Ok((context, descriptors))
}

/// A `/s/{key}/{gid}-{page}` link found in a listing document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLink {
    /// 1-based, as it appears in the link.
    pub page: usize,
    pub key: String,
    pub gallery_id: String,
    pub url: String,
}

/// All page links in a document, deduplicated by page number and sorted.
pub fn parse_page_links(html: &str) -> Vec<PageLink> {
    let mut by_page = BTreeMap::new();
    for caps in PAGE_LINK_RE.captures_iter(html) {
        let Ok(page) = caps[4].parse::<usize>() else {
            continue;
        };
        if page == 0 {
            continue;
        }
        by_page.entry(page).or_insert_with(|| PageLink {
            page,
            key: caps[2].to_string(),
            gallery_id: caps[3].to_string(),
            url: caps[1].to_string(),
        });
    }
    by_page.into_values().collect()
}

/// First page of a gallery listing turned into reader state.
#[derive(Debug, Clone)]
pub struct GalleryListing {
    pub context: GalleryContext,
    pub descriptors: Vec<PageDescriptor>,
    /// Thumbnails shown per listing page, 0 when none were found.
    pub thumbs_per_page: usize,
}

/// Reads a gallery listing page. Pages beyond the first listing page start
/// without a key.
pub fn parse_gallery_listing(html: &str, gallery_url: &str) -> Result<GalleryListing, ErrorKind> {
    let gallery_id = PATH_GID_RE
        .captures(gallery_url)
        .map(|c| c[1].to_string())
        .ok_or_else(|| ErrorKind::Parse(format!("not a gallery URL: {}", gallery_url)))?;

    let links: Vec<PageLink> = parse_page_links(html)
        .into_iter()
        .filter(|link| link.gallery_id == gallery_id)
        .collect();

    let counted = capture(&PAGE_COUNT_TEXT_RE, html).and_then(|n| n.parse::<usize>().ok());
    let total_pages = counted
        .or_else(|| links.iter().map(|l| l.page).max())
        .filter(|n| *n > 0)
        .ok_or_else(|| ErrorKind::Parse("gallery has no pages".to_string()))?;

    let mut descriptors: Vec<PageDescriptor> =
        (0..total_pages).map(PageDescriptor::keyless).collect();
    for link in &links {
        if let Some(descriptor) = descriptors.get_mut(link.page - 1) {
            descriptor.key = Some(link.key.clone());
        }
    }

    let base_url = origin_of(gallery_url).unwrap_or_else(|| DEFAULT_ORIGIN.to_string());
    let context = GalleryContext {
        gallery_id,
        total_pages,
        base_url,
        title: capture(&GALLERY_NAME_RE, html)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        gallery_url: Some(gallery_url.to_string()),
    };

    Ok(GalleryListing {
        context,
        descriptors,
        thumbs_per_page: links.len(),
    })
}

pub fn is_gallery_url(url: &str) -> bool {
    url.contains("/g/")
}

fn capture<'a>(re: &Regex, text: &'a str) -> Option<&'a str> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let origin = parsed.origin();
    if origin.is_tuple() {
        Some(origin.ascii_serialization())
    } else {
        None
    }
}
