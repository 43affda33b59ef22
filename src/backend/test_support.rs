//! Scripted network and gallery fixtures shared by backend tests.

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::ehentai::Fetcher;
use super::error::ErrorKind;
use super::gallery::{GalleryContext, PageDescriptor};

pub const GALLERY_ID: &str = "42";
pub const BASE_URL: &str = "https://e-hentai.org";

#[derive(Clone)]
pub enum Reply {
    Text(String),
    Bytes(Vec<u8>),
    Status(u16),
    /// Never answers.
    Hang,
}

struct Route {
    reply: Reply,
    delay: Duration,
}

#[derive(Default)]
pub struct FakeFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, reply: Reply) {
        self.route_delayed(url, reply, Duration::ZERO);
    }

    pub fn route_delayed(&self, url: &str, reply: Reply, delay: Duration) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Route { reply, delay });
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    async fn respond(&self, url: &str) -> Result<Vec<u8>, ErrorKind> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let route = {
            let routes = self.routes.lock().unwrap();
            routes.get(url).map(|r| (r.reply.clone(), r.delay))
        };
        let Some((reply, delay)) = route else {
            return Err(ErrorKind::Network(format!("HTTP 404 for {}", url)));
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Reply::Text(text) => Ok(text.into_bytes()),
            Reply::Bytes(bytes) => Ok(bytes),
            Reply::Status(status) => Err(ErrorKind::Network(format!("HTTP {} for {}", status, url))),
            Reply::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, ErrorKind> {
        let bytes = self.respond(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ErrorKind> {
        self.respond(url).await
    }
}

pub fn png_bytes() -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(4, 6)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Image page URL for a 1-based page.
pub fn page_doc_url(page: usize) -> String {
    format!("{}/s/key{}/{}-{}", BASE_URL, page, GALLERY_ID, page)
}

/// Full-size image URL for a 1-based page.
pub fn image_url(page: usize) -> String {
    format!("https://h.example/om/{}/img-640-960-png/{}.png", GALLERY_ID, page)
}

pub fn page_doc(page: usize) -> String {
    format!(
        r##"<div id="i3"><a href="#next"><img id="img" src="{}" style="width:640px"></a></div>"##,
        image_url(page)
    )
}

pub fn context(total_pages: usize) -> GalleryContext {
    GalleryContext {
        gallery_id: GALLERY_ID.to_string(),
        total_pages,
        base_url: BASE_URL.to_string(),
        title: Some("Fixture Gallery".to_string()),
        gallery_url: Some(format!("{}/g/{}/abcdef/", BASE_URL, GALLERY_ID)),
    }
}

pub fn descriptors(total_pages: usize) -> Vec<PageDescriptor> {
    (0..total_pages)
        .map(|index| PageDescriptor {
            index,
            key: Some(format!("key{}", index + 1)),
            thumbnail_spec: None,
        })
        .collect()
}

/// Routes every page's image page and image bytes, each answered after
/// `delay`.
pub fn serve_gallery(fetcher: &FakeFetcher, total_pages: usize, delay: Duration) {
    let png = png_bytes();
    for page in 1..=total_pages {
        fetcher.route_delayed(&page_doc_url(page), Reply::Text(page_doc(page)), delay);
        fetcher.route_delayed(&image_url(page), Reply::Bytes(png.clone()), delay);
    }
}
