use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_DIR: &str = "eh-reader-tui";

/// Reader settings from `config.toml`. Missing fields keep their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// How long a burst of navigation keys is collapsed into one jump.
    pub debounce_ms: u64,
    /// Hard limit on downloading one full-size image.
    pub image_timeout_secs: u64,
    pub user_agent: String,
    /// Sent as the `Cookie` header, for galleries that need a login.
    pub cookie: Option<String>,
    /// Keep at most this many finished pages in memory. Unbounded if unset.
    pub max_cached_pages: Option<usize>,
    pub remember_last_page: bool,
    /// Used when the listing page shows no thumbnails to count.
    pub thumbs_per_listing_page: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 140,
            image_timeout_secs: 30,
            user_agent: "EH-Reader-TUI/0.1.0".to_string(),
            cookie: None,
            max_cached_pages: None,
            remember_last_page: true,
            thumbs_per_listing_page: 40,
        }
    }
}

impl ReaderConfig {
    pub fn load() -> Self {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };

        match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("ignoring invalid config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}
