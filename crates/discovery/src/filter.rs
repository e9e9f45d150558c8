//! Media-extension filter.
//!
//! Built once from the configured photo/raw/video/audio sets and used by
//! both the watchman subscription expression and the poll fallback —
//! the two paths must filter identically or discovery diverges
//! depending on which one saw a file first.

use std::collections::BTreeSet;

use lum_domain::config::MediaConfig;

use crate::paths;

#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    extensions: BTreeSet<String>,
}

impl ExtensionFilter {
    pub fn from_media_config(media: &MediaConfig) -> Self {
        Self {
            extensions: media.supported_extensions(),
        }
    }

    /// Build from an already-normalized extension set (lowercase, no
    /// dot), e.g. the one carried by the session config.
    pub fn from_extension_set(extensions: BTreeSet<String>) -> Self {
        Self { extensions }
    }

    #[cfg(test)]
    pub fn from_extensions<I: IntoIterator<Item = S>, S: Into<String>>(exts: I) -> Self {
        Self {
            extensions: exts.into_iter().map(|e| e.into().to_lowercase()).collect(),
        }
    }

    /// Whether a clean relative path carries a supported extension.
    pub fn matches(&self, relative: &str) -> bool {
        match paths::extension(relative) {
            Some(ext) => self.extensions.contains(&ext),
            None => false,
        }
    }

    pub fn extensions(&self) -> &BTreeSet<String> {
        &self.extensions
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}
