//! Asset DTOs and the narrow query seam the agent tools depend on.
//!
//! The relational store behind [`AssetQueries`] is an external
//! collaborator; this crate only fixes the shape of the seam. The
//! in-memory [`MemoryAssetIndex`] is the reference implementation used
//! by the gateway in dev mode and by the runtime tests.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Broad media class of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetKind {
    Photo,
    Video,
    Audio,
}

/// Summary DTO returned by queries and rendered by UI side channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSummary {
    pub id: Uuid,
    pub repository_id: Uuid,
    /// Repository-relative path, forward slashes.
    pub storage_path: String,
    pub file_name: String,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default)]
    pub liked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
}

/// Conjunctive filter over the asset table. Absent fields match all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetFilter {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<AssetKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl AssetFilter {
    fn matches(&self, asset: &AssetSummary) -> bool {
        if let Some(kind) = self.kind {
            if asset.kind != kind {
                return false;
            }
        }
        if let Some(rating) = self.rating {
            if asset.rating != Some(rating) {
                return false;
            }
        }
        if let Some(liked) = self.liked {
            if asset.liked != liked {
                return false;
            }
        }
        if let Some(repo) = self.repository_id {
            if asset.repository_id != repo {
                return false;
            }
        }
        if let Some(ref needle) = self.filename_contains {
            if !asset
                .file_name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(after) = self.taken_after {
            match asset.taken_at {
                Some(t) if t >= after => {}
                _ => return false,
            }
        }
        if let Some(before) = self.taken_before {
            match asset.taken_at {
                Some(t) if t <= before => {}
                _ => return false,
            }
        }
        true
    }
}

/// Narrow query interface over the asset table.
#[async_trait::async_trait]
pub trait AssetQueries: Send + Sync {
    /// Count assets matching the filter (ignores `limit`).
    async fn count(&self, filter: &AssetFilter) -> Result<u64>;

    /// Fetch assets matching the filter, honoring `limit`.
    async fn search(&self, filter: &AssetFilter) -> Result<Vec<AssetSummary>>;

    /// Fetch a single asset by id.
    async fn get(&self, id: Uuid) -> Result<Option<AssetSummary>>;

    /// Set the liked flag on a batch of assets. Returns how many changed.
    async fn set_liked(&self, ids: &[Uuid], liked: bool) -> Result<u64>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory reference implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory asset index. Dev fallback for the gateway and the fixture
/// used by runtime tests; not intended for real libraries.
#[derive(Default)]
pub struct MemoryAssetIndex {
    assets: RwLock<Vec<AssetSummary>>,
}

impl MemoryAssetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset: AssetSummary) {
        self.assets.write().push(asset);
    }

    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }
}

#[async_trait::async_trait]
impl AssetQueries for MemoryAssetIndex {
    async fn count(&self, filter: &AssetFilter) -> Result<u64> {
        let assets = self.assets.read();
        Ok(assets.iter().filter(|a| filter.matches(a)).count() as u64)
    }

    async fn search(&self, filter: &AssetFilter) -> Result<Vec<AssetSummary>> {
        let assets = self.assets.read();
        let mut hits: Vec<AssetSummary> = assets
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn get(&self, id: Uuid) -> Result<Option<AssetSummary>> {
        let assets = self.assets.read();
        Ok(assets.iter().find(|a| a.id == id).cloned())
    }

    async fn set_liked(&self, ids: &[Uuid], liked: bool) -> Result<u64> {
        if ids.is_empty() {
            return Err(Error::InvalidInput("empty asset id list".into()));
        }
        let mut assets = self.assets.write();
        let mut changed = 0;
        for asset in assets.iter_mut() {
            if ids.contains(&asset.id) && asset.liked != liked {
                asset.liked = liked;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(name: &str, rating: Option<u8>) -> AssetSummary {
        AssetSummary {
            id: Uuid::new_v4(),
            repository_id: Uuid::new_v4(),
            storage_path: format!("2024/{name}"),
            file_name: name.into(),
            kind: AssetKind::Photo,
            rating,
            liked: false,
            taken_at: None,
            thumbnail_path: None,
        }
    }

    #[tokio::test]
    async fn count_and_search_respect_filter() {
        let index = MemoryAssetIndex::new();
        index.insert(photo("a.jpg", Some(5)));
        index.insert(photo("b.jpg", Some(3)));
        index.insert(photo("c.jpg", Some(5)));

        let filter = AssetFilter {
            rating: Some(5),
            ..Default::default()
        };
        assert_eq!(index.count(&filter).await.unwrap(), 2);

        let hits = index.search(&filter).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|a| a.rating == Some(5)));
    }

    #[tokio::test]
    async fn search_honors_limit_count_does_not() {
        let index = MemoryAssetIndex::new();
        for i in 0..10 {
            index.insert(photo(&format!("{i}.jpg"), None));
        }
        let filter = AssetFilter {
            limit: Some(3),
            ..Default::default()
        };
        assert_eq!(index.count(&filter).await.unwrap(), 10);
        assert_eq!(index.search(&filter).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn filename_match_is_case_insensitive() {
        let index = MemoryAssetIndex::new();
        index.insert(photo("Sunset_Beach.jpg", None));
        let filter = AssetFilter {
            filename_contains: Some("sunset".into()),
            ..Default::default()
        };
        assert_eq!(index.count(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_liked_reports_changed_rows_only() {
        let index = MemoryAssetIndex::new();
        let a = photo("a.jpg", None);
        let b = photo("b.jpg", None);
        let ids = vec![a.id, b.id];
        index.insert(a);
        index.insert(b);

        assert_eq!(index.set_liked(&ids, true).await.unwrap(), 2);
        // Second application is a no-op.
        assert_eq!(index.set_liked(&ids, true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_liked_rejects_empty_batch() {
        let index = MemoryAssetIndex::new();
        let err = index.set_liked(&[], true).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn kind_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&AssetKind::Photo).unwrap(),
            "\"PHOTO\""
        );
        let back: AssetKind = serde_json::from_str("\"VIDEO\"").unwrap();
        assert_eq!(back, AssetKind::Video);
    }
}
