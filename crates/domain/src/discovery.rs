//! Discovery job payloads and the durable queue seam.
//!
//! Discovery produces *intent*: a file at a path appeared, changed, or
//! disappeared. Hashing, EXIF, thumbnails and the rest of ingestion are
//! performed by consumers of the `discover_asset` queue, outside this
//! core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Queue discovery jobs are published on.
pub const DISCOVER_ASSET_QUEUE: &str = "discover_asset";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryOp {
    Upsert,
    Delete,
}

/// One discovery intent. `{repository_id, relative_path, operation}` is
/// the identity the downstream consumer deduplicates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryJob {
    pub repository_id: Uuid,
    /// Repository-relative, forward slashes.
    pub relative_path: String,
    pub operation: DiscoveryOp,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub detected_at: DateTime<Utc>,
}

/// Durable job queue seam. The reference deployment backs this with the
/// relational store's queue tables; tests and dev mode use an in-memory
/// implementation.
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn insert(&self, queue: &str, job: &DiscoveryJob) -> Result<()>;
}

/// Best-effort content type from a lowercase extension (no dot).
pub fn content_type_for(ext: &str) -> Option<&'static str> {
    let ct = match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "tiff" | "tif" => "image/tiff",
        "bmp" => "image/bmp",
        "dng" => "image/x-adobe-dng",
        "cr2" | "cr3" => "image/x-canon-cr2",
        "nef" => "image/x-nikon-nef",
        "arw" => "image/x-sony-arw",
        "raf" => "image/x-fuji-raf",
        "orf" => "image/x-olympus-orf",
        "rw2" => "image/x-panasonic-rw2",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        _ => return None,
    };
    Some(ct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&DiscoveryOp::Upsert).unwrap(),
            "\"upsert\""
        );
        assert_eq!(
            serde_json::to_string(&DiscoveryOp::Delete).unwrap(),
            "\"delete\""
        );
    }

    #[test]
    fn job_payload_shape() {
        let job = DiscoveryJob {
            repository_id: Uuid::new_v4(),
            relative_path: "2024/trip/IMG_0001.jpg".into(),
            operation: DiscoveryOp::Upsert,
            file_name: "IMG_0001.jpg".into(),
            content_type: Some("image/jpeg".into()),
            file_size: Some(4_128_311),
            detected_at: Utc::now(),
        };
        let v = serde_json::to_value(&job).unwrap();
        assert_eq!(v["operation"], "upsert");
        assert_eq!(v["relative_path"], "2024/trip/IMG_0001.jpg");
        assert!(v["detected_at"].is_string());
    }

    #[test]
    fn delete_job_omits_optional_fields() {
        let job = DiscoveryJob {
            repository_id: Uuid::new_v4(),
            relative_path: "gone.jpg".into(),
            operation: DiscoveryOp::Delete,
            file_name: "gone.jpg".into(),
            content_type: None,
            file_size: None,
            detected_at: Utc::now(),
        };
        let v = serde_json::to_value(&job).unwrap();
        assert!(v.get("content_type").is_none());
        assert!(v.get("file_size").is_none());
    }

    #[test]
    fn content_types_cover_media_classes() {
        assert_eq!(content_type_for("jpg"), Some("image/jpeg"));
        assert_eq!(content_type_for("dng"), Some("image/x-adobe-dng"));
        assert_eq!(content_type_for("mov"), Some("video/quicktime"));
        assert_eq!(content_type_for("flac"), Some("audio/flac"));
        assert_eq!(content_type_for("exe"), None);
    }
}
