//! Run-state checkpointing for interrupt/resume.
//!
//! On interrupt the runtime serializes the conversation, the tool calls
//! not yet executed, and one [`InterruptContext`] per interrupting tool,
//! then writes the blob to a [`CheckpointStore`] keyed by the caller's
//! checkpoint id. The blob is versioned; unknown future versions are
//! rejected rather than guessed at.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use lum_domain::chat::{Message, ToolCall};
use lum_domain::{Error, Result};

pub const CHECKPOINT_VERSION: u16 = 1;

/// One suspended leaf of a (possibly composite) interrupt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptContext {
    /// Stable id the resume call targets.
    pub id: String,
    /// Hierarchical address of the interrupt point:
    /// `[agent, tool_name, tool_call_id]`.
    pub address_path: Vec<String>,
    /// Tool-provided info shown to the caller.
    pub info: Value,
    /// Opaque tool state restored on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Exactly one context per checkpoint is the root cause (the first
    /// interrupt in deterministic tool-call order).
    pub is_root_cause: bool,
    /// The original call, re-invoked on resume.
    pub tool_call: ToolCall,
}

/// Serialized run state sufficient to resume from the interrupt point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u16,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Agent that originated the interrupt.
    pub originator: String,
    pub conversation: Vec<Message>,
    /// Calls of the interrupted step that never started.
    pub pending_tool_calls: Vec<ToolCall>,
    pub interrupt_contexts: Vec<InterruptContext>,
    pub iteration_count: u32,
    /// Tool names of the run, to rebind instances on resume.
    pub tool_names: Vec<String>,
}

impl Checkpoint {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a blob, rejecting unknown versions before attempting a full
    /// decode.
    pub fn deserialize(blob: &[u8]) -> Result<Self> {
        let raw: Value = serde_json::from_slice(blob)
            .map_err(|e| Error::Checkpoint(format!("undecodable blob: {e}")))?;
        let version = raw
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::Checkpoint("missing version field".into()))?;
        if version != CHECKPOINT_VERSION as u64 {
            return Err(Error::Checkpoint(format!(
                "unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
            )));
        }
        serde_json::from_value(raw).map_err(|e| Error::Checkpoint(format!("malformed blob: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Blob store for checkpoints. The default in-memory implementation
/// covers ephemeral interrupts inside one process; durable backends plug
/// in behind the same three calls.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<()>;
    /// `NotFound` when no checkpoint exists under `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), blob);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no checkpoint under key {key}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

/// Filesystem-backed store: one file per checkpoint key under a root
/// directory. Survives process restarts, which turns an interrupt into
/// something the user can answer tomorrow.
pub struct FsCheckpointStore {
    root: std::path::PathBuf,
}

impl FsCheckpointStore {
    /// The root directory is created lazily on first write.
    pub fn new(root: &std::path::Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> std::path::PathBuf {
        self.root.join(format!("{}.ckpt", encode_key(key)))
    }
}

/// Percent-encode a key into a filesystem-safe name.
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for ch in key.chars() {
        match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => encoded.push(ch),
            _ => {
                for byte in ch.to_string().as_bytes() {
                    encoded.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    encoded
}

#[async_trait::async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(key);
        // Write-then-rename so a crash mid-write never leaves a
        // half-checkpoint under the real key.
        let tmp = path.with_extension("ckpt.tmp");
        tokio::fs::write(&tmp, &blob).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("no checkpoint under key {key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            originator: "lumilio".into(),
            conversation: vec![Message::system("be helpful"), Message::user("find photos")],
            pending_tool_calls: vec![ToolCall {
                call_id: "tc_2".into(),
                tool_name: "bulk_like_assets".into(),
                arguments: serde_json::json!({"ref_id": "ref_x"}),
            }],
            interrupt_contexts: vec![InterruptContext {
                id: "int_1".into(),
                address_path: vec!["lumilio".into(), "filter_assets".into(), "tc_1".into()],
                info: serde_json::json!({"count": 42}),
                state: Some(serde_json::json!({"count": 42})),
                is_root_cause: true,
                tool_call: ToolCall {
                    call_id: "tc_1".into(),
                    tool_name: "filter_assets".into(),
                    arguments: serde_json::json!({"rating": 5}),
                },
            }],
            iteration_count: 1,
            tool_names: vec!["filter_assets".into(), "bulk_like_assets".into()],
        }
    }

    #[test]
    fn roundtrip() {
        let cp = sample();
        let blob = cp.serialize().unwrap();
        let back = Checkpoint::deserialize(&blob).unwrap();
        assert_eq!(back.run_id, cp.run_id);
        assert_eq!(back.iteration_count, 1);
        assert_eq!(back.interrupt_contexts.len(), 1);
        assert_eq!(back.interrupt_contexts[0].id, "int_1");
        assert!(back.interrupt_contexts[0].is_root_cause);
        assert_eq!(back.pending_tool_calls.len(), 1);
        assert_eq!(back.tool_names.len(), 2);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut raw = serde_json::to_value(sample()).unwrap();
        raw["version"] = serde_json::json!(99);
        let blob = serde_json::to_vec(&raw).unwrap();
        let err = Checkpoint::deserialize(&blob).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn garbage_blob_rejected() {
        let err = Checkpoint::deserialize(b"not json at all").unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[test]
    fn missing_version_rejected() {
        let err = Checkpoint::deserialize(b"{}").unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[tokio::test]
    async fn fs_store_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsCheckpointStore::new(dir.path());
            store
                .put("thread/1:main", sample().serialize().unwrap())
                .await
                .unwrap();
        }
        // A fresh handle (fresh process, in spirit) still finds it.
        let store = FsCheckpointStore::new(dir.path());
        let blob = store.get("thread/1:main").await.unwrap();
        let cp = Checkpoint::deserialize(&blob).unwrap();
        assert_eq!(cp.interrupt_contexts.len(), 1);

        store.delete("thread/1:main").await.unwrap();
        assert!(store.get("thread/1:main").await.is_err());
        // Idempotent delete.
        store.delete("thread/1:main").await.unwrap();
    }

    #[test]
    fn key_encoding_is_filesystem_safe() {
        let encoded = encode_key("thread/1:main");
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains(':'));
        assert_eq!(encode_key("plain-key_9"), "plain-key_9");
    }

    #[tokio::test]
    async fn memory_store_lifecycle() {
        let store = MemoryCheckpointStore::new();
        store.put("thread-1", b"blob".to_vec()).await.unwrap();
        assert_eq!(store.get("thread-1").await.unwrap(), b"blob");

        store.delete("thread-1").await.unwrap();
        let err = store.get("thread-1").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // Deleting an absent key is idempotent.
        store.delete("thread-1").await.unwrap();
    }
}
