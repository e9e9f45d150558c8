//! Reference manager — short-lived store for opaque inter-tool payloads.
//!
//! One tool stores a payload and returns the `ref_<opaque>` id in its
//! JSON result; a later tool in the same run resolves it. References are
//! scoped to the run that created them and expire after a TTL. Entries
//! expire lazily on access and through a periodic sweep; payloads are
//! opaque and never mutated after store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use lum_domain::{Error, Result};

struct RefEntry {
    payload: Value,
    description: String,
    run_id: Option<Uuid>,
    created_at: Instant,
    ttl: Duration,
}

impl RefEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

pub struct ReferenceManager {
    entries: Mutex<HashMap<String, RefEntry>>,
    default_ttl: Duration,
}

impl ReferenceManager {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn generate_id() -> String {
        format!("ref_{}", Uuid::new_v4().simple())
    }

    /// Whether `s` has the shape of a reference id (`ref_<opaque>` or a
    /// bare UUID — both forms are valid).
    pub fn looks_like_reference(s: &str) -> bool {
        s.starts_with("ref_") && s.len() > 4 || Uuid::parse_str(s).is_ok()
    }

    /// Store an unscoped payload (visible to any run). Rarely what a
    /// tool wants; prefer [`Self::store_scoped`].
    pub fn store(&self, payload: Value, description: &str) -> String {
        self.insert(None, payload, description)
    }

    /// Store a payload scoped to `run_id`; only tools of that run can
    /// resolve the returned id.
    pub fn store_scoped(&self, run_id: Uuid, payload: Value, description: &str) -> String {
        self.insert(Some(run_id), payload, description)
    }

    fn insert(&self, run_id: Option<Uuid>, payload: Value, description: &str) -> String {
        let id = Self::generate_id();
        self.entries.lock().insert(
            id.clone(),
            RefEntry {
                payload,
                description: description.to_string(),
                run_id,
                created_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
        tracing::debug!(ref_id = %id, description, "reference stored");
        id
    }

    /// Resolve a reference from within `run_id`. Expired, foreign-run,
    /// and unknown ids all surface as `NotFound` — callers typically
    /// treat that as "the reference is gone, ask the model to refine".
    pub fn get(&self, run_id: Option<Uuid>, id: &str) -> Result<Value> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(id) {
            Some(entry) if entry.expired(now) => {
                entries.remove(id);
                Err(Error::NotFound(format!("reference {id} has expired")))
            }
            Some(entry) => {
                let visible = match (entry.run_id, run_id) {
                    (None, _) => true,
                    (Some(owner), Some(caller)) => owner == caller,
                    (Some(_), None) => false,
                };
                if visible {
                    Ok(entry.payload.clone())
                } else {
                    // Scope violations read identically to missing ids.
                    Err(Error::NotFound(format!("unknown reference {id}")))
                }
            }
            None => Err(Error::NotFound(format!("unknown reference {id}"))),
        }
    }

    /// Resolve and deserialize into the caller's target type.
    pub fn get_as<T: serde::de::DeserializeOwned>(
        &self,
        run_id: Option<Uuid>,
        id: &str,
    ) -> Result<T> {
        let payload = self.get(run_id, id)?;
        serde_json::from_value(payload)
            .map_err(|e| Error::InvalidInput(format!("reference {id}: {e}")))
    }

    /// Human-readable description of a live reference.
    pub fn describe(&self, id: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries.get(id).map(|e| e.description.clone())
    }

    /// Drop every reference owned by `run_id` (run reached a terminal
    /// state).
    pub fn drop_run(&self, run_id: Uuid) {
        self.entries
            .lock()
            .retain(|_, e| e.run_id != Some(run_id));
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| !e.expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
