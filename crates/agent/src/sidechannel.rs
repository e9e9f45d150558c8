//! UI side channel — structured events from tools to the end user,
//! parallel to the model's text stream.
//!
//! Each run owns one bounded channel. Tools dispatch through a cloneable
//! [`Dispatcher`] facade that never blocks: when the channel is full the
//! event is dropped and counted. This is a hint channel — a lost event
//! must never affect correctness, and tools still return a textual
//! result to the model.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Channel capacity per run.
pub const SIDE_CHANNEL_CAPACITY: usize = 100;

/// The dominant event type; reserved types may be added over time.
pub const EVENT_TOOL_EXECUTION: &str = "tool_execution";

/// Known rendering components. Clients must tolerate unknown values, so
/// the field stays a plain string on the wire.
pub mod components {
    pub const JUSTIFIED_GALLERY: &str = "justified_gallery";
    pub const DATA_TABLE: &str = "data_table";
    pub const CHART: &str = "chart";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRef {
    pub name: String,
    /// Stable across all events emitted by one tool invocation.
    pub execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub status: ExecutionStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rendering {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    pub payload_type: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendering: Option<Rendering>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp_ms: i64,
    pub tool: ToolRef,
    pub execution: ExecutionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl UiEvent {
    pub fn tool_execution(
        tool_name: &str,
        execution_id: &str,
        status: ExecutionStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type: EVENT_TOOL_EXECUTION.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            tool: ToolRef {
                name: tool_name.into(),
                execution_id: execution_id.into(),
            },
            execution: ExecutionInfo {
                status,
                message: message.into(),
                parameters: None,
                error: None,
                duration_ms: None,
            },
            data: None,
            extra: None,
            metadata: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.execution.parameters = Some(parameters);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.execution.error = Some(error.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.execution.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_data(mut self, data: DataEnvelope) -> Self {
        self.data = Some(data);
        self
    }
}

/// Per-run fan-out handle for tools. Cloneable; all clones share the
/// channel and the drop counter.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<UiEvent>,
    dropped: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Non-blocking send; drops the event (and counts it) when the
    /// channel is full or the reader is gone.
    pub fn dispatch(&self, event: UiEvent) {
        if let Err(e) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                dropped_total = self.dropped.load(Ordering::Relaxed),
                reason = %match e {
                    mpsc::error::TrySendError::Full(_) => "full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                },
                "side channel event dropped"
            );
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a side channel for one run. The receiver goes to the transport
/// adapter; the dispatcher goes into the tool dependency bundle. The
/// channel closes when every dispatcher clone is dropped, which ends the
/// adapter's read loop.
pub fn side_channel() -> (Dispatcher, mpsc::Receiver<UiEvent>) {
    let (tx, rx) = mpsc::channel(SIDE_CHANNEL_CAPACITY);
    (
        Dispatcher {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_delivers_in_emission_order() {
        let (dispatcher, mut rx) = side_channel();
        for i in 0..3 {
            dispatcher.dispatch(UiEvent::tool_execution(
                "filter_assets",
                "exec-1",
                ExecutionStatus::Running,
                format!("step {i}"),
            ));
        }
        for i in 0..3 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.execution.message, format!("step {i}"));
        }
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let (dispatcher, _rx) = side_channel();
        for _ in 0..SIDE_CHANNEL_CAPACITY + 5 {
            dispatcher.dispatch(UiEvent::tool_execution(
                "t",
                "e",
                ExecutionStatus::Running,
                "spam",
            ));
        }
        assert_eq!(dispatcher.dropped_count(), 5);
    }

    #[tokio::test]
    async fn closed_channel_drops_quietly() {
        let (dispatcher, rx) = side_channel();
        drop(rx);
        dispatcher.dispatch(UiEvent::tool_execution(
            "t",
            "e",
            ExecutionStatus::Success,
            "late",
        ));
        assert_eq!(dispatcher.dropped_count(), 1);
    }

    #[test]
    fn event_serialization_shape() {
        let ev = UiEvent::tool_execution(
            "filter_assets",
            "exec-9",
            ExecutionStatus::Success,
            "Found 42 assets",
        )
        .with_duration_ms(131)
        .with_data(DataEnvelope {
            ref_id: Some("ref_abc".into()),
            payload_type: "asset_list".into(),
            payload: serde_json::json!([{"id": "a"}]),
            rendering: Some(Rendering {
                component: components::JUSTIFIED_GALLERY.into(),
                options: None,
            }),
        });

        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "tool_execution");
        assert_eq!(v["execution"]["status"], "success");
        assert_eq!(v["execution"]["duration_ms"], 131);
        assert_eq!(v["data"]["rendering"]["component"], "justified_gallery");
        // Unset optionals stay off the wire.
        assert!(v["execution"].get("error").is_none());
        assert!(v.get("extra").is_none());
    }

    #[test]
    fn clients_tolerate_unknown_component() {
        let raw = serde_json::json!({
            "type": "tool_execution",
            "timestamp_ms": 0,
            "tool": {"name": "t", "execution_id": "e"},
            "execution": {"status": "success", "message": "ok"},
            "data": {
                "payload_type": "x",
                "payload": {},
                "rendering": {"component": "holo_deck"}
            }
        });
        let ev: UiEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(ev.data.unwrap().rendering.unwrap().component, "holo_deck");
    }
}
