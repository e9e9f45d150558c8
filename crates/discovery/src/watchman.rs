//! Minimal watchman client.
//!
//! Speaks JSON PDUs (one object per line) over the service's Unix
//! socket: `version`, `watch-project`, `clock`, `query`, `subscribe`.
//! Unilateral subscription PDUs arrive interleaved with command
//! responses; [`WatchmanClient::into_event_pump`] moves the connection
//! into a reader task that forwards them over a channel, which keeps
//! the session's select loop cancel-safe.
//!
//! The [`Transport`]/[`Connector`] seams exist so the session logic can
//! run against a scripted in-memory connection in tests.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use lum_domain::repository::{INBOX_DIR, SYSTEM_DIR};
use lum_domain::{Error, Result};

/// Subscription name registered with the service.
pub const SUBSCRIPTION_NAME: &str = "lumilio-discovery";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raw PDU transport: one JSON object per line in each direction.
#[async_trait::async_trait]
pub trait Transport: Send {
    async fn send(&mut self, pdu: &Value) -> Result<()>;
    /// Next inbound PDU, or `None` on timeout. `Err` means the
    /// connection is gone.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Value>>;
}

/// Dials a fresh transport; the session reconnects through this after
/// socket failures.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

pub struct UnixTransport {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl UnixTransport {
    pub async fn connect(sock: &Path) -> Result<Self> {
        let stream = UnixStream::connect(sock)
            .await
            .map_err(|e| Error::Watch(format!("connect {}: {e}", sock.display())))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }
}

#[async_trait::async_trait]
impl Transport for UnixTransport {
    async fn send(&mut self, pdu: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(pdu)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| Error::Watch(format!("socket write: {e}")))?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Value>> {
        let mut line = String::new();
        match tokio::time::timeout(timeout, self.reader.read_line(&mut line)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(Error::Watch("socket closed by service".into())),
            Ok(Ok(_)) => serde_json::from_str(line.trim())
                .map(Some)
                .map_err(|e| Error::Watch(format!("undecodable PDU: {e}"))),
            Ok(Err(e)) => Err(Error::Watch(format!("socket read: {e}"))),
        }
    }
}

/// Connector for the real service socket.
pub struct UnixConnector {
    sock: PathBuf,
}

impl UnixConnector {
    pub fn new(sock: PathBuf) -> Self {
        Self { sock }
    }
}

#[async_trait::async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(UnixTransport::connect(&self.sock).await?))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Protocol types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One file entry from a query response or subscription push.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDelta {
    /// Path relative to the watch root.
    pub name: String,
    pub exists: bool,
    pub size: Option<u64>,
    pub mtime_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct WatchRoot {
    pub watch: PathBuf,
    /// Set when the repository root is below the actual watch root;
    /// event names are prefixed with it.
    pub relative_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub clock: String,
    pub files: Vec<FileDelta>,
    pub is_fresh_instance: bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub clock: Option<String>,
    pub files: Vec<FileDelta>,
}

/// The standing file-match expression: regular files with a supported
/// suffix, outside the system and inbox subtrees.
pub fn build_expression(extensions: &BTreeSet<String>) -> Value {
    let mut anyof: Vec<Value> = vec![json!("anyof")];
    anyof.extend(extensions.iter().map(|e| json!(["suffix", e])));
    json!([
        "allof",
        ["type", "f"],
        ["not", ["match", format!("{SYSTEM_DIR}/**"), "wholename"]],
        ["not", ["match", format!("{INBOX_DIR}/**"), "wholename"]],
        Value::Array(anyof),
    ])
}

const FILE_FIELDS: [&str; 4] = ["name", "exists", "size", "mtime_ms"];

fn parse_files(v: &Value) -> Vec<FileDelta> {
    let arr = match v.get("files").and_then(|f| f.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|entry| match entry {
            // Plain string form (fields = ["name"]).
            Value::String(name) => Some(FileDelta {
                name: name.clone(),
                exists: true,
                size: None,
                mtime_ms: None,
            }),
            Value::Object(_) => Some(FileDelta {
                name: entry.get("name")?.as_str()?.to_string(),
                exists: entry.get("exists").and_then(Value::as_bool).unwrap_or(true),
                size: entry.get("size").and_then(Value::as_u64),
                mtime_ms: entry.get("mtime_ms").and_then(Value::as_i64),
            }),
            _ => None,
        })
        .collect()
}

fn parse_subscription(pdu: &Value) -> Option<SubscriptionEvent> {
    pdu.get("subscription")?;
    // A canceled unilateral (watch deleted) surfaces as an empty push;
    // the session notices via the socket closing soon after.
    Some(SubscriptionEvent {
        clock: pdu.get("clock").and_then(|c| c.as_str()).map(String::from),
        files: parse_files(pdu),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WatchmanClient {
    transport: Box<dyn Transport>,
    /// Unilateral PDUs received while awaiting a command response.
    pending: VecDeque<Value>,
}

impl WatchmanClient {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            pending: VecDeque::new(),
        }
    }

    async fn request(&mut self, cmd: Value) -> Result<Value> {
        self.transport.send(&cmd).await?;
        loop {
            match self.transport.recv(REQUEST_TIMEOUT).await? {
                None => {
                    return Err(Error::Watch(format!(
                        "no response to {} within {}s",
                        cmd.get(0).and_then(|v| v.as_str()).unwrap_or("command"),
                        REQUEST_TIMEOUT.as_secs()
                    )))
                }
                Some(pdu) if pdu.get("subscription").is_some() => {
                    self.pending.push_back(pdu);
                }
                Some(pdu) => {
                    if let Some(err) = pdu.get("error").and_then(|v| v.as_str()) {
                        return Err(Error::Watch(err.to_string()));
                    }
                    return Ok(pdu);
                }
            }
        }
    }

    pub async fn version(&mut self) -> Result<String> {
        let resp = self.request(json!(["version"])).await?;
        resp.get("version")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Error::Watch("version response without version".into()))
    }

    pub async fn watch_project(&mut self, root: &Path) -> Result<WatchRoot> {
        let resp = self.request(json!(["watch-project", root])).await?;
        let watch = resp
            .get("watch")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| Error::Watch("watch-project response without watch root".into()))?;
        Ok(WatchRoot {
            watch,
            relative_path: resp
                .get("relative_path")
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    pub async fn clock(&mut self, root: &Path) -> Result<String> {
        let resp = self.request(json!(["clock", root])).await?;
        resp.get("clock")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Error::Watch("clock response without clock".into()))
    }

    /// Query matching files changed since `since` (or everything when
    /// `None`). With `relative_root` set, matching is constrained to
    /// that subtree and names come back relative to it.
    pub async fn query_since(
        &mut self,
        root: &Path,
        expression: &Value,
        since: Option<&str>,
        relative_root: Option<&str>,
    ) -> Result<QueryResult> {
        let mut q = json!({
            "expression": expression,
            "fields": FILE_FIELDS,
        });
        if let Some(clock) = since {
            q["since"] = json!(clock);
        }
        if let Some(rel) = relative_root {
            q["relative_root"] = json!(rel);
        }
        let resp = self.request(json!(["query", root, q])).await?;
        Ok(QueryResult {
            clock: resp
                .get("clock")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            files: parse_files(&resp),
            is_fresh_instance: resp
                .get("is_fresh_instance")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Register the standing subscription; returns the clock it starts
    /// at.
    pub async fn subscribe(
        &mut self,
        root: &Path,
        expression: &Value,
        since: Option<&str>,
        relative_root: Option<&str>,
    ) -> Result<String> {
        let mut sub = json!({
            "expression": expression,
            "fields": FILE_FIELDS,
            "defer_vcs": false,
        });
        if let Some(clock) = since {
            sub["since"] = json!(clock);
        }
        if let Some(rel) = relative_root {
            sub["relative_root"] = json!(rel);
        }
        let resp = self
            .request(json!(["subscribe", root, SUBSCRIPTION_NAME, sub]))
            .await?;
        resp.get("clock")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Error::Watch("subscribe response without clock".into()))
    }

    /// Move the connection into a reader task that forwards subscription
    /// pushes over a channel. The task ends when the receiver drops, the
    /// socket dies, or the handle is aborted.
    pub fn into_event_pump(
        self,
    ) -> (
        mpsc::Receiver<Result<SubscriptionEvent>>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let mut transport = self.transport;
        let pending = self.pending;

        let handle = tokio::spawn(async move {
            for pdu in pending {
                if let Some(ev) = parse_subscription(&pdu) {
                    if tx.send(Ok(ev)).await.is_err() {
                        return;
                    }
                }
            }
            loop {
                match transport.recv(Duration::from_secs(3600)).await {
                    Ok(None) => continue,
                    Ok(Some(pdu)) => {
                        if let Some(ev) = parse_subscription(&pdu) {
                            if tx.send(Ok(ev)).await.is_err() {
                                return;
                            }
                        }
                        // Other unilaterals (state-enter/leave) are noise.
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });
        (rx, handle)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted transport for tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory transport: inbound PDUs come from a channel, outbound PDUs
/// are captured. Lives here (not behind `cfg(test)`) so the session
/// tests can drive full connect cycles.
pub struct ScriptedTransport {
    pub inbound: mpsc::UnboundedReceiver<Value>,
    pub sent: mpsc::UnboundedSender<Value>,
}

impl ScriptedTransport {
    /// Returns `(transport, inbound-sender, outbound-receiver)`.
    pub fn new() -> (
        Self,
        mpsc::UnboundedSender<Value>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self {
                inbound: in_rx,
                sent: out_tx,
            },
            in_tx,
            out_rx,
        )
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, pdu: &Value) -> Result<()> {
        self.sent
            .send(pdu.clone())
            .map_err(|_| Error::Watch("scripted transport closed".into()))
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Value>> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(pdu)) => Ok(Some(pdu)),
            Ok(None) => Err(Error::Watch("scripted transport closed".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_shape() {
        let exts: BTreeSet<String> = ["jpg", "mov"].iter().map(|s| s.to_string()).collect();
        let expr = build_expression(&exts);
        assert_eq!(expr[0], "allof");
        assert_eq!(expr[1], json!(["type", "f"]));
        assert_eq!(expr[2], json!(["not", ["match", ".lumilio/**", "wholename"]]));
        assert_eq!(expr[3], json!(["not", ["match", "inbox/**", "wholename"]]));
        assert_eq!(
            expr[4],
            json!(["anyof", ["suffix", "jpg"], ["suffix", "mov"]])
        );
    }

    #[tokio::test]
    async fn version_handshake() {
        let (transport, in_tx, mut out_rx) = ScriptedTransport::new();
        let mut client = WatchmanClient::new(Box::new(transport));

        in_tx.send(json!({"version": "2024.01.01.00"})).unwrap();
        let version = client.version().await.unwrap();
        assert_eq!(version, "2024.01.01.00");
        assert_eq!(out_rx.recv().await.unwrap(), json!(["version"]));
    }

    #[tokio::test]
    async fn error_response_surfaces_as_watch_error() {
        let (transport, in_tx, _out_rx) = ScriptedTransport::new();
        let mut client = WatchmanClient::new(Box::new(transport));

        in_tx
            .send(json!({"error": "unable to resolve root: invalid clock"}))
            .unwrap();
        let err = client
            .query_since(Path::new("/photos"), &json!(["true"]), Some("c:0:0"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Watch(_)));
        assert!(err.to_string().contains("invalid clock"));
    }

    #[tokio::test]
    async fn unilateral_pdu_during_request_is_queued_for_the_pump() {
        let (transport, in_tx, _out_rx) = ScriptedTransport::new();
        let mut client = WatchmanClient::new(Box::new(transport));

        // A push arrives before the clock response.
        in_tx
            .send(json!({
                "subscription": SUBSCRIPTION_NAME,
                "clock": "c:1:10",
                "files": [{"name": "a.jpg", "exists": true, "size": 10, "mtime_ms": 1}]
            }))
            .unwrap();
        in_tx.send(json!({"clock": "c:1:11"})).unwrap();

        let clock = client.clock(Path::new("/photos")).await.unwrap();
        assert_eq!(clock, "c:1:11");

        let (mut events, pump) = client.into_event_pump();
        let ev = events.recv().await.unwrap().unwrap();
        assert_eq!(ev.files.len(), 1);
        assert_eq!(ev.files[0].name, "a.jpg");
        pump.abort();
    }

    #[tokio::test]
    async fn query_parses_files_and_fresh_instance() {
        let (transport, in_tx, mut out_rx) = ScriptedTransport::new();
        let mut client = WatchmanClient::new(Box::new(transport));

        in_tx
            .send(json!({
                "clock": "c:2:20",
                "is_fresh_instance": true,
                "files": [
                    {"name": "2024/a.jpg", "exists": true, "size": 100, "mtime_ms": 5},
                    {"name": "gone.jpg", "exists": false},
                    "bare-name.jpg"
                ]
            }))
            .unwrap();

        let result = client
            .query_since(Path::new("/photos"), &json!(["true"]), None, None)
            .await
            .unwrap();
        assert!(result.is_fresh_instance);
        assert_eq!(result.clock, "c:2:20");
        assert_eq!(result.files.len(), 3);
        assert!(!result.files[1].exists);
        assert!(result.files[2].exists);

        // No `since` key when querying from the beginning.
        let sent = out_rx.recv().await.unwrap();
        assert_eq!(sent[0], "query");
        assert!(sent[2].get("since").is_none());
    }

    #[tokio::test]
    async fn subscribe_sends_since_and_returns_clock() {
        let (transport, in_tx, mut out_rx) = ScriptedTransport::new();
        let mut client = WatchmanClient::new(Box::new(transport));

        in_tx
            .send(json!({"subscribe": SUBSCRIPTION_NAME, "clock": "c:3:30"}))
            .unwrap();
        let clock = client
            .subscribe(Path::new("/photos"), &json!(["true"]), Some("c:3:29"), None)
            .await
            .unwrap();
        assert_eq!(clock, "c:3:30");

        let sent = out_rx.recv().await.unwrap();
        assert_eq!(sent[0], "subscribe");
        assert_eq!(sent[2], SUBSCRIPTION_NAME);
        assert_eq!(sent[3]["since"], "c:3:29");
    }

    #[tokio::test]
    async fn pump_forwards_pushes_and_reports_closure() {
        let (transport, in_tx, _out_rx) = ScriptedTransport::new();
        let client = WatchmanClient::new(Box::new(transport));
        let (mut events, _pump) = client.into_event_pump();

        in_tx
            .send(json!({
                "subscription": SUBSCRIPTION_NAME,
                "files": [{"name": "x.mov", "exists": true}]
            }))
            .unwrap();
        let ev = events.recv().await.unwrap().unwrap();
        assert_eq!(ev.files[0].name, "x.mov");

        drop(in_tx);
        let err = events.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Watch(_)));
    }
}
