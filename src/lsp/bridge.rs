//! Forwarding between the editor and the ship.
//!
//! Messages from the editor are poked to the agent as JSON-RPC objects.
//! Requests get a fresh id and park a waiter; the agent answers on its
//! subscription with an object carrying the same id. Anything on the
//! subscription with a `method` instead is a notification for the editor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tower_lsp::lsp_types::notification::{DidSaveTextDocument, Notification};
use tracing::{debug, error, info, warn};

use crate::airlock::{self, SubscriptionEvent};
use crate::config::ServerConfig;
use crate::marks::Mark;

/// Where pokes go
#[async_trait]
pub trait ShipLink: Send + Sync {
    async fn poke(&self, mark: Mark, message: Value) -> airlock::Result<()>;

    /// Tear down the connection to the ship
    async fn close(&self) {}
}

/// Where server-initiated notifications go
#[async_trait]
pub trait EditorSink: Send + Sync {
    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()>;
}

/// A JSON-RPC error object returned by the agent
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to poke ship: {0}")]
    Poke(#[from] airlock::Error),

    #[error("{method} timed out after {}s", .after.as_secs_f32())]
    Timeout { method: String, after: Duration },

    #[error("request dropped before the ship answered")]
    Dropped,

    #[error("ship returned error {}: {}", .0.code, .0.message)]
    Remote(RpcError),
}

type Reply = Result<Value, RpcError>;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// `None` waits forever
    pub request_timeout: Option<Duration>,
    pub save_resend_delay: Duration,
}

impl From<&ServerConfig> for BridgeOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            save_resend_delay: config.save_resend_delay(),
        }
    }
}

pub struct Bridge {
    link: Arc<dyn ShipLink>,
    pending: DashMap<String, oneshot::Sender<Reply>>,
    next_id: AtomicU64,
    options: BridgeOptions,
    notifications: mpsc::UnboundedSender<Value>,
}

impl Bridge {
    /// Must be called from within a tokio runtime: notifications are poked
    /// by a background task, one at a time, in the order they were queued.
    pub fn new(link: Arc<dyn ShipLink>, options: BridgeOptions) -> Self {
        let (notifications, queue) = mpsc::unbounded_channel();
        tokio::spawn(send_notifications(
            Arc::clone(&link),
            queue,
            options.request_timeout,
        ));
        Self {
            link,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            options,
            notifications,
        }
    }

    fn next_request_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Number of requests still waiting on the ship
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Forward a request and wait for the ship's `result`.
    ///
    /// The timeout covers both the poke and the answer.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        info!(id = %id, method, "caught request");

        let message = json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id});
        let link = &self.link;
        let exchange = async move {
            if let Err(e) = link.poke(Mark::Request, message).await {
                return Err(BridgeError::from(e));
            }
            match rx.await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(BridgeError::Remote(e)),
                Err(_) => Err(BridgeError::Dropped),
            }
        };

        let outcome = match self.options.request_timeout {
            Some(after) => match tokio::time::timeout(after, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(id = %id, method, "request timed out");
                    Err(BridgeError::Timeout {
                        method: method.to_string(),
                        after,
                    })
                }
            },
            None => exchange.await,
        };

        match &outcome {
            Ok(_) => info!(id = %id, "returning request"),
            Err(_) => {
                self.pending.remove(&id);
            }
        }
        outcome
    }

    /// Queue a notification. `didSave` is queued twice, the second time late.
    pub fn notify(&self, method: &str, params: Value) {
        debug!(method, params = %params, "forwarding notification");
        let message = json!({"jsonrpc": "2.0", "method": method, "params": params});

        if method == DidSaveTextDocument::METHOD {
            let queue = self.notifications.clone();
            let delay = self.options.save_resend_delay;
            let message = message.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                debug!("delayed didSave");
                let _ = queue.send(message);
            });
        }

        if self.notifications.send(message).is_err() {
            warn!(method, "notification queue is closed");
        }
    }

    /// Route one subscription update.
    pub async fn handle_update(&self, update: Value, editor: &dyn EditorSink) {
        info!(update = %update, "subscription update");
        let Value::Object(mut fields) = update else {
            warn!("subscription update is not an object");
            return;
        };

        if let Some(id) = fields.remove("id") {
            let Some(key) = request_key(&id) else {
                warn!(id = %id, "unusable response id");
                return;
            };
            let reply = match fields.remove("error") {
                Some(err) if !err.is_null() => Err(parse_rpc_error(err)),
                _ => Ok(fields.remove("result").unwrap_or(Value::Null)),
            };
            match self.pending.remove(&key) {
                Some((_, waiter)) => {
                    let _ = waiter.send(reply);
                }
                None => warn!(id = %key, "unrecognised request"),
            }
        } else if let Some(Value::String(method)) = fields.remove("method") {
            let params = fields.remove("params").unwrap_or(Value::Null);
            if let Err(e) = editor.notify(&method, params).await {
                warn!(error = %e, method = %method, "could not forward notification");
            }
        } else {
            warn!("subscription update has neither id nor method");
        }
    }

    /// Drain the agent subscription until it quits.
    pub async fn pump(
        self: Arc<Self>,
        mut updates: mpsc::UnboundedReceiver<SubscriptionEvent>,
        editor: Arc<dyn EditorSink>,
    ) {
        while let Some(event) = updates.recv().await {
            match event {
                SubscriptionEvent::Diff(update) => {
                    self.handle_update(update, editor.as_ref()).await
                }
                SubscriptionEvent::Failed(e) => error!(error = %e, "subscription errored"),
                SubscriptionEvent::Quit => {
                    error!("subscription quit");
                    break;
                }
            }
        }
    }

    pub async fn close(&self) {
        self.link.close().await;
        self.pending.clear();
    }
}

/// Poke queued notifications until every sender is gone. Each poke waits
/// for the ship's ack, bounded by `timeout`, before the next one starts.
async fn send_notifications(
    link: Arc<dyn ShipLink>,
    mut queue: mpsc::UnboundedReceiver<Value>,
    timeout: Option<Duration>,
) {
    while let Some(message) = queue.recv().await {
        let method = message["method"].as_str().unwrap_or_default().to_string();
        let poke = link.poke(Mark::Notification, message);
        let outcome = match timeout {
            Some(after) => tokio::time::timeout(after, poke).await.ok(),
            None => Some(poke.await),
        };
        match outcome {
            Some(Ok(())) => {}
            Some(Err(e)) => warn!(error = %e, method = %method, "failed to poke"),
            None => warn!(method = %method, "notification poke timed out"),
        }
    }
    debug!("notification queue closed");
}

fn request_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_rpc_error(err: Value) -> RpcError {
    serde_json::from_value(err.clone()).unwrap_or_else(|_| RpcError {
        code: -32603,
        message: err.to_string(),
        data: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Records pokes and hands them to the test.
    struct FakeLink {
        pokes: mpsc::UnboundedSender<(Mark, Value)>,
        fail: bool,
    }

    #[async_trait]
    impl ShipLink for FakeLink {
        async fn poke(&self, mark: Mark, message: Value) -> airlock::Result<()> {
            if self.fail {
                return Err(airlock::Error::PokeRejected("bad mark".to_string()));
            }
            let _ = self.pokes.send((mark, message));
            Ok(())
        }
    }

    /// Fails its first poke and records the rest.
    struct FlakyLink {
        pokes: mpsc::UnboundedSender<Value>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl ShipLink for FlakyLink {
        async fn poke(&self, _mark: Mark, message: Value) -> airlock::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(airlock::Error::PokeRejected("bad mark".to_string()));
            }
            let _ = self.pokes.send(message);
            Ok(())
        }
    }

    /// Takes a while over its first poke; logs when each poke starts and ends.
    #[derive(Default)]
    struct SlowFirstLink {
        log: Mutex<Vec<String>>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl ShipLink for SlowFirstLink {
        async fn poke(&self, _mark: Mark, message: Value) -> airlock::Result<()> {
            let version = &message["params"]["textDocument"]["version"];
            self.log.lock().await.push(format!("start {version}"));
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.log.lock().await.push(format!("end {version}"));
            Ok(())
        }
    }

    /// Never hears back from the ship.
    struct HangingLink {
        attempts: mpsc::UnboundedSender<Value>,
    }

    #[async_trait]
    impl ShipLink for HangingLink {
        async fn poke(&self, _mark: Mark, message: Value) -> airlock::Result<()> {
            let _ = self.attempts.send(message);
            std::future::pending().await
        }
    }

    async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), fut)
            .await
            .expect("timed out")
    }

    #[derive(Default)]
    struct RecordingEditor {
        seen: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl EditorSink for RecordingEditor {
        async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
            self.seen.lock().await.push((method.to_string(), params));
            Ok(())
        }
    }

    fn options(timeout_ms: Option<u64>) -> BridgeOptions {
        BridgeOptions {
            request_timeout: timeout_ms.map(Duration::from_millis),
            save_resend_delay: Duration::from_millis(10),
        }
    }

    fn bridge(
        fail: bool,
        timeout_ms: Option<u64>,
    ) -> (Arc<Bridge>, mpsc::UnboundedReceiver<(Mark, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(FakeLink { pokes: tx, fail });
        (Arc::new(Bridge::new(link, options(timeout_ms))), rx)
    }

    #[tokio::test]
    async fn request_round_trip() {
        let (bridge, mut pokes) = bridge(false, Some(1000));
        let editor = RecordingEditor::default();

        let pending = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move {
                bridge
                    .request("textDocument/hover", json!({"position": {"line": 1}}))
                    .await
            }
        });

        let (mark, message) = pokes.recv().await.unwrap();
        assert_eq!(mark, Mark::Request);
        assert_eq!(message["jsonrpc"], "2.0");
        assert_eq!(message["method"], "textDocument/hover");
        assert_eq!(message["params"]["position"]["line"], 1);
        let id = message["id"].as_str().unwrap().to_string();

        bridge
            .handle_update(json!({"id": id, "result": {"contents": "@ud"}}), &editor)
            .await;

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result, json!({"contents": "@ud"}));
        assert_eq!(bridge.outstanding(), 0);
        assert!(editor.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let (bridge, mut pokes) = bridge(false, Some(50));
        let first = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.request("a", Value::Null).await }
        });
        let second = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.request("b", Value::Null).await }
        });
        let (_, one) = pokes.recv().await.unwrap();
        let (_, two) = pokes.recv().await.unwrap();
        assert_ne!(one["id"], two["id"]);
        let _ = first.await;
        let _ = second.await;
    }

    #[tokio::test]
    async fn numeric_response_id_matches() {
        let (bridge, mut pokes) = bridge(false, Some(1000));
        let editor = RecordingEditor::default();
        let pending = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.request("textDocument/definition", json!({})).await }
        });

        let (_, message) = pokes.recv().await.unwrap();
        let id: u64 = message["id"].as_str().unwrap().parse().unwrap();
        bridge.handle_update(json!({"id": id, "result": null}), &editor).await;

        assert_eq!(pending.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn remote_error_is_returned() {
        let (bridge, mut pokes) = bridge(false, Some(1000));
        let editor = RecordingEditor::default();
        let pending = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.request("textDocument/completion", json!({})).await }
        });

        let (_, message) = pokes.recv().await.unwrap();
        bridge
            .handle_update(
                json!({"id": message["id"], "error": {"code": -32601, "message": "nope"}}),
                &editor,
            )
            .await;

        match pending.await.unwrap() {
            Err(BridgeError::Remote(e)) => {
                assert_eq!(e.code, -32601);
                assert_eq!(e.message, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_times_out() {
        let (bridge, _pokes) = bridge(false, Some(20));
        let result = bridge.request("textDocument/hover", json!({})).await;
        assert!(matches!(result, Err(BridgeError::Timeout { .. })));
        assert_eq!(bridge.outstanding(), 0);
    }

    #[tokio::test]
    async fn failed_poke_fails_request() {
        let (bridge, _pokes) = bridge(true, None);
        let result = bridge.request("textDocument/hover", json!({})).await;
        assert!(matches!(result, Err(BridgeError::Poke(_))));
        assert_eq!(bridge.outstanding(), 0);
    }

    #[tokio::test]
    async fn notifications_use_notification_mark() {
        let (bridge, mut pokes) = bridge(false, None);
        bridge.notify("textDocument/didOpen", json!({"textDocument": {}}));

        let (mark, message) = pokes.recv().await.unwrap();
        assert_eq!(mark, Mark::Notification);
        assert_eq!(
            message,
            json!({
                "jsonrpc": "2.0",
                "method": "textDocument/didOpen",
                "params": {"textDocument": {}}
            })
        );
        assert!(message.get("id").is_none());
    }

    #[tokio::test]
    async fn did_save_is_sent_twice() {
        let (bridge, mut pokes) = bridge(false, None);
        bridge.notify("textDocument/didSave", json!({}));

        let first = pokes.recv().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), pokes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.1["method"], "textDocument/didSave");
    }

    #[tokio::test]
    async fn failed_notification_poke_is_swallowed() {
        let (tx, mut pokes) = mpsc::unbounded_channel();
        let link = Arc::new(FlakyLink {
            pokes: tx,
            calls: AtomicU64::new(0),
        });
        let bridge = Bridge::new(link, options(None));
        bridge.notify("initialized", json!({}));
        bridge.notify("textDocument/didOpen", json!({}));

        // The first poke fails; the queue moves on to the next one
        let message = pokes.recv().await.unwrap();
        assert_eq!(message["method"], "textDocument/didOpen");
    }

    #[tokio::test]
    async fn notifications_are_poked_in_order() {
        let link = Arc::new(SlowFirstLink::default());
        let bridge = Bridge::new(link.clone(), options(Some(1000)));
        for version in 1..=3 {
            bridge.notify(
                "textDocument/didChange",
                json!({"textDocument": {"version": version}}),
            );
        }

        let log = within(async {
            loop {
                let log = link.log.lock().await.clone();
                if log.len() == 6 {
                    return log;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert_eq!(log, ["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]);
    }

    #[tokio::test]
    async fn request_times_out_when_poke_hangs() {
        let (tx, _attempts) = mpsc::unbounded_channel();
        let bridge = Bridge::new(Arc::new(HangingLink { attempts: tx }), options(Some(50)));

        let result = within(bridge.request("textDocument/hover", json!({}))).await;
        assert!(matches!(result, Err(BridgeError::Timeout { .. })));
        assert_eq!(bridge.outstanding(), 0);
    }

    #[tokio::test]
    async fn hanging_notification_poke_does_not_stall_the_queue() {
        let (tx, mut attempts) = mpsc::unbounded_channel();
        let bridge = Bridge::new(Arc::new(HangingLink { attempts: tx }), options(Some(50)));
        bridge.notify("textDocument/didOpen", json!({}));
        bridge.notify("textDocument/didClose", json!({}));

        let first = within(attempts.recv()).await.unwrap();
        let second = within(attempts.recv()).await.unwrap();
        assert_eq!(first["method"], "textDocument/didOpen");
        assert_eq!(second["method"], "textDocument/didClose");
    }

    #[tokio::test]
    async fn method_updates_go_to_editor() {
        let (bridge, _pokes) = bridge(false, None);
        let editor = RecordingEditor::default();
        bridge
            .handle_update(
                json!({
                    "method": "textDocument/publishDiagnostics",
                    "params": {"uri": "file:///a.hoon", "diagnostics": []}
                }),
                &editor,
            )
            .await;

        let seen = editor.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "textDocument/publishDiagnostics");
        assert_eq!(seen[0].1["uri"], "file:///a.hoon");
    }

    #[tokio::test]
    async fn unknown_updates_are_ignored() {
        let (bridge, _pokes) = bridge(false, None);
        let editor = RecordingEditor::default();
        bridge.handle_update(json!({"id": "99", "result": 1}), &editor).await;
        bridge.handle_update(json!({"result": 1}), &editor).await;
        bridge.handle_update(json!([1, 2]), &editor).await;
        assert!(editor.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn pump_stops_on_quit() {
        let (bridge, _pokes) = bridge(false, None);
        let editor = Arc::new(RecordingEditor::default());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(SubscriptionEvent::Diff(
            json!({"method": "window/logMessage", "params": {"type": 3, "message": "hi"}}),
        ))
        .unwrap();
        tx.send(SubscriptionEvent::Failed("transient".to_string()))
            .unwrap();
        tx.send(SubscriptionEvent::Quit).unwrap();

        let sink: Arc<dyn EditorSink> = editor.clone();
        bridge.pump(rx, sink).await;
        assert_eq!(editor.seen.lock().await.len(), 1);
    }

    #[test]
    fn malformed_error_objects_become_internal_errors() {
        let err = parse_rpc_error(json!("boom"));
        assert_eq!(err.code, -32603);
        assert_eq!(err.message, "\"boom\"");
    }
}
