//! An eyre channel: one PUT endpoint for actions, one event stream for results.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::action::{render_err, ChannelAction, ChannelResponse};
use super::error::{Error, Result};
use super::sse::{SseDecoder, SseEvent};

/// Something delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Diff(Value),
    Failed(String),
    Quit,
}

/// Tracks which channel events have been seen and which acknowledged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventCursor {
    last_event_id: u64,
    last_acked: u64,
}

impl EventCursor {
    pub fn record(&mut self, event_id: u64) {
        self.last_event_id = event_id;
    }

    pub fn last_event_id(&self) -> u64 {
        self.last_event_id
    }

    /// Event id to acknowledge, if anything received is unacknowledged.
    pub fn pending_ack(&self) -> Option<u64> {
        (self.last_event_id > self.last_acked).then_some(self.last_event_id)
    }

    /// Record that the ship accepted an ack for everything up to `event_id`.
    pub fn commit_ack(&mut self, event_id: u64) {
        self.last_acked = self.last_acked.max(event_id);
    }
}

/// Serialize `action` as a channel body, prefixed by an ack for `ack`.
pub(crate) fn encode_actions(ack: Option<u64>, action: ChannelAction) -> Result<String> {
    let actions: Vec<ChannelAction> = ack
        .map(|event_id| ChannelAction::Ack { event_id })
        .into_iter()
        .chain([action])
        .collect();
    Ok(serde_json::to_string(&actions)?)
}

type PokeWaiter = oneshot::Sender<Result<()>>;

/// Drops a poke's waiter when the poke finishes or is abandoned.
struct PokeGuard<'a> {
    pokes: &'a DashMap<u64, PokeWaiter>,
    id: u64,
}

impl Drop for PokeGuard<'_> {
    fn drop(&mut self) {
        self.pokes.remove(&self.id);
    }
}

struct Inner {
    http: reqwest::Client,
    url: Url,
    cookie: String,
    next_id: AtomicU64,
    cursor: Mutex<EventCursor>,
    /// Held for the whole PUT, so actions reach the ship in the order they were encoded
    sending: Mutex<()>,
    pokes: DashMap<u64, PokeWaiter>,
    subscriptions: DashMap<u64, mpsc::UnboundedSender<SubscriptionEvent>>,
    connected: AtomicBool,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
}

/// A channel on one ship. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Open a channel with a fresh uid. Nothing is sent until the first action.
    pub fn new(
        http: reqwest::Client,
        base: &Url,
        cookie: String,
        reconnect_delay: Duration,
    ) -> Result<Self> {
        let url = base.join(&format!("/~/channel/{}", new_uid()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                url,
                cookie,
                next_id: AtomicU64::new(1),
                cursor: Mutex::new(EventCursor::default()),
                sending: Mutex::new(()),
                pokes: DashMap::new(),
                subscriptions: DashMap::new(),
                connected: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                reconnect_delay,
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Poke `app` on `ship` and wait for the ship to accept or reject it.
    pub async fn poke(&self, ship: &str, app: &str, mark: &str, json: Value) -> Result<()> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pokes.insert(id, tx);
        let _waiter = PokeGuard {
            pokes: &self.inner.pokes,
            id,
        };

        let action = ChannelAction::Poke {
            id,
            ship: ship.to_string(),
            app: app.to_string(),
            mark: mark.to_string(),
            json,
        };
        self.send(action).await?;
        rx.await.unwrap_or(Err(Error::Closed))
    }

    /// Subscribe to `path` on `app`. Returns the subscription id and its updates.
    pub async fn subscribe(
        &self,
        ship: &str,
        app: &str,
        path: &str,
    ) -> Result<(u64, mpsc::UnboundedReceiver<SubscriptionEvent>)> {
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscriptions.insert(id, tx);

        let action = ChannelAction::Subscribe {
            id,
            ship: ship.to_string(),
            app: app.to_string(),
            path: path.to_string(),
        };
        if let Err(e) = self.send(action).await {
            self.inner.subscriptions.remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    pub async fn unsubscribe(&self, subscription: u64) -> Result<()> {
        self.inner.subscriptions.remove(&subscription);
        let id = self.next_id();
        self.send(ChannelAction::Unsubscribe { id, subscription })
            .await
    }

    /// Stop the event stream. Waiting pokes and later actions fail with
    /// [`Error::Closed`].
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.pokes.clear();
        self.inner.subscriptions.clear();
    }

    async fn send(&self, action: ChannelAction) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let _sending = self.inner.sending.lock().await;
        let ack = self.inner.cursor.lock().await.pending_ack();
        let body = encode_actions(ack, action)?;
        debug!(body = %body, "sending to channel");

        let response = self
            .inner
            .http
            .put(self.inner.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(COOKIE, &self.inner.cookie)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                url: self.inner.url.to_string(),
            });
        }
        if let Some(event_id) = ack {
            self.inner.cursor.lock().await.commit_ack(event_id);
        }

        self.connect_if_disconnected();
        Ok(())
    }

    fn connect_if_disconnected(&self) {
        if self.inner.shutdown.is_cancelled() || self.inner.connected.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let channel = self.clone();
        tokio::spawn(async move { channel.run_event_stream().await });
    }

    async fn run_event_stream(self) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.stream_events() => match result {
                    Ok(()) => warn!("event stream closed"),
                    Err(e) => warn!(error = %e, "event stream error"),
                },
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.inner.reconnect_delay) => {}
            }
        }
        debug!("event stream stopped");
    }

    async fn stream_events(&self) -> Result<()> {
        let last_event_id = self.inner.cursor.lock().await.last_event_id();
        let mut request = self
            .inner
            .http
            .get(self.inner.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(COOKIE, &self.inner.cookie);
        if last_event_id > 0 {
            request = request.header("Last-Event-ID", last_event_id.to_string());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                url: self.inner.url.to_string(),
            });
        }
        info!(url = %self.inner.url, "event stream connected");

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = stream.next().await {
            for event in decoder.push(&chunk?) {
                self.handle_event(event).await;
            }
        }
        Ok(())
    }

    async fn handle_event(&self, event: SseEvent) {
        if let Some(id) = event.id.as_deref().and_then(|id| id.trim().parse().ok()) {
            self.inner.cursor.lock().await.record(id);
        }
        match serde_json::from_str::<ChannelResponse>(&event.data) {
            Ok(response) => self.dispatch(response),
            Err(e) => warn!(error = %e, data = %event.data, "unrecognized channel event"),
        }
    }

    fn dispatch(&self, response: ChannelResponse) {
        match response {
            ChannelResponse::Poke { id, ok, err } => {
                let outcome = match (ok, err) {
                    (Some(_), _) => Ok(()),
                    (None, Some(err)) => Err(Error::PokeRejected(render_err(err))),
                    (None, None) => {
                        warn!(id, "invalid poke response");
                        Err(Error::PokeRejected("invalid poke response".to_string()))
                    }
                };
                match self.inner.pokes.remove(&id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(outcome);
                    }
                    None => warn!(id, "poke response for unknown id"),
                }
            }
            ChannelResponse::Subscribe { id, err: Some(err), .. } => {
                match self.inner.subscriptions.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(SubscriptionEvent::Failed(render_err(err)));
                    }
                    None => warn!(id, "subscribe response for unknown id"),
                }
            }
            ChannelResponse::Subscribe { id, .. } => debug!(id, "subscription acknowledged"),
            ChannelResponse::Diff { id, json } => {
                let delivered = self
                    .inner
                    .subscriptions
                    .get(&id)
                    .map(|tx| tx.send(SubscriptionEvent::Diff(json)).is_ok());
                match delivered {
                    Some(true) => {}
                    Some(false) => {
                        debug!(id, "subscriber gone");
                        self.inner.subscriptions.remove(&id);
                    }
                    None => warn!(id, "diff for unknown subscription"),
                }
            }
            ChannelResponse::Quit { id } => match self.inner.subscriptions.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(SubscriptionEvent::Quit);
                }
                None => warn!(id, "quit for unknown subscription"),
            },
        }
    }
}

/// Current time in milliseconds and six random hex digits.
fn new_uid() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), &random[..6])
}
