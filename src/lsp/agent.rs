//! The `%language-server` agent on a ship, reached through a channel.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use super::bridge::ShipLink;
use crate::airlock::{self, Channel, SubscriptionEvent};
use crate::marks::Mark;

pub struct Agent {
    channel: Channel,
    ship: String,
    app: String,
    subscription: Mutex<Option<u64>>,
}

impl Agent {
    pub fn new(channel: Channel, ship: &str, app: &str) -> Self {
        Self {
            channel,
            ship: ship.to_string(),
            app: app.to_string(),
            subscription: Mutex::new(None),
        }
    }

    /// Subscribe to `path`; the subscription is dropped again on [`ShipLink::close`].
    pub async fn subscribe(
        &self,
        path: &str,
    ) -> airlock::Result<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        let (id, updates) = self.channel.subscribe(&self.ship, &self.app, path).await?;
        info!(id, ship = %self.ship, app = %self.app, path, "subscribed");
        *self.subscription.lock().await = Some(id);
        Ok(updates)
    }
}

#[async_trait]
impl ShipLink for Agent {
    async fn poke(&self, mark: Mark, message: Value) -> airlock::Result<()> {
        self.channel
            .poke(&self.ship, &self.app, mark.as_str(), message)
            .await
    }

    async fn close(&self) {
        if let Some(id) = self.subscription.lock().await.take() {
            if let Err(e) = self.channel.unsubscribe(id).await {
                warn!(error = %e, id, "failed to unsubscribe");
            }
        }
        self.channel.close();
    }
}
