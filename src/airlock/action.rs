//! JSON shapes exchanged on a channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An action PUT to the channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ChannelAction {
    Poke {
        id: u64,
        ship: String,
        app: String,
        mark: String,
        json: Value,
    },
    Subscribe {
        id: u64,
        ship: String,
        app: String,
        path: String,
    },
    Unsubscribe {
        id: u64,
        subscription: u64,
    },
    /// Clears events up to and including `event_id` from the ship's queue
    Ack {
        #[serde(rename = "event-id")]
        event_id: u64,
    },
}

/// A message carried in the `data` of a channel event
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "response", rename_all = "lowercase")]
pub enum ChannelResponse {
    Poke {
        id: u64,
        #[serde(default)]
        ok: Option<Value>,
        #[serde(default)]
        err: Option<Value>,
    },
    Subscribe {
        id: u64,
        #[serde(default)]
        ok: Option<Value>,
        #[serde(default)]
        err: Option<Value>,
    },
    Diff {
        id: u64,
        json: Value,
    },
    Quit {
        id: u64,
    },
}

/// Render an `err` payload (usually a printed tang) as text.
pub(crate) fn render_err(err: Value) -> String {
    match err {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
