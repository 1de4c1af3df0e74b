//! Client for the urbit HTTP API ("airlock").
//!
//! Actions are PUT to `/~/channel/<uid>` as JSON arrays. Their results, and
//! any subscription updates, come back as server-sent events on a GET of the
//! same URL and have to be acknowledged on a later PUT.

mod action;
mod auth;
mod channel;
mod error;
mod sse;

pub use action::{ChannelAction, ChannelResponse};
pub use auth::{cookie_header, login};
pub use channel::{Channel, EventCursor, SubscriptionEvent};
pub use error::{Error, Result};
pub use sse::{SseDecoder, SseEvent};
