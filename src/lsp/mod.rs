//! LSP front end: answers `initialize` itself and forwards everything else
//! to the `%language-server` agent.

mod agent;
mod bridge;
mod capabilities;
mod server;

pub use agent::Agent;
pub use bridge::{Bridge, BridgeError, BridgeOptions, EditorSink, RpcError, ShipLink};
pub use capabilities::{server_capabilities, TRIGGER_CHARACTERS};
pub use server::{serve, serve_stdio};
