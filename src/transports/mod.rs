//! Transport implementations
//!
//! - [`WebSocketTransport`]: live feeds over `ws://`/`wss://` (feature `websocket`)
//! - [`ReplayTransport`]: recorded feeds, one frame per line

mod replay;
#[cfg(feature = "websocket")]
mod websocket;

pub use replay::{ReplayConnection, ReplayTransport};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport};
