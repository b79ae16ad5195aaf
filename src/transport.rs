//! Transport trait for the timing feed

use crate::Result;

/// Opens connections to the timing feed
///
/// Transports abstract over where frames come from (a live WebSocket, a
/// recorded session, a scripted test feed). The connection manager owns one
/// transport and asks it for a fresh connection on every connect and
/// reconnect attempt.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `url`
    ///
    /// The caller bounds this with the configured connect timeout.
    async fn connect(&self, url: &str) -> Result<Box<dyn TransportConnection>>;
}

/// One open connection to the timing feed
#[async_trait::async_trait]
pub trait TransportConnection: Send + 'static {
    /// Get the next text frame
    ///
    /// Returns:
    /// - `Ok(Some(text))` - Frame received
    /// - `Ok(None)` - Peer closed the connection
    /// - `Err(e)` - Connection failed
    async fn next_frame(&mut self) -> Result<Option<String>>;

    /// Send a text frame
    async fn send(&mut self, text: String) -> Result<()>;

    /// Close the connection; errors are not interesting at this point
    async fn close(&mut self);
}
