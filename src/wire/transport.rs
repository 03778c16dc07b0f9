//! The transport seam (spec §6.1): line-protocol/HTTP/WebSocket framing is
//! explicitly out of scope, but a multiplexer that adds them would
//! implement this trait rather than reaching into `dispatcher` directly.
//!
//! Nothing in this crate depends on a second implementation existing; the
//! one concrete transport is `socket_server::NativeSocketServer`.

use async_trait::async_trait;

/// One parsed command frame off the wire: the whitespace-separated argument
/// vector `command::parse_frame` already expects.
pub type Frame = Vec<String>;

/// A single client connection: pull frames in, push a JSON response body
/// back out. Transports decide their own framing; only the parsed argument
/// vector and the JSON reply cross this seam.
#[async_trait]
pub trait Connection: Send {
    async fn read_frame(&mut self) -> std::io::Result<Option<Frame>>;
    async fn write_response(&mut self, response: &serde_json::Value) -> std::io::Result<()>;
}

/// A listener that accepts connections and hands each to a handler.
#[async_trait]
pub trait Transport: Send {
    type Conn: Connection;

    async fn accept(&mut self) -> std::io::Result<Self::Conn>;
}
