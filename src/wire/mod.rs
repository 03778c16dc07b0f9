//! External transport layer (spec §6.1): a `Transport`/`Connection` seam
//! that a line-protocol/HTTP/WebSocket multiplexer would implement, plus
//! one concrete native frame listener so the dispatcher has a caller to
//! exercise end-to-end.

pub mod socket_server;
pub mod transport;

pub use socket_server::NativeSocketServer;
pub use transport::{Connection, Frame, Transport};
