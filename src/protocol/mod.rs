//! The wire-protocol message set: typed client->server and server->client
//! frames (§4.B), and the per-frame/per-delta compression layer (§4.C).

pub mod compression;
pub mod messages;

pub use compression::{decompress_frame, CompressionError, CompressionTag};
pub use messages::*;
