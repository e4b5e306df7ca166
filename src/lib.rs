//! Rust client for a real-time relational database server delivering
//! row-level subscription updates over a persistent binary WebSocket
//! session.
//!
//! This crate is the runtime client only: the binary ATN codec, the
//! wire-protocol message set and frame compression, the WebSocket session
//! manager, and the coherent client-side row cache. The schema-driven code
//! generator that turns a module schema into typed row structs and typed
//! table/reducer wrappers is a separate, out-of-scope tool; it calls the
//! byte-level entry points exposed here.

pub mod bsatn;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod protocol;

pub use cache::{ClientCache, EventKind, ObserverHandle, PrimaryKeyExtractor, Row, RowEvent};
pub use config::Config;
pub use connection::{ConnectionState, DbConnection, DbConnectionBuilder, SubscriptionHandle};
pub use error::{Error, Result};
pub use identity::{ConnectionId, Identity, TimeDuration, Timestamp, U128, U256};
