#![warn(missing_docs)]

//! replfs reference storage node: the HTTP interface the file server
//! replicates to, backed by a plain directory, plus optional registration
//! and heartbeats towards a file server.

pub mod api;
pub mod config;
pub mod heartbeat;
pub mod store;

pub use api::NodeApi;
pub use config::NodeConfig;
pub use heartbeat::Heartbeater;
pub use store::NodeStore;
