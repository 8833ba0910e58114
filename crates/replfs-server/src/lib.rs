#![warn(missing_docs)]

//! replfs file server: configuration, the connection protocol messages, the
//! per-connection handler, the accept loop with its background health and
//! recovery tasks, and the client library used by the `rfs` CLI.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod server;

pub use client::{ClientConfig, ReplfsClient, UploadSummary};
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use handler::ConnectionHandler;
pub use message::{ChunkAck, ChunkStatus, Command, ErrorKind, OperationResult, Payload};
pub use server::{FileServer, ServerState};
