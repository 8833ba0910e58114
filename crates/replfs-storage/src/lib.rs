#![warn(missing_docs)]

//! replfs storage subsystem: the local storage root every coordinator owns,
//! chunked upload assembly and download streaming, directory operations and
//! bounded per-file version history.

pub mod assembler;
pub mod directory;
pub mod error;
pub mod paths;
pub mod reader;
pub mod version;

pub use assembler::{AssemblerConfig, ChunkAssembler, ChunkProgress};
pub use directory::DirEntry;
pub use error::{StorageError, StorageResult};
pub use paths::{normalize_path, StorageRoot};
pub use reader::ChunkReader;
pub use version::{RestoreOutcome, Version, VersionStore, MAX_VERSIONS};
