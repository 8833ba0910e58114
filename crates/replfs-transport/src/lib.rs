#![warn(missing_docs)]

//! replfs transport subsystem: length-prefixed frames over TCP, checksummed
//! file chunks, and the retry executor shared by every remote operation.

pub mod checksum;
pub mod chunk;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod tcp;

pub use checksum::{sha256_hex, verify_sha256};
pub use chunk::{chunk_count, is_valid_file_id, split_into_chunks, FileChunk, DEFAULT_CHUNK_SIZE, MAX_FILE_ID_LEN};
pub use error::{Result, TransportError};
pub use protocol::{Frame, FrameHeader, Opcode, FRAME_HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE};
pub use retry::{Backoff, RetryConfig, RetryExecutor, RetryOutcome, Transient};
pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};
