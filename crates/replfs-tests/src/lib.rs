//! replfs end-to-end tests.
//!
//! [`TestCluster`] runs a real file server and real storage nodes on
//! ephemeral localhost ports; the test modules drive them through the
//! client library.

pub mod harness;

pub use harness::{TestCluster, TestNode};

#[cfg(test)]
mod recovery_tests;
#[cfg(test)]
mod replication_tests;
#[cfg(test)]
mod transfer_tests;
