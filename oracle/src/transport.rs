//! The three ways a translator reaches the oracle.
//!
//! All drivers share one contract: produce byte streams, serve each one with
//! [`crate::connection::serve_connection`] until the shutdown future
//! resolves, then stop accepting and tear down in-flight connections. They
//! differ only in where the streams come from.

pub mod inherited_fds;
pub mod tcp;
pub mod unix;
