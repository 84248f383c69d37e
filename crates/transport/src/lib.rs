//! blocksync-transport: carries the five remote operations to a server
//!
//! [`TcpClient`] and [`TcpServer`] speak the framed wire protocol over TCP.
//! [`LocalTransport`] calls a [`blocksync_core::Service`] in-process and
//! counts calls, for tests.

pub mod local;
pub mod tcp;

pub use local::{Calls, LocalClient, LocalTransport};
pub use tcp::{DEFAULT_TIMEOUT, TcpClient, TcpServer};
