//! TCP plumbing for the shared state table.
//!
//! Two pieces: the [`Bootstrap`] byte-stream mesh (node-id exchange,
//! connection-record exchange, `sync` barrier) and [`TcpTransport`], a
//! socket-backed stand-in for the one-sided transport that the table's core
//! is written against. Real RDMA hardware would plug in behind the same
//! `sst_core::Transport` trait; everything above the trait is identical.

pub mod bootstrap;
mod frame;
pub mod members;
pub mod transport;

pub use bootstrap::{Bootstrap, ConnectionData};
pub use members::{format_members, parse_members};
pub use transport::TcpTransport;
