//! Shared state table core.
//!
//! A shared state table replicates one row per node across a fixed group:
//! every node owns exactly one row, mutates only that row, and holds mirrors
//! of all the others, kept current by one-sided remote writes (or remote
//! reads, depending on the mode). On top of the table, a detection engine
//! continuously evaluates predicates over the mirrored rows and fires
//! user-supplied triggers when they hold.
//!
//! This crate contains the table itself, the derived-column combinator DSL,
//! the detection engine, and the transport contract; wire-level transports
//! live in sibling crates. The API surface is intentionally small: callers
//! build a [`ColumnSet`], hand it to [`Sst::new`] together with a
//! [`Transport`], and then work through the returned handle.

pub mod combinators;
pub mod config;
mod engine;
pub mod error;
pub mod layout;
pub mod predicates;
pub mod row;
pub mod sst;
pub mod table;
pub mod transport;

pub use combinators::{as_row_pred, e, min_of, named, ColumnSet, DerivedColumns, NameEnum, RowPredicate};
pub use config::{Group, Mode, NodeId, SstConfig};
pub use error::SstError;
pub use layout::{RowLayout, SlotDesc};
pub use predicates::{PredFn, PredicateKind, Predicates, TriggerFn};
pub use row::{Row, Scalar, SlotType, SlotValue};
pub use sst::{Phase, Snapshot, Sst, TriggerHandle};
pub use table::TableBuffer;
pub use transport::{LocalHub, LocalTransport, PeerResources, Transport};
