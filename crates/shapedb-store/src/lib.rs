//! Document storage: collections of shaped documents over append-only,
//! tick-ordered datafiles, plus the transaction layer and the observer
//! seam that feeds replication.
//!
//! Every mutation becomes a marker carrying the process-wide tick that
//! doubles as the document revision. Markers are persisted before they
//! become visible, so the datafiles are a complete, replayable history:
//! reopening a store rebuilds each collection's shaper dictionaries and
//! primary index by walking its datafiles in order.

pub mod collection;
pub mod datafile;
pub mod marker;
pub mod observer;
pub mod store;
pub mod transaction;

pub use collection::{CapConstraint, Collection, CollectionKind};
pub use datafile::{Datafile, DatafileSnapshot};
pub use marker::{EdgeRef, Marker, MarkerBody};
pub use observer::{DdlEvent, DocOpKind, LoggedOp, MutationObserver};
pub use store::DocumentStore;
pub use transaction::Transaction;
