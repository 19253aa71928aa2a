//! Public API facade for shapedb.
//!
//! Re-exports the pieces an embedding server needs: the document store and
//! its collections, the shaper, the register-based execution engine, and the
//! replication logger with its dumpers. Integration tests exercising the
//! whole stack live in this crate's `tests/` directory.

pub use shapedb_error::{ErrorCode, Result, ShapeDbError};
pub use shapedb_types::{
    AttributeId, CollectionId, DatafileId, DocValue, PathId, ServerId, ShapeId, Tick, TickSource,
    TransactionId,
};

pub use shapedb_shaper::{Shaper, ShapedValue};

pub use shapedb_store::{
    CapConstraint, Collection, CollectionKind, DatafileSnapshot, DdlEvent, DocOpKind,
    DocumentStore, EdgeRef, LoggedOp, Marker, MarkerBody, MutationObserver, Transaction,
};

pub use shapedb_exec::{
    compare_doc_values, AqlValue, BinOp, ExecutionBlock, Expr, ItemBlock, KillHandle, NodeKind,
    PlanNode, Query, QueryContext, RegisterId, SortCriterion, DEFAULT_BATCH, REMAINING_UNKNOWN,
};

pub use shapedb_repl::{
    ClientInfo, DumpResult, LoggerConfig, LoggerState, ReplicationEventType, ReplicationLogger,
    CONTENT_TYPE_DUMP, REPLICATION_COLLECTION,
};
