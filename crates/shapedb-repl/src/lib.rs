//! Replication: the mutation event logger and the datafile dumpers.
//!
//! The logger turns every committed mutation and DDL change into an event
//! document inside the `_replication` system collection, keyed by the tick
//! the store assigned to it. Dumpers serve tick ranges of either that event
//! log or a collection's raw markers to follower servers, in resumable
//! chunks that never split a marker.

pub mod dump;
pub mod event;
pub mod logger;

pub use dump::{
    DumpResult, CONTENT_TYPE_DUMP, HEADER_ACTIVE, HEADER_CHECKMORE, HEADER_LASTINCLUDED,
    HEADER_LASTTICK,
};
pub use event::ReplicationEventType;
pub use logger::{
    ClientInfo, LoggerConfig, LoggerState, ReplicationLogger, MIN_LOG_EVENTS, MIN_LOG_SIZE,
    REPLICATION_COLLECTION,
};
