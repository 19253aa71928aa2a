//! Mutation observation: the hook the replication logger attaches to.
//!
//! The store reports every committed mutation and DDL change through this
//! trait *after* the underlying marker is durably written, so an observer
//! never learns a tick that is not retrievable from the datafiles.

use shapedb_types::{CollectionId, Tick, TransactionId};

use crate::marker::{EdgeRef, Marker, MarkerBody};
use crate::collection::Collection;

/// What a data marker did to its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocOpKind {
    Insert,
    Update,
    Remove,
}

/// One document-level operation, fully resolved for logging.
#[derive(Debug, Clone)]
pub struct LoggedOp {
    pub cid: CollectionId,
    pub collection_name: String,
    pub is_edge: bool,
    pub kind: DocOpKind,
    pub tick: Tick,
    pub key: String,
    pub rev: Tick,
    pub tid: Option<TransactionId>,
    /// The full document for inserts/updates; `None` for removals.
    pub data: Option<serde_json::Value>,
    pub from: Option<EdgeRef>,
    pub to: Option<EdgeRef>,
}

impl LoggedOp {
    /// Build a logged operation from a freshly written data marker.
    pub(crate) fn from_marker(
        collection: &Collection,
        marker: &Marker,
        kind: DocOpKind,
    ) -> Self {
        let (data, from, to) = match &marker.body {
            MarkerBody::Document { shaped, .. } => {
                let value = collection
                    .shaper()
                    .unshape(shaped)
                    .map(|doc| serde_json::Value::from(&doc))
                    .unwrap_or(serde_json::Value::Null);
                (Some(value), None, None)
            }
            MarkerBody::Edge {
                shaped, from, to, ..
            } => {
                let value = collection
                    .shaper()
                    .unshape(shaped)
                    .map(|doc| serde_json::Value::from(&doc))
                    .unwrap_or(serde_json::Value::Null);
                (Some(value), Some(from.clone()), Some(to.clone()))
            }
            _ => (None, None, None),
        };
        Self {
            cid: collection.cid(),
            collection_name: collection.name(),
            is_edge: collection.is_edge(),
            kind,
            tick: marker.tick,
            key: marker.key().unwrap_or_default().to_owned(),
            rev: marker.rev().unwrap_or(Tick::ZERO),
            tid: marker.tid(),
            data,
            from,
            to,
        }
    }
}

/// A DDL change worth replicating.
#[derive(Debug, Clone)]
pub enum DdlEvent {
    CollectionCreate {
        cid: CollectionId,
        name: String,
        is_edge: bool,
    },
    CollectionDrop {
        cid: CollectionId,
        name: String,
    },
    CollectionRename {
        cid: CollectionId,
        old_name: String,
        new_name: String,
    },
    CollectionChange {
        cid: CollectionId,
        name: String,
        properties: serde_json::Value,
    },
    IndexCreate {
        cid: CollectionId,
        name: String,
        index: serde_json::Value,
    },
    IndexDrop {
        cid: CollectionId,
        name: String,
        index_id: u64,
    },
}

impl DdlEvent {
    #[must_use]
    pub fn collection_name(&self) -> &str {
        match self {
            Self::CollectionCreate { name, .. }
            | Self::CollectionDrop { name, .. }
            | Self::CollectionChange { name, .. }
            | Self::IndexCreate { name, .. }
            | Self::IndexDrop { name, .. } => name,
            Self::CollectionRename { old_name, .. } => old_name,
        }
    }
}

/// Consumer of mutation notifications. Implemented by the replication
/// logger; a store without an observer skips all notification work.
pub trait MutationObserver: Send + Sync {
    /// One standalone (non-transactional) document operation.
    fn document_op(&self, op: &LoggedOp);

    /// A committed transaction with all its operations, in write order.
    fn transaction_committed(&self, tid: TransactionId, ops: &[LoggedOp]);

    /// A DDL change (collection/index lifecycle).
    fn ddl(&self, event: &DdlEvent);
}
