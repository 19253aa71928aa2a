//! Replication event types and their wire codes.
//!
//! Every entry in the replication log and every line in a dump carries one
//! of these numeric type codes. The codes are part of the wire format that
//! follower clients parse, so they never change meaning once assigned.

use shapedb_store::{DdlEvent, DocOpKind, LoggedOp};

/// Numeric type code of a replication log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReplicationEventType {
    LoggerStopped = 1000,
    LoggerStarted = 1001,

    CollectionCreate = 2000,
    CollectionDrop = 2001,
    CollectionRename = 2002,
    CollectionChange = 2003,

    IndexCreate = 2100,
    IndexDrop = 2101,

    TransactionStart = 2200,
    TransactionCommit = 2201,

    MarkerDocument = 2300,
    MarkerEdge = 2301,
    MarkerRemove = 2302,
}

impl ReplicationEventType {
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// The event type a document-level operation maps to.
    #[must_use]
    pub const fn for_doc_op(kind: DocOpKind, is_edge: bool) -> Self {
        match kind {
            DocOpKind::Remove => Self::MarkerRemove,
            DocOpKind::Insert | DocOpKind::Update => {
                if is_edge {
                    Self::MarkerEdge
                } else {
                    Self::MarkerDocument
                }
            }
        }
    }

    /// The event type a DDL change maps to.
    #[must_use]
    pub const fn for_ddl(event: &DdlEvent) -> Self {
        match event {
            DdlEvent::CollectionCreate { .. } => Self::CollectionCreate,
            DdlEvent::CollectionDrop { .. } => Self::CollectionDrop,
            DdlEvent::CollectionRename { .. } => Self::CollectionRename,
            DdlEvent::CollectionChange { .. } => Self::CollectionChange,
            DdlEvent::IndexCreate { .. } => Self::IndexCreate,
            DdlEvent::IndexDrop { .. } => Self::IndexDrop,
        }
    }
}

impl std::fmt::Display for ReplicationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// JSON payload of a document-level operation, shared by the event logger
/// and the datafile dumpers. Numeric ids are rendered as decimal strings so
/// JSON parsers without 64-bit integer support stay exact.
#[must_use]
pub fn doc_op_payload(op: &LoggedOp) -> serde_json::Value {
    let mut entry = serde_json::Map::new();
    entry.insert("cid".into(), op.cid.to_string().into());
    entry.insert("cname".into(), op.collection_name.clone().into());
    if let Some(tid) = op.tid {
        entry.insert("tid".into(), tid.to_string().into());
    }
    entry.insert("key".into(), op.key.clone().into());
    entry.insert("rev".into(), op.rev.to_string().into());
    if let Some(data) = &op.data {
        let mut doc = serde_json::Map::new();
        doc.insert("_key".into(), op.key.clone().into());
        doc.insert("_rev".into(), op.rev.to_string().into());
        if let Some(from) = &op.from {
            doc.insert("_from".into(), format!("{}/{}", from.cid, from.key).into());
        }
        if let Some(to) = &op.to {
            doc.insert("_to".into(), format!("{}/{}", to.cid, to.key).into());
        }
        if let serde_json::Value::Object(attrs) = data {
            for (name, value) in attrs {
                doc.insert(name.clone(), value.clone());
            }
        }
        entry.insert("data".into(), serde_json::Value::Object(doc));
    }
    serde_json::Value::Object(entry)
}

/// JSON payload of a DDL event.
#[must_use]
pub fn ddl_payload(event: &DdlEvent) -> serde_json::Value {
    match event {
        DdlEvent::CollectionCreate { cid, name, is_edge } => serde_json::json!({
            "cid": cid.to_string(),
            "collection": {
                "cid": cid.to_string(),
                "name": name,
                "type": if *is_edge { 3 } else { 2 },
            },
        }),
        DdlEvent::CollectionDrop { cid, .. } => serde_json::json!({
            "cid": cid.to_string(),
        }),
        DdlEvent::CollectionRename { cid, new_name, .. } => serde_json::json!({
            "cid": cid.to_string(),
            "collection": { "name": new_name },
        }),
        DdlEvent::CollectionChange {
            cid,
            name,
            properties,
        } => serde_json::json!({
            "cid": cid.to_string(),
            "collection": { "name": name, "properties": properties },
        }),
        DdlEvent::IndexCreate { cid, index, .. } => serde_json::json!({
            "cid": cid.to_string(),
            "index": index,
        }),
        DdlEvent::IndexDrop { cid, index_id, .. } => serde_json::json!({
            "cid": cid.to_string(),
            "id": index_id.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_op_codes_distinguish_edges_and_removals() {
        assert_eq!(
            ReplicationEventType::for_doc_op(DocOpKind::Insert, false).code(),
            2300
        );
        assert_eq!(
            ReplicationEventType::for_doc_op(DocOpKind::Update, true).code(),
            2301
        );
        assert_eq!(
            ReplicationEventType::for_doc_op(DocOpKind::Remove, true).code(),
            2302
        );
    }

    #[test]
    fn logger_markers_use_the_1000_range() {
        assert_eq!(ReplicationEventType::LoggerStopped.code(), 1000);
        assert_eq!(ReplicationEventType::LoggerStarted.code(), 1001);
    }
}
