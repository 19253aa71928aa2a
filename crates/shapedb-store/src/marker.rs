//! Markers: the immutable records datafiles are made of.
//!
//! Every durable mutation is one marker with a strictly increasing tick.
//! Document, edge and deletion markers are "data" markers and additionally
//! advance the containing datafile's data-tick range; attribute/shape
//! definitions and transaction boundaries do not.

use shapedb_error::{Result, ShapeDbError};
use shapedb_shaper::Shape;
use shapedb_types::{AttributeId, CollectionId, Tick, TransactionId};
use xxhash_rust::xxh32::xxh32;

/// Seed for marker body checksums.
const CHECKSUM_SEED: u32 = 0x5d1f_00d5;

/// Reference to a document in another collection, as stored in edge markers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EdgeRef {
    pub cid: CollectionId,
    pub key: String,
}

/// The typed payload of a marker.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MarkerBody {
    /// A document insert or update; `rev` equals the marker's tick.
    Document {
        key: String,
        rev: Tick,
        shaped: shapedb_shaper::ShapedValue,
        tid: Option<TransactionId>,
    },
    /// An edge document with its from/to references.
    Edge {
        key: String,
        rev: Tick,
        shaped: shapedb_shaper::ShapedValue,
        from: EdgeRef,
        to: EdgeRef,
        tid: Option<TransactionId>,
    },
    /// A document removal.
    Deletion {
        key: String,
        rev: Tick,
        tid: Option<TransactionId>,
    },
    /// An attribute-name definition, replayed before documents at reopen.
    AttributeDef { aid: AttributeId, name: String },
    /// A shape definition, replayed before documents at reopen.
    ShapeDef { shape: Shape },
    /// Transaction boundary markers.
    TxnBegin { tid: TransactionId },
    TxnCommit { tid: TransactionId },
    TxnAbort { tid: TransactionId },
}

/// One immutable datafile record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Marker {
    pub tick: Tick,
    pub body: MarkerBody,
}

impl Marker {
    /// Whether this marker describes document data (as opposed to a
    /// definition or a transaction boundary).
    #[must_use]
    pub const fn is_data(&self) -> bool {
        matches!(
            self.body,
            MarkerBody::Document { .. } | MarkerBody::Edge { .. } | MarkerBody::Deletion { .. }
        )
    }

    /// The transaction this marker belongs to, if any.
    #[must_use]
    pub const fn tid(&self) -> Option<TransactionId> {
        match &self.body {
            MarkerBody::Document { tid, .. }
            | MarkerBody::Edge { tid, .. }
            | MarkerBody::Deletion { tid, .. } => *tid,
            MarkerBody::TxnBegin { tid }
            | MarkerBody::TxnCommit { tid }
            | MarkerBody::TxnAbort { tid } => Some(*tid),
            MarkerBody::AttributeDef { .. } | MarkerBody::ShapeDef { .. } => None,
        }
    }

    /// The document key, for data markers.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match &self.body {
            MarkerBody::Document { key, .. }
            | MarkerBody::Edge { key, .. }
            | MarkerBody::Deletion { key, .. } => Some(key),
            _ => None,
        }
    }

    /// The document revision, for data markers.
    #[must_use]
    pub const fn rev(&self) -> Option<Tick> {
        match &self.body {
            MarkerBody::Document { rev, .. }
            | MarkerBody::Edge { rev, .. }
            | MarkerBody::Deletion { rev, .. } => Some(*rev),
            _ => None,
        }
    }

    /// The shaped payload, for document and edge markers.
    #[must_use]
    pub const fn shaped(&self) -> Option<&shapedb_shaper::ShapedValue> {
        match &self.body {
            MarkerBody::Document { shaped, .. } | MarkerBody::Edge { shaped, .. } => Some(shaped),
            _ => None,
        }
    }
}

/// The persisted form of a marker: one JSON line with a body checksum.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub(crate) struct PersistedMarker {
    pub tick: Tick,
    pub checksum: u32,
    pub body: MarkerBody,
}

pub(crate) fn body_checksum(body: &MarkerBody) -> u32 {
    let encoded = serde_json::to_vec(body).unwrap_or_default();
    xxh32(&encoded, CHECKSUM_SEED)
}

/// Encode a marker as one persisted JSON line (without trailing newline).
pub(crate) fn encode_line(marker: &Marker) -> Result<Vec<u8>> {
    let persisted = PersistedMarker {
        tick: marker.tick,
        checksum: body_checksum(&marker.body),
        body: marker.body.clone(),
    };
    serde_json::to_vec(&persisted)
        .map_err(|err| ShapeDbError::write_failed(format!("marker encoding: {err}")))
}

/// Decode one persisted line, verifying the checksum.
pub(crate) fn decode_line(collection: &str, line: &[u8]) -> Result<Marker> {
    let persisted: PersistedMarker = serde_json::from_slice(line).map_err(|err| {
        ShapeDbError::CorruptedCollection {
            name: collection.to_owned(),
            detail: format!("unparsable marker line: {err}"),
        }
    })?;
    let computed = body_checksum(&persisted.body);
    if computed != persisted.checksum {
        return Err(ShapeDbError::CorruptedCollection {
            name: collection.to_owned(),
            detail: format!(
                "marker checksum mismatch at tick {}: stored {:08x}, computed {computed:08x}",
                persisted.tick, persisted.checksum
            ),
        });
    }
    Ok(Marker {
        tick: persisted.tick,
        body: persisted.body,
    })
}
