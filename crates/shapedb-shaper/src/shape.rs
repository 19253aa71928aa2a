//! Shape descriptors and the content-addressed shape dictionary.

use std::collections::HashMap;
use std::sync::Arc;

use shapedb_types::{AttributeId, ShapeId};

/// The structural type of a document value.
///
/// Array (object) shapes record, per attribute, the attribute id and the
/// sub-shape id, partitioned into fixed-size and variable-size entries so
/// payload offsets can be computed from the shape alone. Entries within
/// each partition are sorted by attribute id, which makes shapes
/// independent of a document's physical attribute order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ShapeKind {
    Null,
    Boolean,
    Number,
    /// Strings of at most [`crate::shaped::SHORT_STRING_MAX`] bytes, stored
    /// in a fixed 8-byte slot.
    ShortString,
    LongString,
    /// Heterogeneous list; element shape ids are stored in the payload.
    List,
    /// All elements share one shape of variable payload size.
    HomogeneousList { element: ShapeId },
    /// All elements share one shape of fixed payload size; no offset table.
    HomogeneousSizedList { element: ShapeId, element_size: u32 },
    /// Object: fixed-size entries first, then variable-size entries.
    Array {
        fixed: Vec<(AttributeId, ShapeId)>,
        variable: Vec<(AttributeId, ShapeId)>,
    },
}

impl ShapeKind {
    /// The payload size in bytes if this kind has a fixed-size payload.
    pub const fn fixed_size(&self) -> Option<u32> {
        match self {
            Self::Null => Some(0),
            Self::Boolean => Some(1),
            Self::Number => Some(8),
            Self::ShortString => Some(8),
            _ => None,
        }
    }

    /// Canonical bytes used as the dictionary key for content addressing.
    /// The shape id is deliberately not part of the encoding.
    pub(crate) fn dictionary_key(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A registered shape: content-addressed kind plus its assigned id.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Shape {
    pub sid: ShapeId,
    pub kind: ShapeKind,
}

/// Shape ids below this are reserved for the basic shapes registered at
/// construction; user-defined shapes start above it.
pub(crate) const FIRST_USER_SID: u64 = 7;

#[derive(Debug)]
pub(crate) struct ShapeRegistry {
    by_key: HashMap<Vec<u8>, Arc<Shape>>,
    by_sid: HashMap<ShapeId, Arc<Shape>>,
    next_sid: u64,
}

impl ShapeRegistry {
    /// A registry pre-populated with the basic shapes. Basic shapes have
    /// well-known ids and are never persisted as markers.
    pub(crate) fn with_basics() -> Self {
        let mut registry = Self {
            by_key: HashMap::new(),
            by_sid: HashMap::new(),
            next_sid: FIRST_USER_SID - 1,
        };
        let basics = [
            ShapeKind::Null,
            ShapeKind::Boolean,
            ShapeKind::Number,
            ShapeKind::ShortString,
            ShapeKind::LongString,
            ShapeKind::List,
        ];
        for (index, kind) in basics.into_iter().enumerate() {
            let sid = ShapeId(index as u64 + 1);
            registry.insert(Arc::new(Shape { sid, kind }));
        }
        registry
    }

    pub(crate) fn lookup_by_kind(&self, kind: &ShapeKind) -> Option<Arc<Shape>> {
        self.by_key.get(&kind.dictionary_key()).cloned()
    }

    pub(crate) fn lookup_by_sid(&self, sid: ShapeId) -> Option<Arc<Shape>> {
        self.by_sid.get(&sid).cloned()
    }

    /// The sid that would be assigned to the next new shape.
    pub(crate) fn peek_next_sid(&self) -> ShapeId {
        ShapeId(self.next_sid + 1)
    }

    /// Register a new shape under a freshly assigned sid. The caller has
    /// already checked absence and persisted the definition marker.
    pub(crate) fn insert_new(&mut self, kind: ShapeKind) -> Arc<Shape> {
        self.next_sid += 1;
        let shape = Arc::new(Shape {
            sid: ShapeId(self.next_sid),
            kind,
        });
        self.insert(Arc::clone(&shape));
        shape
    }

    /// Re-insert a persisted shape during datafile replay, preserving its
    /// original sid.
    pub(crate) fn insert_replayed(&mut self, shape: Shape) -> Arc<Shape> {
        if shape.sid.get() > self.next_sid {
            self.next_sid = shape.sid.get();
        }
        let shape = Arc::new(shape);
        self.insert(Arc::clone(&shape));
        shape
    }

    fn insert(&mut self, shape: Arc<Shape>) {
        self.by_key
            .insert(shape.kind.dictionary_key(), Arc::clone(&shape));
        self.by_sid.insert(shape.sid, shape);
    }
}
