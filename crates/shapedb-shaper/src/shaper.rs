//! The shaper facade: attribute/shape creation, shaping and unshaping.

use std::sync::Arc;

use parking_lot::RwLock;
use shapedb_error::{Result, ShapeDbError};
use shapedb_types::{AttributeId, DocValue, PathId, ShapeId};

use crate::accessor::{Accessor, PathRegistry};
use crate::attribute::AttributeRegistry;
use crate::shape::{Shape, ShapeKind, ShapeRegistry};
use crate::shaped::{
    SHORT_STRING_MAX, ShapedValue, encode_short_string, write_u32, write_u64,
};

/// Well-known ids of the basic shapes registered at construction.
pub(crate) const SID_NULL: ShapeId = ShapeId(1);
pub(crate) const SID_BOOLEAN: ShapeId = ShapeId(2);
pub(crate) const SID_NUMBER: ShapeId = ShapeId(3);
pub(crate) const SID_SHORT_STRING: ShapeId = ShapeId(4);
pub(crate) const SID_LONG_STRING: ShapeId = ShapeId(5);
pub(crate) const SID_LIST: ShapeId = ShapeId(6);

/// Durable persistence of attribute and shape definitions.
///
/// Implemented by the document store: definitions become markers in the
/// owning collection's datafiles and are replayed before any document
/// marker when the collection is reopened. The write happens *before* the
/// new id is exposed, so a failed write never leaks a partial id.
pub trait DefinitionSink: Send + Sync {
    fn persist_attribute(&self, aid: AttributeId, name: &str) -> Result<()>;
    fn persist_shape(&self, shape: &Shape) -> Result<()>;
}

/// Sink that persists nothing. For tests and transient shapers.
#[derive(Debug, Default)]
pub struct NullSink;

impl DefinitionSink for NullSink {
    fn persist_attribute(&self, _aid: AttributeId, _name: &str) -> Result<()> {
        Ok(())
    }
    fn persist_shape(&self, _shape: &Shape) -> Result<()> {
        Ok(())
    }
}

/// The shape registry for one database.
///
/// Dictionaries are append-only: creation takes the write side of one lock
/// per dictionary (serializing the write-if-absent race); lookups take read
/// guards and never block each other.
pub struct Shaper {
    attributes: RwLock<AttributeRegistry>,
    shapes: RwLock<ShapeRegistry>,
    paths: RwLock<PathRegistry>,
    accessors: RwLock<std::collections::HashMap<(ShapeId, PathId), Option<Arc<Accessor>>>>,
    sink: Arc<dyn DefinitionSink>,
}

impl std::fmt::Debug for Shaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shaper")
            .field("attributes", &self.attributes.read().len())
            .finish_non_exhaustive()
    }
}

impl Shaper {
    #[must_use]
    pub fn new(sink: Arc<dyn DefinitionSink>) -> Self {
        Self {
            attributes: RwLock::new(AttributeRegistry::default()),
            shapes: RwLock::new(ShapeRegistry::with_basics()),
            paths: RwLock::new(PathRegistry::default()),
            accessors: RwLock::new(std::collections::HashMap::new()),
            sink,
        }
    }

    /// A shaper that persists nothing; used by tests and scratch queries.
    #[must_use]
    pub fn transient() -> Self {
        Self::new(Arc::new(NullSink))
    }

    // === Attributes ===

    /// Look up or durably create the attribute id for `name`.
    pub fn find_or_create_attribute_id(&self, name: &str) -> Result<AttributeId> {
        if let Some(aid) = self.attributes.read().lookup_id(name) {
            return Ok(aid);
        }
        let mut attributes = self.attributes.write();
        // Another writer may have won the race while we upgraded.
        if let Some(aid) = attributes.lookup_id(name) {
            return Ok(aid);
        }
        let aid = attributes.peek_next_aid();
        self.sink.persist_attribute(aid, name)?;
        let assigned = attributes.insert_new(name);
        debug_assert_eq!(assigned, aid);
        tracing::debug!(%aid, name, "created attribute");
        Ok(aid)
    }

    #[must_use]
    pub fn lookup_attribute_id(&self, name: &str) -> Option<AttributeId> {
        self.attributes.read().lookup_id(name)
    }

    #[must_use]
    pub fn lookup_attribute_name(&self, aid: AttributeId) -> Option<String> {
        self.attributes.read().lookup_name(aid).map(str::to_owned)
    }

    /// The attribute's weight; unknown aids get the minimal sentinel and
    /// therefore sort first.
    #[must_use]
    pub fn lookup_attribute_weight(&self, aid: AttributeId) -> i64 {
        self.attributes.read().lookup_weight(aid)
    }

    /// Re-register a persisted attribute during datafile replay.
    pub fn replay_attribute(&self, aid: AttributeId, name: &str) {
        self.attributes.write().insert_replayed(aid, name);
    }

    // === Shapes ===

    /// Structural-equality lookup of `kind`, creating (and durably
    /// persisting) it on a miss when `create` is set.
    ///
    /// Returns `Ok(None)` only when `create` is false and the shape is
    /// unknown; callers must distinguish that from a hard failure.
    pub fn find_or_create_shape(
        &self,
        kind: &ShapeKind,
        create: bool,
    ) -> Result<Option<Arc<Shape>>> {
        if let Some(shape) = self.shapes.read().lookup_by_kind(kind) {
            return Ok(Some(shape));
        }
        if !create {
            return Ok(None);
        }
        let mut shapes = self.shapes.write();
        if let Some(shape) = shapes.lookup_by_kind(kind) {
            return Ok(Some(shape));
        }
        let sid = shapes.peek_next_sid();
        self.sink.persist_shape(&Shape {
            sid,
            kind: kind.clone(),
        })?;
        let shape = shapes.insert_new(kind.clone());
        debug_assert_eq!(shape.sid, sid);
        tracing::debug!(%sid, "created shape");
        Ok(Some(shape))
    }

    #[must_use]
    pub fn lookup_shape(&self, sid: ShapeId) -> Option<Arc<Shape>> {
        self.shapes.read().lookup_by_sid(sid)
    }

    /// Re-register a persisted shape during datafile replay.
    pub fn replay_shape(&self, shape: Shape) {
        self.shapes.write().insert_replayed(shape);
    }

    // === Shaping ===

    /// Convert a generic document value into its shaped binary form,
    /// creating any shapes and attribute ids it needs.
    pub fn shape(&self, value: &DocValue) -> Result<ShapedValue> {
        match value {
            DocValue::Null => Ok(ShapedValue {
                sid: SID_NULL,
                data: Vec::new(),
            }),
            DocValue::Bool(b) => Ok(ShapedValue {
                sid: SID_BOOLEAN,
                data: vec![u8::from(*b)],
            }),
            DocValue::Number(n) => Ok(ShapedValue {
                sid: SID_NUMBER,
                data: n.to_bits().to_le_bytes().to_vec(),
            }),
            DocValue::String(s) if s.len() <= SHORT_STRING_MAX => Ok(ShapedValue {
                sid: SID_SHORT_STRING,
                data: encode_short_string(s),
            }),
            DocValue::String(s) => {
                let mut data = Vec::with_capacity(4 + s.len());
                #[allow(clippy::cast_possible_truncation)]
                write_u32(&mut data, s.len() as u32);
                data.extend_from_slice(s.as_bytes());
                Ok(ShapedValue {
                    sid: SID_LONG_STRING,
                    data,
                })
            }
            DocValue::List(items) => self.shape_list(items),
            DocValue::Object(attrs) => self.shape_object(attrs),
        }
    }

    /// Decode a shaped value back into its generic form.
    pub fn unshape(&self, shaped: &ShapedValue) -> Result<DocValue> {
        crate::shaped::decode(self, shaped.sid, &shaped.data)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shape_list(&self, items: &[DocValue]) -> Result<ShapedValue> {
        let shaped: Vec<ShapedValue> = items
            .iter()
            .map(|item| self.shape(item))
            .collect::<Result<_>>()?;

        let homogeneous_sid = match shaped.first() {
            Some(first) if shaped.iter().all(|s| s.sid == first.sid) => Some(first.sid),
            _ => None,
        };

        if let Some(element) = homogeneous_sid {
            let element_shape = self.lookup_shape(element).ok_or(ShapeDbError::NotFound {
                what: "shape",
                name: element.to_string(),
            })?;
            if let Some(element_size) = element_shape.kind.fixed_size() {
                let kind = ShapeKind::HomogeneousSizedList {
                    element,
                    element_size,
                };
                let shape = self.must_create(&kind)?;
                let mut data = Vec::new();
                write_u32(&mut data, shaped.len() as u32);
                for s in &shaped {
                    data.extend_from_slice(&s.data);
                }
                return Ok(ShapedValue {
                    sid: shape.sid,
                    data,
                });
            }

            let kind = ShapeKind::HomogeneousList { element };
            let shape = self.must_create(&kind)?;
            let mut data = Vec::new();
            write_u32(&mut data, shaped.len() as u32);
            let mut offset = 0u32;
            for s in &shaped {
                write_u32(&mut data, offset);
                offset += s.data.len() as u32;
            }
            write_u32(&mut data, offset);
            for s in &shaped {
                data.extend_from_slice(&s.data);
            }
            return Ok(ShapedValue {
                sid: shape.sid,
                data,
            });
        }

        // Heterogeneous (or empty) list: the one basic list shape, element
        // sids in the payload.
        let mut data = Vec::new();
        write_u32(&mut data, shaped.len() as u32);
        for s in &shaped {
            write_u64(&mut data, s.sid.get());
        }
        let mut offset = 0u32;
        for s in &shaped {
            write_u32(&mut data, offset);
            offset += s.data.len() as u32;
        }
        write_u32(&mut data, offset);
        for s in &shaped {
            data.extend_from_slice(&s.data);
        }
        Ok(ShapedValue {
            sid: SID_LIST,
            data,
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shape_object(&self, attrs: &[(String, DocValue)]) -> Result<ShapedValue> {
        // One entry per attribute; on duplicate names the last value wins.
        let mut entries: Vec<(AttributeId, ShapedValue)> = Vec::with_capacity(attrs.len());
        for (name, value) in attrs {
            let aid = self.find_or_create_attribute_id(name)?;
            let shaped = self.shape(value)?;
            if let Some(existing) = entries.iter_mut().find(|(a, _)| *a == aid) {
                existing.1 = shaped;
            } else {
                entries.push((aid, shaped));
            }
        }

        let mut fixed: Vec<(AttributeId, ShapedValue, u32)> = Vec::new();
        let mut variable: Vec<(AttributeId, ShapedValue)> = Vec::new();
        for (aid, shaped) in entries {
            let shape = self.lookup_shape(shaped.sid).ok_or(ShapeDbError::NotFound {
                what: "shape",
                name: shaped.sid.to_string(),
            })?;
            match shape.kind.fixed_size() {
                Some(size) => fixed.push((aid, shaped, size)),
                None => variable.push((aid, shaped)),
            }
        }
        // Sorting by aid makes the shape independent of insertion order.
        fixed.sort_by_key(|(aid, _, _)| *aid);
        variable.sort_by_key(|(aid, _)| *aid);

        let kind = ShapeKind::Array {
            fixed: fixed.iter().map(|(aid, s, _)| (*aid, s.sid)).collect(),
            variable: variable.iter().map(|(aid, s)| (*aid, s.sid)).collect(),
        };
        let shape = self.must_create(&kind)?;

        let mut data = Vec::new();
        for (_, shaped, size) in &fixed {
            debug_assert_eq!(shaped.data.len(), *size as usize);
            data.extend_from_slice(&shaped.data);
        }
        let mut offset = 0u32;
        for (_, shaped) in &variable {
            write_u32(&mut data, offset);
            offset += shaped.data.len() as u32;
        }
        write_u32(&mut data, offset);
        for (_, shaped) in &variable {
            data.extend_from_slice(&shaped.data);
        }
        Ok(ShapedValue {
            sid: shape.sid,
            data,
        })
    }

    fn must_create(&self, kind: &ShapeKind) -> Result<Arc<Shape>> {
        self.find_or_create_shape(kind, true)?
            .ok_or_else(|| ShapeDbError::invalid_state("shape creation returned no shape"))
    }

    // === Paths ===

    /// Compile a dotted attribute path (`a.b.0.c`) into a stable path id.
    pub fn find_or_create_path(&self, path: &str) -> PathId {
        self.paths.write().find_or_create(path)
    }

    /// Resolve a compiled path against a shaped value.
    ///
    /// The `(sid, pid)` accessor built on first use is cached; later calls
    /// for the same pair skip name resolution entirely. Returns `Ok(None)`
    /// when the path does not exist in the value's shape.
    pub fn extract_sub_value(
        &self,
        shaped: &ShapedValue,
        pid: PathId,
    ) -> Result<Option<ShapedValue>> {
        let accessor = self.accessor_for(shaped.sid, pid)?;
        match accessor {
            None => Ok(None),
            Some(accessor) => Ok(accessor.extract(self, shaped)),
        }
    }

    fn accessor_for(&self, sid: ShapeId, pid: PathId) -> Result<Option<Arc<Accessor>>> {
        if let Some(cached) = self.accessors.read().get(&(sid, pid)) {
            return Ok(cached.clone());
        }
        let legs = self
            .paths
            .read()
            .lookup(pid)
            .ok_or(ShapeDbError::NotFound {
                what: "path",
                name: pid.to_string(),
            })?;
        let built = Accessor::build(self, sid, &legs).map(Arc::new);
        self.accessors.write().insert((sid, pid), built.clone());
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(pairs: &[(&str, DocValue)]) -> DocValue {
        DocValue::Object(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn scalars_use_basic_shapes() {
        let shaper = Shaper::transient();
        assert_eq!(shaper.shape(&DocValue::Null).unwrap().sid, SID_NULL);
        assert_eq!(
            shaper.shape(&DocValue::Bool(true)).unwrap().sid,
            SID_BOOLEAN
        );
        assert_eq!(
            shaper.shape(&DocValue::Number(2.5)).unwrap().sid,
            SID_NUMBER
        );
        assert_eq!(
            shaper.shape(&DocValue::String("hi".to_owned())).unwrap().sid,
            SID_SHORT_STRING
        );
        assert_eq!(
            shaper
                .shape(&DocValue::String("long enough!".to_owned()))
                .unwrap()
                .sid,
            SID_LONG_STRING
        );
    }

    #[test]
    fn shape_identity_ignores_attribute_order() {
        let shaper = Shaper::transient();
        let a = shaper
            .shape(&obj(&[
                ("a", DocValue::Number(1.0)),
                ("b", DocValue::Number(2.0)),
            ]))
            .unwrap();
        let b = shaper
            .shape(&obj(&[
                ("b", DocValue::Number(9.0)),
                ("a", DocValue::Number(8.0)),
            ]))
            .unwrap();
        assert_eq!(a.sid, b.sid);
    }

    #[test]
    fn distinct_structures_get_distinct_shapes() {
        let shaper = Shaper::transient();
        let a = shaper.shape(&obj(&[("a", DocValue::Number(1.0))])).unwrap();
        let b = shaper
            .shape(&obj(&[("a", DocValue::String("long string here".to_owned()))]))
            .unwrap();
        assert_ne!(a.sid, b.sid);
    }

    #[test]
    fn round_trip_objects_and_lists() {
        let shaper = Shaper::transient();
        let doc = obj(&[
            ("flag", DocValue::Bool(false)),
            ("name", DocValue::String("a rather long string".to_owned())),
            (
                "nums",
                DocValue::List(vec![DocValue::Number(1.0), DocValue::Number(2.0)]),
            ),
            (
                "mixed",
                DocValue::List(vec![DocValue::Number(1.0), DocValue::Bool(true)]),
            ),
            ("nested", obj(&[("x", DocValue::Null)])),
        ]);
        let shaped = shaper.shape(&doc).unwrap();
        let back = shaper.unshape(&shaped).unwrap();
        // Attribute order is canonicalized by the shape, so compare as sets.
        let DocValue::Object(mut got) = back else {
            panic!("expected object");
        };
        let DocValue::Object(mut want) = doc else {
            panic!("expected object");
        };
        got.sort_by(|l, r| l.0.cmp(&r.0));
        want.sort_by(|l, r| l.0.cmp(&r.0));
        assert_eq!(got, want);
    }

    #[test]
    fn homogeneous_number_list_is_sized() {
        let shaper = Shaper::transient();
        let shaped = shaper
            .shape(&DocValue::List(vec![
                DocValue::Number(1.0),
                DocValue::Number(2.0),
                DocValue::Number(3.0),
            ]))
            .unwrap();
        let shape = shaper.lookup_shape(shaped.sid).unwrap();
        assert!(matches!(
            shape.kind,
            ShapeKind::HomogeneousSizedList {
                element: SID_NUMBER,
                element_size: 8
            }
        ));
        // count + 3 * 8 bytes, no offset table
        assert_eq!(shaped.data.len(), 4 + 24);
    }

    #[test]
    fn find_without_create_returns_none() {
        let shaper = Shaper::transient();
        let kind = ShapeKind::HomogeneousList {
            element: ShapeId(500),
        };
        assert!(shaper.find_or_create_shape(&kind, false).unwrap().is_none());
        // With create it materializes and is found afterwards without create.
        shaper.find_or_create_shape(&kind, true).unwrap().unwrap();
        assert!(shaper.find_or_create_shape(&kind, false).unwrap().is_some());
    }

    #[test]
    fn extract_sub_value_by_path() {
        let shaper = Shaper::transient();
        let doc = obj(&[
            ("a", obj(&[("b", DocValue::Number(7.0))])),
            ("k", DocValue::String("value of k!!".to_owned())),
        ]);
        let shaped = shaper.shape(&doc).unwrap();

        let pid = shaper.find_or_create_path("a.b");
        let sub = shaper.extract_sub_value(&shaped, pid).unwrap().unwrap();
        assert_eq!(shaper.unshape(&sub).unwrap(), DocValue::Number(7.0));

        let missing = shaper.find_or_create_path("a.zzz");
        assert!(shaper.extract_sub_value(&shaped, missing).unwrap().is_none());

        let pid_k = shaper.find_or_create_path("k");
        let sub = shaper.extract_sub_value(&shaped, pid_k).unwrap().unwrap();
        assert_eq!(
            shaper.unshape(&sub).unwrap(),
            DocValue::String("value of k!!".to_owned())
        );
    }

    #[test]
    fn extract_list_index() {
        let shaper = Shaper::transient();
        let doc = obj(&[(
            "xs",
            DocValue::List(vec![
                DocValue::Number(10.0),
                DocValue::Bool(true),
                DocValue::String("a long trailing string".to_owned()),
            ]),
        )]);
        let shaped = shaper.shape(&doc).unwrap();
        let pid = shaper.find_or_create_path("xs.2");
        let sub = shaper.extract_sub_value(&shaped, pid).unwrap().unwrap();
        assert_eq!(
            shaper.unshape(&sub).unwrap(),
            DocValue::String("a long trailing string".to_owned())
        );
    }
}
