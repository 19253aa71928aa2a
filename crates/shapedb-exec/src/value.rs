//! Values held in item block registers.
//!
//! A register cell either carries a materialized JSON-like value, a shaped
//! document still living in its collection's datafiles, or a DOCVEC (the
//! stacked result blocks of a subquery). Shaped values stay unmaterialized
//! for as long as possible; materialization resolves them through the
//! owning collection's shaper and injects the system attributes.

use std::cmp::Ordering;
use std::sync::Arc;

use shapedb_error::{Result, ShapeDbError};
use shapedb_store::{DocumentStore, Marker, MarkerBody};
use shapedb_types::{CollectionId, DocValue};

use crate::block::ItemBlock;

#[derive(Debug, Clone)]
pub enum AqlValue {
    /// A self-contained value.
    Json(Arc<DocValue>),
    /// A document resident in a collection, referenced by its marker. The
    /// collection id routes materialization to the right shaper.
    Shaped {
        cid: CollectionId,
        marker: Arc<Marker>,
    },
    /// A subquery result: the concatenation of its output blocks. Register 0
    /// of each block carries the projected value.
    Docvec(Arc<Vec<ItemBlock>>),
}

impl AqlValue {
    pub fn json(value: DocValue) -> Self {
        Self::Json(Arc::new(value))
    }

    /// Truthiness without materialization. Shaped values are documents
    /// (objects) and docvecs are lists, both always true.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Self::Json(v) => v.is_true(),
            Self::Shaped { .. } | Self::Docvec(_) => true,
        }
    }

    /// Resolve to a plain [`DocValue`]. Shaped documents unshape through
    /// their collection's shaper and gain `_key`, `_rev` and, for edges,
    /// `_from`/`_to`.
    pub fn materialize(&self, store: &DocumentStore) -> Result<DocValue> {
        match self {
            Self::Json(v) => Ok((**v).clone()),
            Self::Shaped { cid, marker } => materialize_marker(store, *cid, marker),
            Self::Docvec(blocks) => {
                let mut items = Vec::new();
                for block in blocks.iter() {
                    for row in 0..block.rows() {
                        match block.get(row, 0) {
                            Some(cell) => items.push(cell.materialize(store)?),
                            None => items.push(DocValue::Null),
                        }
                    }
                }
                Ok(DocValue::List(items))
            }
        }
    }
}

fn edge_handle(store: &DocumentStore, edge: &shapedb_store::EdgeRef) -> String {
    let name = store
        .collection_by_id(edge.cid)
        .map_or_else(|| "_unknown".to_owned(), |c| c.name());
    format!("{name}/{}", edge.key)
}

fn materialize_marker(
    store: &DocumentStore,
    cid: CollectionId,
    marker: &Marker,
) -> Result<DocValue> {
    let collection = store
        .collection_by_id(cid)
        .ok_or_else(|| ShapeDbError::collection_not_found(format!("#{cid}")))?;
    let shaped = marker.shaped().ok_or_else(|| {
        ShapeDbError::invalid_state(format!(
            "marker at tick {} carries no document payload",
            marker.tick
        ))
    })?;
    let body = collection.shaper().unshape(shaped)?;

    let mut attrs: Vec<(String, DocValue)> = Vec::new();
    if let Some(key) = marker.key() {
        attrs.push(("_key".to_owned(), DocValue::String(key.to_owned())));
    }
    if let Some(rev) = marker.rev() {
        attrs.push(("_rev".to_owned(), DocValue::String(rev.to_string())));
    }
    if let MarkerBody::Edge { from, to, .. } = &marker.body {
        attrs.push(("_from".to_owned(), DocValue::String(edge_handle(store, from))));
        attrs.push(("_to".to_owned(), DocValue::String(edge_handle(store, to))));
    }
    if let DocValue::Object(body_attrs) = body {
        attrs.extend(body_attrs);
    }
    Ok(DocValue::Object(attrs))
}

fn type_rank(value: &DocValue) -> u8 {
    match value {
        DocValue::Null => 0,
        DocValue::Bool(_) => 1,
        DocValue::Number(_) => 2,
        DocValue::String(_) => 3,
        DocValue::List(_) => 4,
        DocValue::Object(_) => 5,
    }
}

/// Total order over materialized values, consistent with the shaper's
/// shaped-value order: type rank first, then value; lists element-wise with
/// the shorter list less; objects attribute-wise after sorting attributes
/// by name.
#[must_use]
pub fn compare_doc_values(left: &DocValue, right: &DocValue) -> Ordering {
    let rank = type_rank(left).cmp(&type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }
    match (left, right) {
        (DocValue::Null, DocValue::Null) => Ordering::Equal,
        (DocValue::Bool(a), DocValue::Bool(b)) => a.cmp(b),
        (DocValue::Number(a), DocValue::Number(b)) => a.total_cmp(b),
        (DocValue::String(a), DocValue::String(b)) => shapedb_shaper::compare_strings(a, b),
        (DocValue::List(a), DocValue::List(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let c = compare_doc_values(x, y);
                if c != Ordering::Equal {
                    return c;
                }
            }
            a.len().cmp(&b.len())
        }
        (DocValue::Object(a), DocValue::Object(b)) => {
            let mut a: Vec<&(String, DocValue)> = a.iter().collect();
            let mut b: Vec<&(String, DocValue)> = b.iter().collect();
            a.sort_by(|x, y| x.0.cmp(&y.0));
            b.sort_by(|x, y| x.0.cmp(&y.0));
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let c = ka.cmp(kb);
                if c != Ordering::Equal {
                    return c;
                }
                let c = compare_doc_values(va, vb);
                if c != Ordering::Equal {
                    return c;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => unreachable!("ranks matched"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_of_register_values() {
        assert!(!AqlValue::json(DocValue::Null).is_true());
        assert!(!AqlValue::json(DocValue::Number(0.0)).is_true());
        assert!(AqlValue::json(DocValue::List(vec![])).is_true());
        assert!(AqlValue::Docvec(Arc::new(Vec::new())).is_true());
    }

    #[test]
    fn cross_type_order_follows_rank() {
        let null = DocValue::Null;
        let b = DocValue::Bool(false);
        let n = DocValue::Number(-100.0);
        let s = DocValue::String("a".into());
        let l = DocValue::List(vec![]);
        let o = DocValue::Object(vec![]);
        let seq = [&null, &b, &n, &s, &l, &o];
        for pair in seq.windows(2) {
            assert_eq!(compare_doc_values(pair[0], pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn object_order_ignores_attribute_insertion_order() {
        let ab = DocValue::object([("a", DocValue::Number(1.0)), ("b", DocValue::Number(2.0))]);
        let ba = DocValue::object([("b", DocValue::Number(2.0)), ("a", DocValue::Number(1.0))]);
        assert_eq!(compare_doc_values(&ab, &ba), Ordering::Equal);
    }

    #[test]
    fn string_order_is_accent_aware() {
        let a_umlaut = DocValue::String("\u{00E4}".into());
        let b = DocValue::String("b".into());
        assert_eq!(compare_doc_values(&a_umlaut, &b), Ordering::Less);
    }

    #[test]
    fn shorter_list_sorts_first() {
        let short = DocValue::List(vec![DocValue::Number(1.0)]);
        let long = DocValue::List(vec![DocValue::Number(1.0), DocValue::Number(0.0)]);
        assert_eq!(compare_doc_values(&short, &long), Ordering::Less);
    }
}
