//! Compiled attribute paths and the (sid, pid) accessor cache.
//!
//! A path like `a.b.2.c` is compiled once into a [`shapedb_types::PathId`].
//! The first time a given path is resolved against a given shape, an
//! [`Accessor`] is built: attribute names become attribute ids and the walk
//! is validated against the shape dictionary as far as it is statically
//! known. Subsequent extractions for the same `(sid, pid)` pair reuse the
//! accessor and never touch name strings again.

use std::collections::HashMap;

use shapedb_types::{AttributeId, PathId};

use crate::shape::ShapeKind;
use crate::shaped::{ShapedValue, slice_attribute, slice_element};
use crate::shaper::Shaper;

/// One leg of a compiled path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathLeg {
    Attribute(String),
    Index(usize),
}

/// Registry of compiled paths (string → pid → legs).
#[derive(Debug, Default)]
pub struct PathRegistry {
    by_name: HashMap<String, PathId>,
    by_id: HashMap<PathId, Vec<PathLeg>>,
    next_pid: u64,
}

impl PathRegistry {
    pub(crate) fn find_or_create(&mut self, path: &str) -> PathId {
        if let Some(pid) = self.by_name.get(path) {
            return *pid;
        }
        self.next_pid += 1;
        let pid = PathId(self.next_pid);
        let legs = path
            .split('.')
            .map(|leg| match leg.parse::<usize>() {
                Ok(index) => PathLeg::Index(index),
                Err(_) => PathLeg::Attribute(leg.to_owned()),
            })
            .collect();
        self.by_name.insert(path.to_owned(), pid);
        self.by_id.insert(pid, legs);
        pid
    }

    pub(crate) fn lookup(&self, pid: PathId) -> Option<Vec<PathLeg>> {
        self.by_id.get(&pid).cloned()
    }
}

/// One resolved step of an accessor.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Attribute(AttributeId),
    Index(usize),
}

/// A compiled walk for one `(root sid, pid)` pair.
#[derive(Debug)]
pub(crate) struct Accessor {
    steps: Vec<Step>,
}

impl Accessor {
    /// Build an accessor, validating the walk statically where the shape
    /// chain is known. Returns `None` when the path provably cannot exist
    /// for this root shape (shapes are immutable, so the miss is permanent
    /// for this sid).
    pub(crate) fn build(
        shaper: &Shaper,
        root: shapedb_types::ShapeId,
        legs: &[PathLeg],
    ) -> Option<Self> {
        let mut steps = Vec::with_capacity(legs.len());
        // Heterogeneous lists hide their element sids in the payload, so
        // static validation stops at the first one.
        let mut current = Some(root);
        for leg in legs {
            match leg {
                PathLeg::Attribute(name) => {
                    let aid = shaper.lookup_attribute_id(name)?;
                    if let Some(sid) = current {
                        let shape = shaper.lookup_shape(sid)?;
                        let ShapeKind::Array { fixed, variable } = &shape.kind else {
                            return None;
                        };
                        current = fixed
                            .iter()
                            .chain(variable.iter())
                            .find(|(a, _)| *a == aid)
                            .map(|(_, sub)| *sub);
                        current?;
                    }
                    steps.push(Step::Attribute(aid));
                }
                PathLeg::Index(index) => {
                    if let Some(sid) = current {
                        let shape = shaper.lookup_shape(sid)?;
                        current = match &shape.kind {
                            ShapeKind::HomogeneousList { element }
                            | ShapeKind::HomogeneousSizedList { element, .. } => Some(*element),
                            ShapeKind::List => None,
                            _ => return None,
                        };
                    }
                    steps.push(Step::Index(*index));
                }
            }
        }
        Some(Self { steps })
    }

    /// Run the walk against a concrete payload. `None` when an index is out
    /// of bounds or a dynamically-typed leg misses.
    pub(crate) fn extract(&self, shaper: &Shaper, shaped: &ShapedValue) -> Option<ShapedValue> {
        let mut current = shaped.clone();
        for step in &self.steps {
            let shape = shaper.lookup_shape(current.sid)?;
            current = match step {
                Step::Attribute(aid) => slice_attribute(shaper, &shape, &current.data, *aid)?,
                Step::Index(index) => slice_element(&shape, &current.data, *index)?,
            };
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_compilation_is_idempotent() {
        let mut registry = PathRegistry::default();
        let a = registry.find_or_create("x.y");
        let b = registry.find_or_create("x.y");
        let c = registry.find_or_create("x.z");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            registry.lookup(a).unwrap(),
            vec![
                PathLeg::Attribute("x".to_owned()),
                PathLeg::Attribute("y".to_owned())
            ]
        );
    }

    #[test]
    fn numeric_legs_become_indices() {
        let mut registry = PathRegistry::default();
        let pid = registry.find_or_create("items.0.name");
        assert_eq!(
            registry.lookup(pid).unwrap(),
            vec![
                PathLeg::Attribute("items".to_owned()),
                PathLeg::Index(0),
                PathLeg::Attribute("name".to_owned())
            ]
        );
    }
}
