//! The shape registry (shaper).
//!
//! Documents with identical structure share one [`Shape`], identified by a
//! process-lifetime-unique shape id. Attribute names get stable attribute
//! ids plus a *weight*, an integer consistent with the lexicographic order
//! of all known names, so two documents' attributes can be ordered without
//! repeated string comparison.
//!
//! The shaper converts between the generic tagged [`DocValue`] and a
//! [`ShapedValue`] (shape id + raw byte payload), resolves compiled
//! attribute paths against shaped payloads without full decoding, and
//! defines the total order every sort and comparison in the query engine
//! relies on.

mod accessor;
mod attribute;
mod compare;
mod shape;
mod shaped;
mod shaper;

pub use accessor::PathRegistry;
pub use compare::{compare_strings, compare_values};
pub use shape::{Shape, ShapeKind};
pub use shaped::ShapedValue;
pub use shaper::{DefinitionSink, NullSink, Shaper};

/// Weight sentinel for unknown attribute ids; sorts before every real weight.
pub const UNKNOWN_ATTRIBUTE_WEIGHT: i64 = i64::MIN;
