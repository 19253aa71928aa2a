//! Binary layout of shaped values.
//!
//! A [`ShapedValue`] is a shape id plus a raw payload. The payload layout is
//! fully determined by the shape:
//!
//! ```text
//! null                  (empty)
//! boolean               [b: u8]
//! number                [f64 LE]
//! short string          [len: u8][bytes, zero-padded to 7]
//! long string           [len: u32][bytes]
//! list                  [count: u32][sid: u64 × count][off: u32 × count+1][data]
//! homogeneous list      [count: u32][off: u32 × count+1][data]
//! homogeneous sized     [count: u32][data: count × element_size]
//! array                 [fixed payloads][off: u32 × var+1][var payloads]
//! ```
//!
//! Offsets are relative to the start of the trailing data region. Fixed
//! array payloads appear in the shape's fixed-entry order, so a sub-value's
//! position is computable from the shape alone.

use shapedb_error::{Result, ShapeDbError};
use shapedb_types::{DocValue, ShapeId};

use crate::shape::{Shape, ShapeKind};
use crate::shaper::Shaper;

/// Longest string stored in the fixed 8-byte short-string slot.
pub(crate) const SHORT_STRING_MAX: usize = 7;

/// A shaped document value: shape id plus raw byte payload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ShapedValue {
    pub sid: ShapeId,
    pub data: Vec<u8>,
}

impl ShapedValue {
    /// Total payload size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

pub(crate) fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    data.get(at..at + 8).map(|b| {
        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

/// Encode a short string into its fixed 8-byte slot.
pub(crate) fn encode_short_string(s: &str) -> Vec<u8> {
    debug_assert!(s.len() <= SHORT_STRING_MAX);
    let mut slot = vec![0u8; 8];
    #[allow(clippy::cast_possible_truncation)]
    {
        slot[0] = s.len() as u8;
    }
    slot[1..=s.len()].copy_from_slice(s.as_bytes());
    slot
}

fn corrupt(detail: &str) -> ShapeDbError {
    ShapeDbError::invalid_state(format!("malformed shaped payload: {detail}"))
}

/// Decode a shaped payload back into a generic document value.
///
/// Strict: any truncated or inconsistent payload is an error, as is an
/// unknown shape id.
pub(crate) fn decode(shaper: &Shaper, sid: ShapeId, data: &[u8]) -> Result<DocValue> {
    let shape = shaper.lookup_shape(sid).ok_or(ShapeDbError::NotFound {
        what: "shape",
        name: sid.to_string(),
    })?;
    decode_with_shape(shaper, &shape, data)
}

fn decode_with_shape(shaper: &Shaper, shape: &Shape, data: &[u8]) -> Result<DocValue> {
    match &shape.kind {
        ShapeKind::Null => Ok(DocValue::Null),
        ShapeKind::Boolean => {
            let b = data.first().ok_or_else(|| corrupt("boolean"))?;
            Ok(DocValue::Bool(*b != 0))
        }
        ShapeKind::Number => {
            let raw = read_u64(data, 0).ok_or_else(|| corrupt("number"))?;
            Ok(DocValue::Number(f64::from_bits(raw)))
        }
        ShapeKind::ShortString => {
            let len = *data.first().ok_or_else(|| corrupt("short string"))? as usize;
            let bytes = data
                .get(1..=len)
                .ok_or_else(|| corrupt("short string length"))?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| corrupt("short string utf-8"))?;
            Ok(DocValue::String(s.to_owned()))
        }
        ShapeKind::LongString => {
            let len = read_u32(data, 0).ok_or_else(|| corrupt("long string"))? as usize;
            let bytes = data
                .get(4..4 + len)
                .ok_or_else(|| corrupt("long string length"))?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| corrupt("long string utf-8"))?;
            Ok(DocValue::String(s.to_owned()))
        }
        ShapeKind::List => {
            let count = read_u32(data, 0).ok_or_else(|| corrupt("list count"))? as usize;
            let sids_at = 4;
            let offsets_at = sids_at + count * 8;
            let data_at = offsets_at + (count + 1) * 4;
            let mut items = Vec::with_capacity(count);
            for i in 0..count {
                let sid = ShapeId(
                    read_u64(data, sids_at + i * 8).ok_or_else(|| corrupt("list sid"))?,
                );
                let (from, to) = element_range(data, offsets_at, data_at, i)?;
                let slice = data.get(from..to).ok_or_else(|| corrupt("list element"))?;
                items.push(decode(shaper, sid, slice)?);
            }
            Ok(DocValue::List(items))
        }
        ShapeKind::HomogeneousList { element } => {
            let count = read_u32(data, 0).ok_or_else(|| corrupt("hlist count"))? as usize;
            let offsets_at = 4;
            let data_at = offsets_at + (count + 1) * 4;
            let mut items = Vec::with_capacity(count);
            for i in 0..count {
                let (from, to) = element_range(data, offsets_at, data_at, i)?;
                let slice = data.get(from..to).ok_or_else(|| corrupt("hlist element"))?;
                items.push(decode(shaper, *element, slice)?);
            }
            Ok(DocValue::List(items))
        }
        ShapeKind::HomogeneousSizedList {
            element,
            element_size,
        } => {
            let count = read_u32(data, 0).ok_or_else(|| corrupt("hslist count"))? as usize;
            let size = *element_size as usize;
            let mut items = Vec::with_capacity(count);
            for i in 0..count {
                let from = 4 + i * size;
                let slice = data
                    .get(from..from + size)
                    .ok_or_else(|| corrupt("hslist element"))?;
                items.push(decode(shaper, *element, slice)?);
            }
            Ok(DocValue::List(items))
        }
        ShapeKind::Array { fixed, variable } => {
            let mut attrs = Vec::with_capacity(fixed.len() + variable.len());
            let mut at = 0usize;
            for (aid, sub_sid) in fixed {
                let sub_shape = shaper.lookup_shape(*sub_sid).ok_or(ShapeDbError::NotFound {
                    what: "shape",
                    name: sub_sid.to_string(),
                })?;
                let size = sub_shape
                    .kind
                    .fixed_size()
                    .ok_or_else(|| corrupt("variable shape in fixed partition"))?
                    as usize;
                let slice = data
                    .get(at..at + size)
                    .ok_or_else(|| corrupt("array fixed entry"))?;
                let name = shaper.lookup_attribute_name(*aid).ok_or(
                    ShapeDbError::NotFound {
                        what: "attribute",
                        name: aid.to_string(),
                    },
                )?;
                attrs.push((name, decode_with_shape(shaper, &sub_shape, slice)?));
                at += size;
            }
            let offsets_at = at;
            let data_at = offsets_at + (variable.len() + 1) * 4;
            for (i, (aid, sub_sid)) in variable.iter().enumerate() {
                let (from, to) = element_range(data, offsets_at, data_at, i)?;
                let slice = data
                    .get(from..to)
                    .ok_or_else(|| corrupt("array variable entry"))?;
                let name = shaper.lookup_attribute_name(*aid).ok_or(
                    ShapeDbError::NotFound {
                        what: "attribute",
                        name: aid.to_string(),
                    },
                )?;
                attrs.push((name, decode(shaper, *sub_sid, slice)?));
            }
            Ok(DocValue::Object(attrs))
        }
    }
}

/// Absolute byte range of element `i` in a region addressed by an offset
/// table at `offsets_at` whose offsets are relative to `data_at`.
fn element_range(
    data: &[u8],
    offsets_at: usize,
    data_at: usize,
    i: usize,
) -> Result<(usize, usize)> {
    let from = read_u32(data, offsets_at + i * 4).ok_or_else(|| corrupt("offset"))? as usize;
    let to = read_u32(data, offsets_at + (i + 1) * 4).ok_or_else(|| corrupt("offset"))? as usize;
    if to < from {
        return Err(corrupt("offset order"));
    }
    Ok((data_at + from, data_at + to))
}

/// Slice one element out of a list-shaped payload without decoding the
/// rest. `None` when out of bounds, malformed, or not a list shape.
pub(crate) fn slice_element(shape: &Shape, data: &[u8], index: usize) -> Option<ShapedValue> {
    let count = read_u32(data, 0)? as usize;
    if index >= count {
        return None;
    }
    match &shape.kind {
        ShapeKind::List => {
            let sids_at = 4;
            let offsets_at = sids_at + count * 8;
            let data_at = offsets_at + (count + 1) * 4;
            let sid = ShapeId(read_u64(data, sids_at + index * 8)?);
            let from = read_u32(data, offsets_at + index * 4)? as usize;
            let to = read_u32(data, offsets_at + (index + 1) * 4)? as usize;
            Some(ShapedValue {
                sid,
                data: data.get(data_at + from..data_at + to)?.to_vec(),
            })
        }
        ShapeKind::HomogeneousList { element } => {
            let offsets_at = 4;
            let data_at = offsets_at + (count + 1) * 4;
            let from = read_u32(data, offsets_at + index * 4)? as usize;
            let to = read_u32(data, offsets_at + (index + 1) * 4)? as usize;
            Some(ShapedValue {
                sid: *element,
                data: data.get(data_at + from..data_at + to)?.to_vec(),
            })
        }
        ShapeKind::HomogeneousSizedList {
            element,
            element_size,
        } => {
            let size = *element_size as usize;
            let from = 4 + index * size;
            Some(ShapedValue {
                sid: *element,
                data: data.get(from..from + size)?.to_vec(),
            })
        }
        _ => None,
    }
}

/// Slice the payload of one attribute out of an array-shaped payload,
/// without decoding anything else.
///
/// Returns `None` when the attribute is not part of the shape or the
/// payload is malformed.
pub(crate) fn slice_attribute(
    shaper: &Shaper,
    shape: &Shape,
    data: &[u8],
    aid: shapedb_types::AttributeId,
) -> Option<ShapedValue> {
    let ShapeKind::Array { fixed, variable } = &shape.kind else {
        return None;
    };
    let mut at = 0usize;
    for (entry_aid, sub_sid) in fixed {
        let size = shaper.lookup_shape(*sub_sid)?.kind.fixed_size()? as usize;
        if entry_aid == &aid {
            return Some(ShapedValue {
                sid: *sub_sid,
                data: data.get(at..at + size)?.to_vec(),
            });
        }
        at += size;
    }
    let offsets_at = at;
    let data_at = offsets_at + (variable.len() + 1) * 4;
    for (i, (entry_aid, sub_sid)) in variable.iter().enumerate() {
        if entry_aid == &aid {
            let from = read_u32(data, offsets_at + i * 4)? as usize;
            let to = read_u32(data, offsets_at + (i + 1) * 4)? as usize;
            return Some(ShapedValue {
                sid: *sub_sid,
                data: data.get(data_at + from..data_at + to)?.to_vec(),
            });
        }
    }
    None
}
