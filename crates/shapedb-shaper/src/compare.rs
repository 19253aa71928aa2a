//! The total order over document values.
//!
//! Values are ordered first by coarse type rank (null < boolean < number <
//! string < list < object), then within a type. Objects compare in
//! *attribute weight order*, not insertion order, which makes the result
//! independent of how a document was physically stored and gives the sort
//! operator a collection-independent ordering.

use std::cmp::Ordering;

use shapedb_types::DocValue;

use crate::shaper::Shaper;

const fn type_rank(value: &DocValue) -> u8 {
    match value {
        DocValue::Null => 0,
        DocValue::Bool(_) => 1,
        DocValue::Number(_) => 2,
        DocValue::String(_) => 3,
        DocValue::List(_) => 4,
        DocValue::Object(_) => 5,
    }
}

/// Total order over all representable values.
///
/// Each side's attributes are weighted by its own shaper; in the common
/// case both sides share one shaper and weights are directly comparable.
pub fn compare_values(
    left: &DocValue,
    left_shaper: &Shaper,
    right: &DocValue,
    right_shaper: &Shaper,
) -> Ordering {
    let rank = type_rank(left).cmp(&type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }
    match (left, right) {
        (DocValue::Null, DocValue::Null) => Ordering::Equal,
        (DocValue::Bool(l), DocValue::Bool(r)) => l.cmp(r),
        (DocValue::Number(l), DocValue::Number(r)) => l.total_cmp(r),
        (DocValue::String(l), DocValue::String(r)) => compare_strings(l, r),
        (DocValue::List(l), DocValue::List(r)) => {
            for (lv, rv) in l.iter().zip(r.iter()) {
                let cmp = compare_values(lv, left_shaper, rv, right_shaper);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            // Shorter is less on a full-length tie.
            l.len().cmp(&r.len())
        }
        (DocValue::Object(l), DocValue::Object(r)) => {
            let l_sorted = weighted(l, left_shaper);
            let r_sorted = weighted(r, right_shaper);
            for ((lw, lv), (rw, rv)) in l_sorted.iter().zip(r_sorted.iter()) {
                // A weight difference decides before any value is looked at.
                let cmp = lw.cmp(rw);
                if cmp != Ordering::Equal {
                    return cmp;
                }
                let cmp = compare_values(lv, left_shaper, rv, right_shaper);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            l_sorted.len().cmp(&r_sorted.len())
        }
        // Ranks were equal, so the variants match.
        _ => unreachable!("type ranks matched but variants differ"),
    }
}

/// Locale-aware UTF-8 comparison.
///
/// Strings are compared on primary collation weights first, so accented
/// letters order next to their base letter and case is ignored at the
/// first level ("ä" sorts before "b", "Apple" before "banana"). Strings
/// whose primary keys tie fall back to code-unit order, which keeps the
/// overall order total.
pub fn compare_strings(left: &str, right: &str) -> Ordering {
    let l_key = collation_sort_key(left);
    let r_key = collation_sort_key(right);
    match l_key.cmp(&r_key) {
        Ordering::Equal => left.cmp(right),
        other => other,
    }
}

/// Primary weights for a string. Compared lexicographically, the keys
/// produce an accent-insensitive, case-insensitive first-level ordering.
fn collation_sort_key(s: &str) -> Vec<u32> {
    s.chars()
        .flat_map(|ch| strip_diacritic(ch).to_lowercase())
        .map(u32::from)
        .collect()
}

/// Strip common Latin diacritical marks, returning the base character.
///
/// Covers the Latin-1 Supplement block used by European languages.
/// Characters outside it pass through unchanged.
fn strip_diacritic(ch: char) -> char {
    match ch {
        '\u{00C0}'..='\u{00C6}' => 'A',
        '\u{00E0}'..='\u{00E6}' => 'a',
        '\u{00C7}' => 'C',
        '\u{00E7}' => 'c',
        '\u{00C8}'..='\u{00CB}' => 'E',
        '\u{00E8}'..='\u{00EB}' => 'e',
        '\u{00CC}'..='\u{00CF}' => 'I',
        '\u{00EC}'..='\u{00EF}' => 'i',
        '\u{00D1}' => 'N',
        '\u{00F1}' => 'n',
        '\u{00D2}'..='\u{00D6}' | '\u{00D8}' => 'O',
        '\u{00F2}'..='\u{00F6}' | '\u{00F8}' => 'o',
        '\u{00D9}'..='\u{00DC}' => 'U',
        '\u{00F9}'..='\u{00FC}' => 'u',
        '\u{00DD}' => 'Y',
        '\u{00FD}' | '\u{00FF}' => 'y',
        _ => ch,
    }
}

/// Attribute list sorted by weight; unknown attributes get the minimal
/// sentinel weight and sort first.
fn weighted<'a>(
    attrs: &'a [(String, DocValue)],
    shaper: &Shaper,
) -> Vec<(i64, &'a DocValue)> {
    let mut out: Vec<(i64, &DocValue)> = attrs
        .iter()
        .map(|(name, value)| {
            let weight = shaper
                .lookup_attribute_id(name)
                .map_or(crate::UNKNOWN_ATTRIBUTE_WEIGHT, |aid| {
                    shaper.lookup_attribute_weight(aid)
                });
            (weight, value)
        })
        .collect();
    out.sort_by_key(|(weight, _)| *weight);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn obj(shaper: &Shaper, pairs: &[(&str, DocValue)]) -> DocValue {
        let doc = DocValue::Object(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        );
        // Shaping registers the attribute names so they get real weights.
        shaper.shape(&doc).expect("shaping must succeed");
        doc
    }

    #[test]
    fn type_ranks_order_across_types() {
        let shaper = Shaper::transient();
        let values = [
            DocValue::Null,
            DocValue::Bool(true),
            DocValue::Number(-100.0),
            DocValue::String("a".to_owned()),
            DocValue::List(vec![]),
            DocValue::Object(vec![]),
        ];
        for window in values.windows(2) {
            assert_eq!(
                compare_values(&window[0], &shaper, &window[1], &shaper),
                Ordering::Less
            );
        }
    }

    #[test]
    fn object_comparison_ignores_storage_order() {
        let shaper = Shaper::transient();
        let a = obj(
            &shaper,
            &[("a", DocValue::Number(1.0)), ("b", DocValue::Number(2.0))],
        );
        let b = obj(
            &shaper,
            &[("b", DocValue::Number(2.0)), ("a", DocValue::Number(1.0))],
        );
        assert_eq!(compare_values(&a, &shaper, &b, &shaper), Ordering::Equal);
    }

    #[test]
    fn object_weight_decides_before_value() {
        let shaper = Shaper::transient();
        // {a: 9} vs {b: 1}: "a" weighs less than "b", so the left side wins
        // regardless of the values.
        let l = obj(&shaper, &[("a", DocValue::Number(9.0))]);
        let r = obj(&shaper, &[("b", DocValue::Number(1.0))]);
        assert_eq!(compare_values(&l, &shaper, &r, &shaper), Ordering::Less);
    }

    #[test]
    fn accented_letters_sort_with_their_base_letter() {
        let shaper = Shaper::transient();
        let a_umlaut = DocValue::String("\u{00E4}".to_owned());
        let b = DocValue::String("b".to_owned());
        assert_eq!(
            compare_values(&a_umlaut, &shaper, &b, &shaper),
            Ordering::Less
        );
        let cafe_accented = DocValue::String("caf\u{00E9}".to_owned());
        let cage = DocValue::String("cage".to_owned());
        assert_eq!(
            compare_values(&cafe_accented, &shaper, &cage, &shaper),
            Ordering::Less
        );
    }

    #[test]
    fn case_differs_only_at_the_tiebreak_level() {
        // Primary weights ignore case, so "Apple" groups before "banana"
        // even though 'A' < 'b' fails bytewise for lowercase-first data.
        assert_eq!(compare_strings("Apple", "banana"), Ordering::Less);
        assert_eq!(compare_strings("apple", "Apple"), Ordering::Greater);
        assert_eq!(compare_strings("apple", "apple"), Ordering::Equal);
    }

    #[test]
    fn equal_primary_keys_still_order_distinct_strings() {
        // "a" and its accented forms share a primary key; the code-unit
        // tiebreak keeps them apart so the order stays total.
        assert_ne!(compare_strings("a", "\u{00E4}"), Ordering::Equal);
        assert_eq!(
            compare_strings("a", "\u{00E4}"),
            compare_strings("\u{00E4}", "a").reverse()
        );
    }

    #[test]
    fn shorter_list_is_less_on_tie() {
        let shaper = Shaper::transient();
        let l = DocValue::List(vec![DocValue::Number(1.0)]);
        let r = DocValue::List(vec![DocValue::Number(1.0), DocValue::Number(0.0)]);
        assert_eq!(compare_values(&l, &shaper, &r, &shaper), Ordering::Less);
    }

    fn arb_value() -> impl Strategy<Value = DocValue> {
        let leaf = prop_oneof![
            Just(DocValue::Null),
            any::<bool>().prop_map(DocValue::Bool),
            (-1000i64..1000).prop_map(|n| DocValue::Number(n as f64)),
            "[a-z]{0,10}".prop_map(DocValue::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(DocValue::List),
                proptest::collection::vec(("[a-c]", inner), 0..4).prop_map(|pairs| {
                    DocValue::Object(pairs)
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn order_is_antisymmetric_and_reflexive(a in arb_value(), b in arb_value()) {
            let shaper = Shaper::transient();
            prop_assert_eq!(
                compare_values(&a, &shaper, &a, &shaper),
                Ordering::Equal
            );
            let ab = compare_values(&a, &shaper, &b, &shaper);
            let ba = compare_values(&b, &shaper, &a, &shaper);
            prop_assert_eq!(ab, ba.reverse());
        }
    }
}
