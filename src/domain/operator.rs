//! Carrier operators: named routing prefixes prepended to the dialed
//! number, plus the pure ordering rules the failover driver applies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named carrier routing prefix.
///
/// The prefix is prepended verbatim to the destination number when
/// dialing. An empty prefix means direct dial through the default
/// route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    /// Human-readable carrier name, used for attribution and caching.
    pub name: String,
    /// Dial prefix, e.g. `"1010288"` or `""` for direct dial.
    #[serde(default)]
    pub prefix: String,
}

impl Operator {
    /// Operator with no routing prefix: dial the destination directly.
    pub fn direct() -> Self {
        Self {
            name: String::new(),
            prefix: String::new(),
        }
    }

    /// Builds the full dial string for a destination number.
    pub fn dial_string(&self, phone: &str) -> String {
        format!("{}{}", self.prefix, phone)
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "direct")
        } else {
            write!(f, "{} ({})", self.name, self.prefix)
        }
    }
}

/// The last operator that successfully reached a destination, as
/// stored in the operator cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOperator {
    pub operator_name: String,
    pub operator_prefix: String,
    pub last_success_at: DateTime<Utc>,
}

impl CachedOperator {
    /// Snapshot of a successful operator at the current instant.
    pub fn from_operator(op: &Operator, at: DateTime<Utc>) -> Self {
        Self {
            operator_name: op.name.clone(),
            operator_prefix: op.prefix.clone(),
            last_success_at: at,
        }
    }
}

/// Index of the first operator whose name matches exactly, if any.
///
/// Matching is case-sensitive; duplicate names resolve to the first
/// occurrence.
pub fn find_operator_by_name(operators: &[Operator], name: &str) -> Option<usize> {
    operators.iter().position(|op| op.name == name)
}

/// Reorders `operators` so the cached operator is tried first.
///
/// Returns a permutation of the input: the cached operator (matched
/// by name) moves to the front and the relative order of all others
/// is preserved. If the cached name is not present in the list, the
/// input order is returned unchanged.
pub fn reorder_with_cached(operators: &[Operator], cached: &CachedOperator) -> Vec<Operator> {
    match find_operator_by_name(operators, &cached.operator_name) {
        Some(idx) => {
            let mut reordered = Vec::with_capacity(operators.len());
            reordered.push(operators[idx].clone());
            reordered.extend(
                operators
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != idx)
                    .map(|(_, op)| op.clone()),
            );
            reordered
        }
        None => operators.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn op(name: &str, prefix: &str) -> Operator {
        Operator {
            name: name.to_string(),
            prefix: prefix.to_string(),
        }
    }

    fn cached(name: &str) -> CachedOperator {
        CachedOperator {
            operator_name: name.to_string(),
            operator_prefix: String::new(),
            last_success_at: Utc::now(),
        }
    }

    #[test]
    fn dial_string_prepends_prefix() {
        assert_eq!(op("mtt", "1011").dial_string("74950001122"), "101174950001122");
        assert_eq!(Operator::direct().dial_string("74950001122"), "74950001122");
    }

    #[test]
    fn find_is_case_sensitive_first_match() {
        let ops = vec![op("a", "1"), op("B", "2"), op("a", "3")];
        assert_eq!(find_operator_by_name(&ops, "a"), Some(0));
        assert_eq!(find_operator_by_name(&ops, "B"), Some(1));
        assert_eq!(find_operator_by_name(&ops, "b"), None);
    }

    #[test]
    fn reorder_moves_cached_first_and_keeps_rest_stable() {
        let ops = vec![op("a", "1"), op("b", "2"), op("c", "3")];
        let reordered = reorder_with_cached(&ops, &cached("c"));
        let names: Vec<_> = reordered.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn reorder_with_unknown_name_is_identity() {
        let ops = vec![op("a", "1"), op("b", "2")];
        assert_eq!(reorder_with_cached(&ops, &cached("zz")), ops);
    }

    #[test]
    fn reorder_does_not_mutate_input() {
        let ops = vec![op("a", "1"), op("b", "2")];
        let before = ops.clone();
        let _ = reorder_with_cached(&ops, &cached("b"));
        assert_eq!(ops, before);
    }

    proptest! {
        #[test]
        fn reorder_is_always_a_permutation(
            names in proptest::collection::vec("[a-e]{1,3}", 0..8),
            cached_name in "[a-e]{1,3}",
        ) {
            let ops: Vec<Operator> =
                names.iter().map(|n| op(n, "9")).collect();
            let reordered = reorder_with_cached(&ops, &cached(&cached_name));

            prop_assert_eq!(reordered.len(), ops.len());
            let mut sorted_in: Vec<_> = ops.iter().map(|o| o.name.clone()).collect();
            let mut sorted_out: Vec<_> = reordered.iter().map(|o| o.name.clone()).collect();
            sorted_in.sort();
            sorted_out.sort();
            prop_assert_eq!(sorted_in, sorted_out);

            if find_operator_by_name(&ops, &cached_name).is_some() {
                prop_assert_eq!(&reordered[0].name, &cached_name);
            } else {
                prop_assert_eq!(&reordered, &ops);
            }
        }
    }
}
