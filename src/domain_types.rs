//! Validated domain newtypes shared across the crate.
//!
//! These exist to keep raw strings and counters from leaking through
//! the scheduling layers: a phone number that reached a worker has
//! already been validated once, at the edge.

use nutype::nutype;

/// A destination telephone number in normalized dial form.
///
/// Normalization is the caller's job (directory client or config
/// loader); this type only guarantees the string is non-empty and
/// free of surrounding whitespace.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// The number with a leading `+` removed, used for prefix matching.
    pub fn without_plus(&self) -> &str {
        self.as_ref().trim_start_matches('+')
    }

    /// The trailing `n` characters, used for CDR suffix correlation.
    pub fn suffix(&self, n: usize) -> &str {
        let s: &str = self.as_ref();
        let start = s.len().saturating_sub(n);
        &s[start..]
    }
}

/// Configured name of a physical modem; doubles as the worker identity.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef
    )
)]
pub struct ModemName(String);

/// Monotonic job sequence number, assigned by the scheduler.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct TestNumber(u64);

impl TestNumber {
    /// Numeric value for counters and log fields.
    pub fn as_u64(self) -> u64 {
        self.into_inner()
    }
}
