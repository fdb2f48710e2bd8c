/// Source vs destination consistency check.
///
/// Compares the canonical source readings of a window with what the
/// destination holds for the same window, key by key.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::{Reading, ReadingKey};

/// A key present on both sides with different contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub key: ReadingKey,
    pub source: Reading,
    pub destination: Reading,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Comparison {
    pub source_rows: usize,
    pub destination_rows: usize,
    pub matched: usize,
    /// In the source, not in the destination.
    pub missing: Vec<ReadingKey>,
    /// In the destination, not in the source.
    pub extra: Vec<ReadingKey>,
    pub mismatched: Vec<Mismatch>,
}

impl Comparison {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.mismatched.is_empty()
    }

    pub fn discrepancies(&self) -> usize {
        self.missing.len() + self.extra.len() + self.mismatched.len()
    }
}

/// Compares two reading sets. Numeric values compare by value, so `12.50`
/// and `12.5` are equal.
pub fn compare(source: &[Reading], destination: &[Reading]) -> Comparison {
    let src: BTreeMap<ReadingKey, &Reading> = source.iter().map(|r| (r.key(), r)).collect();
    let dst: BTreeMap<ReadingKey, &Reading> = destination.iter().map(|r| (r.key(), r)).collect();

    let mut comparison = Comparison {
        source_rows: src.len(),
        destination_rows: dst.len(),
        ..Comparison::default()
    };

    for (key, s) in &src {
        match dst.get(key) {
            None => comparison.missing.push(*key),
            Some(d) if same_contents(s, d) => comparison.matched += 1,
            Some(d) => comparison.mismatched.push(Mismatch {
                key: *key,
                source: (*s).clone(),
                destination: (*d).clone(),
            }),
        }
    }
    comparison.extra = dst.keys().filter(|k| !src.contains_key(k)).copied().collect();

    comparison
}

fn same_contents(a: &Reading, b: &Reading) -> bool {
    // Decimal equality ignores scale
    a.station_name == b.station_name && a.measurements == b.measurements
}
