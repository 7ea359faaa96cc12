// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

pub mod watermark;

use crate::types::watermark::Watermark;

/// Name of the implicit per-row version column. Its value is the watermark of
/// the transaction that last wrote the row.
pub const ROW_VERSION_COLUMN: &str = "_0_version";

/// Largest integer magnitude exactly representable as an IEEE-754 double.
/// Values beyond it must be rejected before they reach a client.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// A single column value.
///
/// The variant set mirrors what the downstream protocol can carry: JSON
/// scalars only, no nested structures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Datum {
    /// Whether the value survives a round trip through an IEEE-754 double.
    /// Only integers can fail this.
    pub fn is_safe_integer(&self) -> bool {
        match self {
            Datum::Int(i) => i.unsigned_abs() <= MAX_SAFE_INTEGER as u64,
            _ => true,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) => 2,
            Datum::Float(_) => 3,
            Datum::String(_) => 4,
        }
    }

    /// Deterministic, unambiguous byte encoding used for row-key fingerprints.
    /// Unequal datums never encode to the same bytes.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.type_rank());
        match self {
            Datum::Null => {}
            Datum::Bool(b) => buf.push(*b as u8),
            Datum::Int(i) => buf.extend_from_slice(&i.to_be_bytes()),
            Datum::Float(f) => buf.extend_from_slice(&f.to_bits().to_be_bytes()),
            Datum::String(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order: nulls first, then by type rank, then within the type. Floats
/// use the IEEE total order so sorting never panics on NaN.
impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
            (Datum::Float(a), Datum::Float(b)) => a.total_cmp(b),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.type_rank());
        match self {
            Datum::Null => {}
            Datum::Bool(b) => b.hash(state),
            Datum::Int(i) => i.hash(state),
            Datum::Float(f) => f.to_bits().hash(state),
            Datum::String(s) => s.hash(state),
        }
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Bool(v)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::String(v.to_owned())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::String(v)
    }
}

/// An owned row: column name to value, kept in column-name order so that
/// serialization and iteration are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Datum>);

impl Row {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, column: &str) -> Option<&Datum> {
        self.0.get(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Datum>) -> Option<Datum> {
        self.0.insert(column.into(), value.into())
    }

    pub fn remove(&mut self, column: &str) -> Option<Datum> {
        self.0.remove(column)
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Datum> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The row's `_0_version` column, if present and a string.
    pub fn version(&self) -> Option<Watermark> {
        match self.get(ROW_VERSION_COLUMN) {
            Some(Datum::String(s)) => Some(Watermark::from_string(s.clone())),
            _ => None,
        }
    }

    pub fn set_version(&mut self, watermark: &Watermark) {
        self.insert(
            ROW_VERSION_COLUMN.to_owned(),
            Datum::String(watermark.as_str().to_owned()),
        );
    }
}

impl FromIterator<(String, Datum)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Datum)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Datum>> for Row {
    fn from(inner: BTreeMap<String, Datum>) -> Self {
        Self(inner)
    }
}

impl IntoIterator for Row {
    type IntoIter = btree_map::IntoIter<String, Datum>;
    type Item = (String, Datum);

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Row {
    type IntoIter = btree_map::Iter<'a, String, Datum>;
    type Item = (&'a String, &'a Datum);

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
