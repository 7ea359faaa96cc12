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

use std::fmt;

use serde::{Deserialize, Serialize};

/// A lexicographically sortable position in the change history.
///
/// Two watermarks compare the way their bytes compare, so a fixed-width
/// encoding is required for numeric sources: [`Watermark::from_lsn`] produces
/// 16-digit zero-padded hex, which orders identically to the source integer.
///
/// The same value doubles as the client-visible cookie.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    /// The initial position, strictly below every commit watermark.
    pub fn min() -> Self {
        Self(String::new())
    }

    /// Encode a numeric log sequence number. Byte order equals numeric order.
    pub fn from_lsn(lsn: u64) -> Self {
        Self(format!("{lsn:016x}"))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_min(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<min>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl fmt::Debug for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Watermark({self})")
    }
}

impl From<&str> for Watermark {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
