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

//! Key encodings for the storage keyspaces.
//!
//! Watermarks are embedded as their raw bytes followed by a NUL terminator.
//! Watermark strings never contain NUL, so for keys sharing a prefix the
//! terminator makes byte order equal watermark order, including when one
//! watermark is a prefix of another. Tables and row keys are length-prefixed
//! so decoding is unambiguous.

use std::ops::Bound;

use bytes::Bytes;
use syncwave_common::Watermark;

use crate::error::{StorageError, StorageResult};

pub const KS_STATE: u8 = 0x00;
pub const KS_LOG: u8 = 0x01;
pub const KS_ROW: u8 = 0x02;
pub const KS_CHANGE_INDEX: u8 = 0x03;
pub const KS_CHANGE_INDEX_BY_ROW: u8 = 0x04;

const WATERMARK_TERMINATOR: u8 = 0x00;

pub type KeyRange = (Bound<Bytes>, Bound<Bytes>);

pub fn state_key(name: &str) -> Bytes {
    let mut buf = Vec::with_capacity(1 + name.len());
    buf.push(KS_STATE);
    buf.extend_from_slice(name.as_bytes());
    Bytes::from(buf)
}

fn push_watermark(buf: &mut Vec<u8>, watermark: &Watermark) {
    debug_assert!(!watermark.as_str().as_bytes().contains(&WATERMARK_TERMINATOR));
    buf.extend_from_slice(watermark.as_str().as_bytes());
    buf.push(WATERMARK_TERMINATOR);
}

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn take_len_prefixed<'a>(rest: &mut &'a [u8]) -> StorageResult<&'a [u8]> {
    if rest.len() < 4 {
        return Err(StorageError::Corrupt("truncated length prefix".into()));
    }
    let len = u32::from_be_bytes(rest[..4].try_into().unwrap()) as usize;
    if rest.len() < 4 + len {
        return Err(StorageError::Corrupt("truncated length-prefixed field".into()));
    }
    let field = &rest[4..4 + len];
    *rest = &rest[4 + len..];
    Ok(field)
}

fn take_watermark(rest: &mut &[u8]) -> StorageResult<Watermark> {
    let end = rest
        .iter()
        .position(|&b| b == WATERMARK_TERMINATOR)
        .ok_or_else(|| StorageError::Corrupt("unterminated watermark".into()))?;
    let watermark = std::str::from_utf8(&rest[..end])
        .map_err(|_| StorageError::Corrupt("non-utf8 watermark".into()))?;
    let watermark = Watermark::from_string(watermark.to_owned());
    *rest = &rest[end + 1..];
    Ok(watermark)
}

/// Smallest key strictly above every key starting with `prefix`.
fn prefix_upper_bound(mut prefix: Vec<u8>) -> Bound<Bytes> {
    while let Some(last) = prefix.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return Bound::Excluded(Bytes::from(prefix));
        }
        prefix.pop();
    }
    Bound::Unbounded
}

fn keyspace_range(ks: u8) -> KeyRange {
    (
        Bound::Included(Bytes::from(vec![ks])),
        prefix_upper_bound(vec![ks]),
    )
}

// ---- change log (KS_LOG) ----

pub fn log_key(watermark: &Watermark, pos: u32) -> Bytes {
    let mut buf = Vec::new();
    buf.push(KS_LOG);
    push_watermark(&mut buf, watermark);
    buf.extend_from_slice(&pos.to_be_bytes());
    Bytes::from(buf)
}

pub fn decode_log_key(key: &[u8]) -> StorageResult<(Watermark, u32)> {
    let mut rest = key
        .strip_prefix(&[KS_LOG])
        .ok_or_else(|| StorageError::Corrupt("log key outside keyspace".into()))?;
    let watermark = take_watermark(&mut rest)?;
    let pos = u32::from_be_bytes(
        rest.try_into()
            .map_err(|_| StorageError::Corrupt("bad log position".into()))?,
    );
    Ok((watermark, pos))
}

/// All log entries with watermark strictly greater than `after`.
pub fn log_range_after(after: &Watermark) -> KeyRange {
    if after.is_min() {
        return keyspace_range(KS_LOG);
    }
    let mut lower = Vec::new();
    lower.push(KS_LOG);
    lower.extend_from_slice(after.as_str().as_bytes());
    // One past the terminator: skips every entry of `after` itself.
    lower.push(WATERMARK_TERMINATOR + 1);
    (
        Bound::Included(Bytes::from(lower)),
        prefix_upper_bound(vec![KS_LOG]),
    )
}

/// All log entries with watermark strictly less than `below`.
pub fn log_range_below(below: &Watermark) -> KeyRange {
    let mut upper = Vec::new();
    upper.push(KS_LOG);
    push_watermark(&mut upper, below);
    (
        Bound::Included(Bytes::from(vec![KS_LOG])),
        Bound::Excluded(Bytes::from(upper)),
    )
}

// ---- replica rows (KS_ROW) ----

pub fn row_version_key(table: &str, row_key: &[u8], version: &Watermark) -> Bytes {
    let mut buf = Vec::new();
    buf.push(KS_ROW);
    push_len_prefixed(&mut buf, table.as_bytes());
    push_len_prefixed(&mut buf, row_key);
    push_watermark(&mut buf, version);
    Bytes::from(buf)
}

pub fn decode_row_version_key(key: &[u8]) -> StorageResult<(String, Bytes, Watermark)> {
    let mut rest = key
        .strip_prefix(&[KS_ROW])
        .ok_or_else(|| StorageError::Corrupt("row key outside keyspace".into()))?;
    let table = std::str::from_utf8(take_len_prefixed(&mut rest)?)
        .map_err(|_| StorageError::Corrupt("non-utf8 table name".into()))?
        .to_owned();
    let row_key = Bytes::copy_from_slice(take_len_prefixed(&mut rest)?);
    let version = take_watermark(&mut rest)?;
    Ok((table, row_key, version))
}

fn row_prefix(table: &str, row_key: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(KS_ROW);
    push_len_prefixed(&mut buf, table.as_bytes());
    if let Some(row_key) = row_key {
        push_len_prefixed(&mut buf, row_key);
    }
    buf
}

/// Upper bound of the whole row keyspace.
pub fn table_rows_upper_bound() -> Bound<Bytes> {
    prefix_upper_bound(vec![KS_ROW])
}

/// Every stored version of every row of `table`.
pub fn table_rows_range(table: &str) -> KeyRange {
    let prefix = row_prefix(table, None);
    (
        Bound::Included(Bytes::from(prefix.clone())),
        prefix_upper_bound(prefix),
    )
}

/// Versions of one row at or below `version`, oldest first. The newest one is
/// the visible value at `version`.
pub fn row_versions_up_to(table: &str, row_key: &[u8], version: &Watermark) -> KeyRange {
    let prefix = row_prefix(table, Some(row_key));
    let mut upper = prefix.clone();
    upper.extend_from_slice(version.as_str().as_bytes());
    upper.push(WATERMARK_TERMINATOR + 1);
    (
        Bound::Included(Bytes::from(prefix)),
        Bound::Excluded(Bytes::from(upper)),
    )
}

/// All versions of one row.
pub fn row_versions_range(table: &str, row_key: &[u8]) -> KeyRange {
    let prefix = row_prefix(table, Some(row_key));
    (
        Bound::Included(Bytes::from(prefix.clone())),
        prefix_upper_bound(prefix),
    )
}

// ---- change-log index (KS_CHANGE_INDEX, KS_CHANGE_INDEX_BY_ROW) ----

pub fn change_index_key(version: &Watermark, table: &str, row_key: &[u8]) -> Bytes {
    let mut buf = Vec::new();
    buf.push(KS_CHANGE_INDEX);
    push_watermark(&mut buf, version);
    push_len_prefixed(&mut buf, table.as_bytes());
    buf.extend_from_slice(row_key);
    Bytes::from(buf)
}

pub fn decode_change_index_key(key: &[u8]) -> StorageResult<(Watermark, String, Bytes)> {
    let mut rest = key
        .strip_prefix(&[KS_CHANGE_INDEX])
        .ok_or_else(|| StorageError::Corrupt("change index key outside keyspace".into()))?;
    let version = take_watermark(&mut rest)?;
    let table = std::str::from_utf8(take_len_prefixed(&mut rest)?)
        .map_err(|_| StorageError::Corrupt("non-utf8 table name".into()))?
        .to_owned();
    Ok((version, table, Bytes::copy_from_slice(rest)))
}

/// Change-index entries with `after < version <= up_to`.
pub fn change_index_range(after: &Watermark, up_to: &Watermark) -> KeyRange {
    let lower = if after.is_min() {
        Bound::Included(Bytes::from(vec![KS_CHANGE_INDEX]))
    } else {
        let mut buf = Vec::new();
        buf.push(KS_CHANGE_INDEX);
        buf.extend_from_slice(after.as_str().as_bytes());
        buf.push(WATERMARK_TERMINATOR + 1);
        Bound::Included(Bytes::from(buf))
    };
    let mut upper = Vec::new();
    upper.push(KS_CHANGE_INDEX);
    upper.extend_from_slice(up_to.as_str().as_bytes());
    upper.push(WATERMARK_TERMINATOR + 1);
    (lower, Bound::Excluded(Bytes::from(upper)))
}

/// Change-index entries with version strictly below `below`.
pub fn change_index_range_below(below: &Watermark) -> KeyRange {
    let mut upper = Vec::new();
    upper.push(KS_CHANGE_INDEX);
    push_watermark(&mut upper, below);
    (
        Bound::Included(Bytes::from(vec![KS_CHANGE_INDEX])),
        Bound::Excluded(Bytes::from(upper)),
    )
}

pub fn change_index_by_row_key(table: &str, row_key: &[u8]) -> Bytes {
    let mut buf = Vec::new();
    buf.push(KS_CHANGE_INDEX_BY_ROW);
    push_len_prefixed(&mut buf, table.as_bytes());
    buf.extend_from_slice(row_key);
    Bytes::from(buf)
}

/// Every live by-row index entry of `table`.
pub fn change_index_by_row_table_range(table: &str) -> KeyRange {
    let mut prefix = Vec::new();
    prefix.push(KS_CHANGE_INDEX_BY_ROW);
    push_len_prefixed(&mut prefix, table.as_bytes());
    (
        Bound::Included(Bytes::from(prefix.clone())),
        prefix_upper_bound(prefix),
    )
}
