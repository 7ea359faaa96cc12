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

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::StorageResult;
use crate::keys::KeyRange;

/// An ordered key-value store with atomic batch writes. The storage layers
/// above are generic over this, so tests run on the in-memory map and
/// deployments run on sled.
pub trait RangeKv: Clone + Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    fn range(&self, range: KeyRange, limit: Option<usize>)
        -> StorageResult<Vec<(Bytes, Bytes)>>;

    fn rev_range(
        &self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(Bytes, Bytes)>>;

    /// Apply all pairs atomically. A `None` value removes the key.
    fn ingest_batch(
        &self,
        kv_pairs: impl Iterator<Item = (Bytes, Option<Bytes>)>,
    ) -> StorageResult<()>;

    fn flush(&self) -> StorageResult<()>;
}

pub type BTreeMapRangeKv = Arc<RwLock<BTreeMap<Bytes, Bytes>>>;

impl RangeKv for BTreeMapRangeKv {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        Ok(self.read().get(key).cloned())
    }

    fn range(
        &self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(Bytes, Bytes)>> {
        let limit = limit.unwrap_or(usize::MAX);
        Ok(self
            .read()
            .range(range)
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn rev_range(
        &self,
        range: KeyRange,
        limit: Option<usize>,
    ) -> StorageResult<Vec<(Bytes, Bytes)>> {
        let limit = limit.unwrap_or(usize::MAX);
        Ok(self
            .read()
            .range(range)
            .rev()
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn ingest_batch(
        &self,
        kv_pairs: impl Iterator<Item = (Bytes, Option<Bytes>)>,
    ) -> StorageResult<()> {
        let mut inner = self.write();
        for (key, value) in kv_pairs {
            match value {
                Some(value) => {
                    inner.insert(key, value);
                }
                None => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

pub mod sled_kv {
    use std::ops::Bound;

    use bytes::Bytes;

    use super::RangeKv;
    use crate::error::StorageResult;
    use crate::keys::KeyRange;

    #[derive(Clone)]
    pub struct SledRangeKv {
        inner: sled::Db,
    }

    impl SledRangeKv {
        pub fn open(path: impl AsRef<std::path::Path>) -> StorageResult<Self> {
            Ok(SledRangeKv {
                inner: sled::open(path)?,
            })
        }
    }

    fn to_ivec_bound(bound: &Bound<Bytes>) -> Bound<sled::IVec> {
        match bound {
            Bound::Included(b) => Bound::Included(sled::IVec::from(b.as_ref())),
            Bound::Excluded(b) => Bound::Excluded(sled::IVec::from(b.as_ref())),
            Bound::Unbounded => Bound::Unbounded,
        }
    }

    impl RangeKv for SledRangeKv {
        fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
            Ok(self
                .inner
                .get(key)?
                .map(|value| Bytes::copy_from_slice(value.as_ref())))
        }

        fn range(
            &self,
            range: KeyRange,
            limit: Option<usize>,
        ) -> StorageResult<Vec<(Bytes, Bytes)>> {
            let (left, right) = range;
            let limit = limit.unwrap_or(usize::MAX);
            let mut ret = vec![];
            for result in self
                .inner
                .range((to_ivec_bound(&left), to_ivec_bound(&right)))
                .take(limit)
            {
                let (key, value) = result?;
                ret.push((
                    Bytes::copy_from_slice(key.as_ref()),
                    Bytes::copy_from_slice(value.as_ref()),
                ));
            }
            Ok(ret)
        }

        fn rev_range(
            &self,
            range: KeyRange,
            limit: Option<usize>,
        ) -> StorageResult<Vec<(Bytes, Bytes)>> {
            let (left, right) = range;
            let limit = limit.unwrap_or(usize::MAX);
            let mut ret = vec![];
            for result in self
                .inner
                .range((to_ivec_bound(&left), to_ivec_bound(&right)))
                .rev()
                .take(limit)
            {
                let (key, value) = result?;
                ret.push((
                    Bytes::copy_from_slice(key.as_ref()),
                    Bytes::copy_from_slice(value.as_ref()),
                ));
            }
            Ok(ret)
        }

        fn ingest_batch(
            &self,
            kv_pairs: impl Iterator<Item = (Bytes, Option<Bytes>)>,
        ) -> StorageResult<()> {
            let mut batch = sled::Batch::default();
            for (key, value) in kv_pairs {
                let key = sled::IVec::from(key.as_ref());
                match value {
                    Some(value) => batch.insert(key, sled::IVec::from(value.as_ref())),
                    None => batch.remove(key),
                }
            }
            self.inner.apply_batch(batch)?;
            Ok(())
        }

        fn flush(&self) -> StorageResult<()> {
            self.inner.flush()?;
            Ok(())
        }
    }
}
