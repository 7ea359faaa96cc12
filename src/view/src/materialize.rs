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

//! At-most-one materialization per transformation hash.
//!
//! Queries from any client in any group that canonicalize identically share
//! one entry. Entries are reference counted; when the last reference drops,
//! teardown is deferred on an idle timer so subscribe/unsubscribe flicker
//! does not thrash the cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use syncwave_common::catalog::Catalog;
use syncwave_common::{Row, Watermark};
use syncwave_query::{transform, QueryResult, SelectAst, TransformationHash, TransformedQuery};
use syncwave_storage::{PinnedSnapshot, RangeKv};

use crate::error::ViewResult;
use crate::pipeline::execute_query;

struct Entry {
    query: Arc<TransformedQuery>,
    refcount: usize,
    /// Bumped on every acquire/release; a scheduled teardown only fires if
    /// the generation it captured is still current.
    generation: u64,
    /// Result of the newest execution, keyed by snapshot version.
    cached: Option<(Watermark, Arc<Vec<Row>>)>,
}

pub struct MaterializationRegistry {
    entries: Mutex<HashMap<TransformationHash, Entry>>,
    idle_ttl: Duration,
}

impl MaterializationRegistry {
    pub fn new(idle_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            idle_ttl,
        })
    }

    /// Canonicalize and take a reference. Two ASTs with the same hash land on
    /// the same entry.
    pub fn acquire(&self, ast: &SelectAst, catalog: &Catalog) -> QueryResult<Arc<TransformedQuery>> {
        let transformed = transform(ast, catalog)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(transformed.hash.clone())
            .or_insert_with(|| Entry {
                query: Arc::new(transformed),
                refcount: 0,
                generation: 0,
                cached: None,
            });
        entry.refcount += 1;
        entry.generation += 1;
        Ok(entry.query.clone())
    }

    /// Drop one reference. The entry survives `idle_ttl` past the last drop.
    pub fn release(self: &Arc<Self>, hash: &TransformationHash) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(hash) else {
            return;
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        entry.generation += 1;
        if entry.refcount > 0 {
            return;
        }
        let generation = entry.generation;
        let registry = self.clone();
        let hash = hash.clone();
        let ttl = self.idle_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut entries = registry.entries.lock();
            if let Some(entry) = entries.get(&hash) {
                if entry.refcount == 0 && entry.generation == generation {
                    tracing::debug!(%hash, "tearing down idle materialization");
                    entries.remove(&hash);
                }
            }
        });
    }

    /// Execute the materialization at the snapshot's version, reusing the
    /// cached result when the version matches.
    pub fn execute<R: RangeKv>(
        &self,
        hash: &TransformationHash,
        snapshot: &PinnedSnapshot<R>,
    ) -> ViewResult<Arc<Vec<Row>>> {
        {
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(hash) {
                if let Some((version, rows)) = &entry.cached {
                    if version == snapshot.version() {
                        return Ok(rows.clone());
                    }
                }
            }
        }
        let query = {
            let entries = self.entries.lock();
            entries
                .get(hash)
                .map(|entry| entry.query.clone())
                .ok_or_else(|| {
                    crate::error::ViewError::Protocol(format!("no materialization for {hash}"))
                })?
        };
        let rows = Arc::new(execute_query(&query, snapshot)?);
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(hash) {
            entry.cached = Some((snapshot.version().clone(), rows.clone()));
        }
        Ok(rows)
    }

    pub fn contains(&self, hash: &TransformationHash) -> bool {
        self.entries.lock().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use syncwave_query::{CmpOp, Condition};

    use super::*;
    use crate::pipeline::tests::{issues_catalog, seeded_replica};

    fn acme_ast() -> SelectAst {
        SelectAst {
            table: "public.issues".into(),
            columns: vec!["title".into()],
            filter: Some(Condition::Cmp {
                column: "org".into(),
                op: CmpOp::Eq,
                value: "acme".into(),
            }),
            order_by: vec![],
            related: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_materialization_lifecycle() {
        let registry = MaterializationRegistry::new(Duration::from_secs(5));
        let catalog = issues_catalog();

        // Two acquirers, e.g. clients in different groups, one entry.
        let q1 = registry.acquire(&acme_ast(), &catalog).unwrap();
        let mut scrambled = acme_ast();
        scrambled.columns = vec!["title".into(), "org".into()];
        let q2 = registry.acquire(&scrambled, &catalog).unwrap();
        assert_eq!(q1.hash, q2.hash);
        assert_eq!(registry.len(), 1);

        // Releasing one reference keeps the materialization alive.
        registry.release(&q1.hash);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.contains(&q1.hash));

        // Releasing the last reference schedules teardown after the idle
        // timer.
        registry.release(&q2.hash);
        assert!(registry.contains(&q1.hash));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!registry.contains(&q1.hash));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_cancels_teardown() {
        let registry = MaterializationRegistry::new(Duration::from_secs(5));
        let catalog = issues_catalog();

        let q = registry.acquire(&acme_ast(), &catalog).unwrap();
        registry.release(&q.hash);
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Resubscribe inside the idle window: the pending teardown is stale.
        let _q = registry.acquire(&acme_ast(), &catalog).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.contains(&q.hash));
    }

    #[tokio::test]
    async fn test_execute_caches_per_version() {
        let registry = MaterializationRegistry::new(Duration::from_secs(5));
        let replica = seeded_replica();
        let q = registry.acquire(&acme_ast(), &issues_catalog()).unwrap();

        let snapshot = replica.pin();
        let first = registry.execute(&q.hash, &snapshot).unwrap();
        let second = registry.execute(&q.hash, &snapshot).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
    }
}
