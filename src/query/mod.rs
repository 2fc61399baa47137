//! The query manager (component C2).
//!
//! Accumulates deduplicated [`StoreQuery`]s for the current batch, routes
//! them through the [`PointCache`] first, and drains whatever remains
//! against the external store, automatically reissuing continuation queries
//! for incomplete responses.

use std::sync::Arc;

use tracing::trace;

use crate::cache::PointCache;
use crate::db::metrics::Stats;
use crate::error::Result;
use crate::model::{PointId, PointValue, StoreQuery};

/// The external store's answer to one [`StoreQuery`].
#[derive(Debug, Clone)]
pub struct StoreResponse {
    /// Values returned for this query, in the store's natural order.
    pub values: Vec<PointValue>,
    /// Whether this response fully answers the query, or whether a
    /// continuation query (bounded by `limit`) must be issued next.
    pub complete: bool,
}

impl StoreResponse {
    /// A continuation query that picks up where this response left off,
    /// narrowing the interval to start just after (or, for reverse queries,
    /// just before) the last value returned.
    pub fn continuation(&self, original: &StoreQuery) -> Option<StoreQuery> {
        if self.complete {
            return None;
        }
        let last = self.values.last()?;
        let mut next = *original;
        if original.reverse {
            next.interval.before = Some(last.timestamp);
        } else {
            next.interval.after = Some(last.timestamp);
        }
        Some(next)
    }
}

/// External collaborator the query manager drains pending queries against.
pub trait StoreClient: Send + Sync {
    /// Execute one query, returning whatever the store currently holds.
    fn query(&self, query: &StoreQuery) -> Result<StoreResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct QueryKey {
    point_id: PointId,
    after: Option<crate::clock::Timestamp>,
    before: Option<crate::clock::Timestamp>,
    reverse: bool,
    sync: bool,
    not_null: bool,
    pull: bool,
    multi_row: bool,
}

impl From<&StoreQuery> for QueryKey {
    fn from(q: &StoreQuery) -> Self {
        Self {
            point_id: q.point_id,
            after: q.interval.after,
            before: q.interval.before,
            reverse: q.reverse,
            sync: q.sync,
            not_null: q.not_null,
            pull: q.pull,
            multi_row: q.multi_row,
        }
    }
}

struct Pending {
    key: QueryKey,
    query: StoreQuery,
}

/// One resolved query's values, tagged with whether they came back
/// raw/fetched (route to `input_values`) or synthesized (route to
/// `synthesized_values`); the caller (the batch) makes that distinction
/// from each value's own flags.
pub struct ResolvedQuery {
    /// The point the query was issued against.
    pub point_id: PointId,
    /// The original query (for not_null/sync bookkeeping by the caller).
    pub query: StoreQuery,
    /// Values returned, already folded across every continuation.
    pub values: Vec<PointValue>,
}

/// Accumulates and drains one batch's store queries.
#[derive(Default)]
pub struct QueryManager {
    pending: Vec<Pending>,
    stats: Option<Arc<Stats>>,
}

impl QueryManager {
    /// A query manager reporting into `stats`.
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            pending: Vec::new(),
            stats: Some(stats),
        }
    }

    /// True if there is at least one query still to drain.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Enqueue a query, deduplicating against any already-pending query with
    /// the same key. Cache consultation happens later, in `drain`: a
    /// `PrimaryBehavior` only ever holds `&mut Batch`, never the cache
    /// itself, so the short-circuit of §4.2 cannot happen at enqueue time
    /// without threading the cache through every behavior call. Deferring it
    /// to `drain` costs nothing but an extra fixed-point pass on a cache hit
    /// (the value lands in the batch's maps one pass later) and keeps the
    /// `PrimaryBehavior`/`Transform` ABI to the four methods §4.8 specifies.
    pub fn enqueue(&mut self, query: StoreQuery) {
        if let Some(stats) = &self.stats {
            stats
                .queries_prepared
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        let key = QueryKey::from(&query);
        if self.pending.iter().any(|p| p.key == key) {
            return;
        }
        self.pending.push(Pending { key, query });
    }

    /// Drain every pending query: first consulting `cache` (a hit cancels
    /// the query before it ever reaches the store), then, on a miss,
    /// round-tripping through `store`, folding continuations and feeding
    /// every returned value back into `cache` via `remember_response`.
    /// Returns one [`ResolvedQuery`] per originally enqueued (deduplicated)
    /// query.
    pub fn drain(
        &mut self,
        store: &dyn StoreClient,
        cache: &mut PointCache,
    ) -> Result<Vec<ResolvedQuery>> {
        let batch = std::mem::take(&mut self.pending);
        let mut resolved = Vec::with_capacity(batch.len());
        for pending in batch {
            let mut query = pending.query;

            if let Some(hit) = cache.handle_query(&query) {
                trace!(point = ?query.point_id, "store query cancelled by cache hit");
                resolved.push(ResolvedQuery {
                    point_id: query.point_id,
                    query,
                    values: vec![hit],
                });
                continue;
            }

            let mut values = Vec::new();
            loop {
                if let Some(stats) = &self.stats {
                    stats
                        .queries_sent
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                let response = store.query(&query)?;
                if let Some(stats) = &self.stats {
                    stats.values_received.fetch_add(
                        response.values.len() as u64,
                        std::sync::atomic::Ordering::Relaxed,
                    );
                }
                cache.remember_response(query.point_id, &query, &response.values, response.complete);
                let next = response.continuation(&query);
                values.extend(response.values);
                match next {
                    Some(continued) => query = continued,
                    None => break,
                }
            }
            resolved.push(ResolvedQuery {
                point_id: query.point_id,
                query,
                values,
            });
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Interval, Timestamp};
    use crate::db::config::CacheConfig;
    use crate::model::{Payload, PointFlags};
    use std::sync::Mutex;

    struct FakeStore {
        responses: Mutex<Vec<StoreResponse>>,
    }

    impl StoreClient for FakeStore {
        fn query(&self, _query: &StoreQuery) -> Result<StoreResponse> {
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.pop().unwrap_or(StoreResponse {
                values: Vec::new(),
                complete: true,
            }))
        }
    }

    fn query(point: u128) -> StoreQuery {
        StoreQuery {
            point_id: PointId::new(point),
            interval: Interval::UNBOUNDED,
            reverse: false,
            count_only: false,
            limit: 10,
            sync: false,
            not_null: false,
            pull: false,
            multi_row: false,
        }
    }

    #[test]
    fn duplicate_enqueue_is_deduplicated() {
        let mut qm = QueryManager::new(Arc::new(Stats::new()));
        qm.enqueue(query(1));
        qm.enqueue(query(1));
        assert_eq!(qm.pending.len(), 1);
    }

    #[test]
    fn cache_hit_short_circuits_at_drain() {
        let mut qm = QueryManager::new(Arc::new(Stats::new()));
        let stats = Arc::new(Stats::new());
        let mut cache = PointCache::new(&CacheConfig::default(), stats);
        let v = PointValue::new(PointId::new(1), Timestamp::from_nanos(5), Payload::Int(1))
            .with_flags(PointFlags::default().cacheable());
        cache.accept_notice(&v);
        let mut q = query(1);
        q.interval = Interval::instant(v.timestamp);
        qm.enqueue(q);

        let store = FakeStore {
            responses: Mutex::new(Vec::new()),
        };
        let resolved = qm.drain(&store, &mut cache).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].values.len(), 1);
    }

    #[test]
    fn drain_resolves_every_pending_query() {
        let mut qm = QueryManager::new(Arc::new(Stats::new()));
        let mut cache = PointCache::new(&CacheConfig::default(), Arc::new(Stats::new()));
        qm.enqueue(query(1));
        qm.enqueue(query(2));
        let store = FakeStore {
            responses: Mutex::new(vec![
                StoreResponse {
                    values: Vec::new(),
                    complete: true,
                },
                StoreResponse {
                    values: Vec::new(),
                    complete: true,
                },
            ]),
        };
        let resolved = qm.drain(&store, &mut cache).unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(!qm.has_pending());
    }
}
