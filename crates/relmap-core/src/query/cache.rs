//! Compiled query cache.
//!
//! Compiling a query model is far more expensive than executing it, so compiled
//! queries are cached by a structural fingerprint of the model. Source identities are
//! renumbered in declaration order before hashing, so two models built the same way
//! share an entry even though their sources were created separately. Parameter
//! values are not part of the model and never split entries.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::Result;
use crate::metadata::Model;

use super::context::ExecutionMode;
use super::executor::CompiledQuery;
use super::model::{QueryModel, QuerySourceId};

/// Structural fingerprint of a query model.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct QueryFingerprint {
    hash: String,
}

impl QueryFingerprint {
    /// Fingerprint a query model.
    pub fn of(query: &QueryModel) -> Result<Self> {
        let mut canonical = query.clone();
        let mut ids: HashMap<QuerySourceId, QuerySourceId> = HashMap::new();
        canonical.remap_sources(&mut |id| {
            let next = QuerySourceId::from_raw(ids.len() as u32);
            *ids.entry(id).or_insert(next)
        })?;

        let bytes = serde_json::to_vec(&canonical)?;
        Ok(Self {
            hash: hex::encode(blake3::hash(&bytes).as_bytes()),
        })
    }

    /// Hex form of the fingerprint.
    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash[..16.min(self.hash.len())])
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct CacheKey {
    fingerprint: QueryFingerprint,
    mode: ExecutionMode,
}

/// A compiled query with the model version it was compiled against.
#[derive(Debug)]
pub struct CachedQuery {
    pub query: CompiledQuery,
    pub model_version: u64,
    hit_count: AtomicU64,
}

impl CachedQuery {
    pub fn new(query: CompiledQuery, model_version: u64) -> Self {
        Self {
            query,
            model_version,
            hit_count: AtomicU64::new(0),
        }
    }

    /// Increment the hit count and return the new value.
    pub fn record_hit(&self) -> u64 {
        self.hit_count.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    pub fn hits(&self) -> u64 {
        self.hit_count.load(AtomicOrdering::Relaxed)
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(AtomicOrdering::Relaxed)
    }

    /// Hit rate between 0.0 and 1.0.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// Concurrent cache of compiled queries, evicting the least-hit entry when full.
///
/// Entries compiled against an older model version are treated as misses.
pub struct CompiledQueryCache {
    entries: DashMap<CacheKey, CachedQuery>,
    max_entries: usize,
    model_version: AtomicU64,
    stats: CacheStats,
}

impl CompiledQueryCache {
    /// Create a cache holding at most `max_entries` queries; zero disables caching.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            model_version: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Look up a compiled query.
    pub fn get(&self, fingerprint: &QueryFingerprint, mode: ExecutionMode) -> Option<CompiledQuery> {
        let key = CacheKey {
            fingerprint: fingerprint.clone(),
            mode,
        };
        let current = self.model_version.load(AtomicOrdering::SeqCst);
        if let Some(cached) = self.entries.get(&key) {
            if cached.model_version == current {
                cached.record_hit();
                self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                return Some(cached.query.clone());
            }
        }
        self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
        None
    }

    /// Store a compiled query.
    pub fn insert(&self, fingerprint: QueryFingerprint, mode: ExecutionMode, query: CompiledQuery, model_version: u64) {
        if self.max_entries == 0 {
            return;
        }
        self.model_version.fetch_max(model_version, AtomicOrdering::SeqCst);

        let key = CacheKey { fingerprint, mode };
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict_least_used();
        }
        trace!(fingerprint = %key.fingerprint, mode = mode.as_str(), "compiled query cached");
        self.entries.insert(key, CachedQuery::new(query, model_version));
    }

    /// Return the cached query for `query`, compiling and caching it on a miss.
    pub fn get_or_compile(
        &self,
        query: &QueryModel,
        model: &Arc<Model>,
        mode: ExecutionMode,
        compile: impl FnOnce() -> Result<CompiledQuery>,
    ) -> Result<CompiledQuery> {
        if self.max_entries == 0 {
            return compile();
        }
        if model.version > self.model_version.load(AtomicOrdering::SeqCst) {
            self.invalidate(model.version);
        }

        let fingerprint = QueryFingerprint::of(query)?;
        if let Some(compiled) = self.get(&fingerprint, mode) {
            debug!(fingerprint = %fingerprint, "compiled query cache hit");
            return Ok(compiled);
        }
        let compiled = compile()?;
        self.insert(fingerprint, mode, compiled.clone(), model.version);
        Ok(compiled)
    }

    /// Drop every entry and adopt a new model version.
    pub fn invalidate(&self, model_version: u64) {
        self.model_version.store(model_version, AtomicOrdering::SeqCst);
        self.entries.clear();
        debug!(model_version, "compiled query cache invalidated");
    }

    fn evict_least_used(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().hits())
            .map(|entry| entry.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            self.stats.evictions.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryOptions;
    use crate::dialect::SqlServerDialect;
    use crate::metadata::{EntityType, Property, ScalarType};
    use crate::query::expression::Expression;
    use crate::query::model::QuerySource;

    fn create_test_model() -> Arc<Model> {
        Arc::new(
            Model::new().with_entity_type(
                EntityType::new("User")
                    .with_table("Users")
                    .with_key(Property::new("Id", ScalarType::Int32))
                    .with_property(Property::new("Name", ScalarType::String)),
            ),
        )
    }

    fn users_named(parameter: &str) -> QueryModel {
        let u = QuerySource::entity("u", "User");
        QueryModel::from_entity(&u).filter(u.member("Name").equal(Expression::parameter(parameter)))
    }

    fn compile(query: &QueryModel) -> Result<CompiledQuery> {
        CompiledQuery::compile(
            query,
            create_test_model(),
            Arc::new(SqlServerDialect::new()),
            QueryOptions::default(),
            ExecutionMode::Sync,
        )
    }

    #[test]
    fn test_fingerprint_ignores_source_identity() {
        let a = QueryFingerprint::of(&users_named("name")).unwrap();
        let b = QueryFingerprint::of(&users_named("name")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_differs_by_structure() {
        let a = QueryFingerprint::of(&users_named("name")).unwrap();
        let b = QueryFingerprint::of(&users_named("other")).unwrap();
        let c = QueryFingerprint::of(&users_named("name").take(1)).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_get_or_compile_hits_second_time() {
        let cache = CompiledQueryCache::new(8);
        let model = create_test_model();
        let mut compiled = 0;

        for _ in 0..2 {
            let query = users_named("name");
            cache
                .get_or_compile(&query, &model, ExecutionMode::Sync, || {
                    compiled += 1;
                    compile(&query)
                })
                .unwrap();
        }

        assert_eq!(compiled, 1);
        assert_eq!(cache.stats().hits(), 1);
        assert_eq!(cache.stats().misses(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_mode_is_part_of_the_key() {
        let cache = CompiledQueryCache::new(8);
        let query = users_named("name");
        let fingerprint = QueryFingerprint::of(&query).unwrap();
        cache.insert(fingerprint.clone(), ExecutionMode::Sync, compile(&query).unwrap(), 0);

        assert!(cache.get(&fingerprint, ExecutionMode::Sync).is_some());
        assert!(cache.get(&fingerprint, ExecutionMode::Async).is_none());
    }

    #[test]
    fn test_eviction_and_invalidation() {
        let cache = CompiledQueryCache::new(2);
        let queries = [users_named("a"), users_named("b"), users_named("c")];
        let fingerprints: Vec<_> = queries.iter().map(|q| QueryFingerprint::of(q).unwrap()).collect();

        cache.insert(fingerprints[0].clone(), ExecutionMode::Sync, compile(&queries[0]).unwrap(), 1);
        cache.insert(fingerprints[1].clone(), ExecutionMode::Sync, compile(&queries[1]).unwrap(), 1);
        cache.get(&fingerprints[1], ExecutionMode::Sync);
        cache.insert(fingerprints[2].clone(), ExecutionMode::Sync, compile(&queries[2]).unwrap(), 1);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions(), 1);
        assert!(cache.get(&fingerprints[1], ExecutionMode::Sync).is_some());

        cache.invalidate(2);
        assert!(cache.is_empty());
        assert!(cache.get(&fingerprints[2], ExecutionMode::Sync).is_none());
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let cache = CompiledQueryCache::new(0);
        let model = create_test_model();
        let query = users_named("name");
        cache
            .get_or_compile(&query, &model, ExecutionMode::Sync, || compile(&query))
            .unwrap();
        assert!(cache.is_empty());
    }
}
