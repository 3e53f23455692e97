//! Query and save configuration.

/// Default capacity of the compiled query cache.
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 512;

/// Default number of modification commands per batch (one round trip).
pub const DEFAULT_MAX_BATCH_SIZE: usize = 42;

/// Options applied while compiling and executing queries.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Attach materialized entities to the change tracker unless a query opts out.
    pub tracking: bool,

    /// Maximum number of compiled queries kept in the cache. Zero disables caching.
    pub cache_size: usize,

    /// Push `Take`/`Skip`/`First`/`Single`/`Count`/`Distinct` into SQL when possible.
    pub push_down_operators: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            tracking: true,
            cache_size: DEFAULT_QUERY_CACHE_SIZE,
            push_down_operators: true,
        }
    }
}

impl QueryOptions {
    /// Options with tracking disabled for every query.
    pub fn no_tracking() -> Self {
        Self {
            tracking: false,
            ..Default::default()
        }
    }

    /// Set the cache size.
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Evaluate every result operator on the client.
    pub fn without_push_down(mut self) -> Self {
        self.push_down_operators = false;
        self
    }
}

/// Options applied while batching modification commands.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum commands per batch.
    pub max_batch_size: usize,

    /// Combine consecutive inserts of the same shape into one multi-row statement.
    pub bulk_insert: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            bulk_insert: true,
        }
    }
}

impl BatchOptions {
    /// Set the maximum batch size (at least one command per batch).
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Disable multi-row inserts.
    pub fn without_bulk_insert(mut self) -> Self {
        self.bulk_insert = false;
        self
    }
}

/// Top-level configuration of a relational database facade.
#[derive(Debug, Clone, Default)]
pub struct RelationalOptions {
    /// Query options.
    pub query: QueryOptions,
    /// Batch options.
    pub batch: BatchOptions,
}

impl RelationalOptions {
    /// Set query options.
    pub fn with_query(mut self, query: QueryOptions) -> Self {
        self.query = query;
        self
    }

    /// Set batch options.
    pub fn with_batch(mut self, batch: BatchOptions) -> Self {
        self.batch = batch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = RelationalOptions::default();
        assert!(options.query.tracking);
        assert_eq!(options.query.cache_size, DEFAULT_QUERY_CACHE_SIZE);
        assert_eq!(options.batch.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert!(options.batch.bulk_insert);
    }

    #[test]
    fn test_batch_size_floor() {
        assert_eq!(BatchOptions::default().with_max_batch_size(0).max_batch_size, 1);
    }
}
