//! The GraphQL normalized cache: in-memory storage, the optimistic overlay and the
//! [`ApolloStore`] tying them to change notifications, query watchers and fetch policies.

#![deny(clippy::future_not_send)]

mod config;
pub mod fetch_policy;
mod memory;
mod optimistic;
mod store;
mod watcher;

pub use config::{ConfigError, MemoryConfig, NormalizedCacheConfig, SqliteConfig};
pub use fetch_policy::{
    FetchError, FetchPolicy, FetchResponse, GraphqlResponse, NetworkError, NetworkTransport, QueryExecutor,
    ResponseSource,
};
pub use memory::MemoryCache;
pub use normalized_cache_api as api;
pub use optimistic::OptimisticCache;
pub use store::{ApolloStore, ApolloStoreBuilder, ChangedKeys, ReadOptions, ReadResult};

#[cfg(test)]
mod tests {
    use proptest as _;
    use rstest as _;
    use tempfile as _;
}
