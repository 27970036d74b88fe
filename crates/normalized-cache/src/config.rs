use std::{path::PathBuf, sync::Arc, time::Duration};

use normalized_cache_api::{IdCacheKeyGenerator, NormalizedCache, ReceiveDateCacheResolver};
use normalized_cache_sqlite::{SqliteCache, SqliteError};

use crate::{ApolloStore, MemoryCache};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Sqlite(#[from] SqliteError),
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizedCacheConfig {
    pub memory: MemoryConfig,
    /// Persists records in SQLite behind the memory cache.
    pub sqlite: Option<SqliteConfig>,
    /// Serve fields received at most this long ago. Enables receive dates on writes.
    pub max_age_seconds: Option<u64>,
    /// How many change batches a slow subscriber may fall behind before losing some.
    pub changed_keys_capacity: usize,
    /// Fields identifying objects, e.g. `["id"]`. Objects are keyed by path when empty.
    pub cache_key_fields: Vec<String>,
}

impl Default for NormalizedCacheConfig {
    fn default() -> Self {
        NormalizedCacheConfig {
            memory: MemoryConfig::default(),
            sqlite: None,
            max_age_seconds: None,
            changed_keys_capacity: 64,
            cache_key_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub max_size_bytes: Option<usize>,
    pub expire_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqliteConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub track_dates: bool,
}

impl NormalizedCacheConfig {
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml)?)
    }
}

impl ApolloStore {
    /// Builds a store from its configuration, opening the SQLite database if there is one.
    pub async fn from_config(config: &NormalizedCacheConfig) -> Result<ApolloStore, ConfigError> {
        let mut memory = MemoryCache::new();
        if let Some(max_size_bytes) = config.memory.max_size_bytes {
            memory = memory.max_size_bytes(max_size_bytes);
        }
        if let Some(seconds) = config.memory.expire_after_seconds {
            memory = memory.expire_after(Duration::from_secs(seconds));
        }

        // `max_age_seconds` needs receive dates on persisted records too
        let mut track_dates = config.max_age_seconds.is_some();
        if let Some(sqlite) = &config.sqlite {
            track_dates |= sqlite.track_dates;
            let cache = SqliteCache::open(&sqlite.path, track_dates).await?;
            memory = memory.chain(Arc::new(cache));
        }

        let cache: Arc<dyn NormalizedCache> = Arc::new(memory);
        let mut builder = ApolloStore::builder()
            .cache(cache)
            .track_dates(track_dates)
            .changed_keys_capacity(config.changed_keys_capacity);

        if !config.cache_key_fields.is_empty() {
            builder = builder.key_generator(IdCacheKeyGenerator::new(config.cache_key_fields.iter().cloned()));
        }
        if let Some(max_age_seconds) = config.max_age_seconds {
            builder = builder.resolver(ReceiveDateCacheResolver::new(max_age_seconds));
        }

        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = NormalizedCacheConfig::from_toml("").unwrap();
        assert_eq!(config, NormalizedCacheConfig::default());
        assert_eq!(config.changed_keys_capacity, 64);
    }

    #[test]
    fn full() {
        let config = NormalizedCacheConfig::from_toml(
            r#"
            max_age_seconds = 3600
            changed_keys_capacity = 16
            cache_key_fields = ["id"]

            [memory]
            max_size_bytes = 10485760
            expire_after_seconds = 600

            [sqlite]
            path = "cache.sqlite"
            track_dates = true
            "#,
        )
        .unwrap();

        assert_eq!(
            config,
            NormalizedCacheConfig {
                memory: MemoryConfig {
                    max_size_bytes: Some(10_485_760),
                    expire_after_seconds: Some(600),
                },
                sqlite: Some(SqliteConfig {
                    path: PathBuf::from("cache.sqlite"),
                    track_dates: true,
                }),
                max_age_seconds: Some(3600),
                changed_keys_capacity: 16,
                cache_key_fields: vec!["id".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn max_age_tracks_dates_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");
        let config = NormalizedCacheConfig {
            max_age_seconds: Some(3600),
            sqlite: Some(SqliteConfig {
                path: path.clone(),
                track_dates: false,
            }),
            ..Default::default()
        };

        drop(ApolloStore::from_config(&config).await.unwrap());

        assert!(SqliteCache::open(&path, true).await.is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = NormalizedCacheConfig::from_toml("[memory]\nmax_size = 10").unwrap_err();
        assert!(error.to_string().contains("unknown field `max_size`"), "{error}");
    }
}
