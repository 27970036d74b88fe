//! Combines cache reads and network requests according to a [`FetchPolicy`].

use std::{collections::HashSet, sync::Arc};

use futures_util::{stream, Stream};
use normalized_cache_api::{CacheError, CacheHeaders, Operation, Variables};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{ApolloStore, ReadOptions};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Cache, then network on a miss.
    #[default]
    CacheFirst,
    /// Network, then cache when the network fails.
    NetworkFirst,
    CacheOnly,
    NetworkOnly,
    /// Cache hit first if any, then the network response.
    CacheAndNetwork,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub errors: Vec<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("The response has no data, {} errors", .errors.len())]
    NoData { errors: Vec<Value> },
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("Cache and network both failed: {cache}; {network}")]
    CacheAndNetwork { cache: CacheError, network: NetworkError },
}

/// Sends operations to a GraphQL server.
#[async_trait::async_trait]
pub trait NetworkTransport: Send + Sync {
    async fn execute(&self, operation: &Operation, variables: &Variables) -> Result<GraphqlResponse, NetworkError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchResponse {
    pub data: Map<String, Value>,
    pub errors: Vec<Value>,
    pub source: ResponseSource,
}

pub struct QueryExecutor<T> {
    store: Arc<ApolloStore>,
    transport: T,
    store_partial_responses: bool,
}

impl<T: NetworkTransport> QueryExecutor<T> {
    pub fn new(store: Arc<ApolloStore>, transport: T) -> Self {
        QueryExecutor {
            store,
            transport,
            store_partial_responses: false,
        }
    }

    /// Also write responses carrying errors next to their data.
    #[must_use]
    pub fn store_partial_responses(mut self, store_partial_responses: bool) -> Self {
        self.store_partial_responses = store_partial_responses;
        self
    }

    pub fn store(&self) -> &Arc<ApolloStore> {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs `operation` and returns its final response. With [`FetchPolicy::CacheAndNetwork`] that
    /// is the network response, the cached one when the network fails; see
    /// [`QueryExecutor::execute_stream`] to get both.
    pub async fn execute(
        &self,
        operation: &Operation,
        variables: &Variables,
        policy: FetchPolicy,
    ) -> Result<FetchResponse, FetchError> {
        match policy {
            FetchPolicy::CacheOnly => Ok(self.read_cache(operation, variables).await?),
            FetchPolicy::NetworkOnly => Ok(self.fetch_network(operation, variables).await?),
            FetchPolicy::CacheFirst => match self.read_cache(operation, variables).await {
                Ok(response) => Ok(response),
                Err(cache) => {
                    tracing::debug!("cache miss for {}: {cache}", operation.name);
                    self.fetch_network(operation, variables)
                        .await
                        .map_err(|network| FetchError::CacheAndNetwork { cache, network })
                }
            },
            FetchPolicy::NetworkFirst | FetchPolicy::CacheAndNetwork => {
                match self.fetch_network(operation, variables).await {
                    Ok(response) => Ok(response),
                    Err(network) => {
                        tracing::debug!("network failure for {}: {network}", operation.name);
                        self.read_cache(operation, variables)
                            .await
                            .map_err(|cache| FetchError::CacheAndNetwork { cache, network })
                    }
                }
            }
        }
    }

    /// Like [`QueryExecutor::execute`], but [`FetchPolicy::CacheAndNetwork`] yields the cached
    /// response, when there is one, before the network one. When only the network fails after a
    /// cache hit, the stream ends with the network error.
    pub fn execute_stream<'a>(
        &'a self,
        operation: &'a Operation,
        variables: &'a Variables,
        policy: FetchPolicy,
    ) -> impl Stream<Item = Result<FetchResponse, FetchError>> + Send + 'a {
        enum Step {
            Start,
            Network { cache: Option<CacheError> },
            Done,
        }

        stream::unfold(Step::Start, move |step| async move {
            match (step, policy) {
                (Step::Start, FetchPolicy::CacheAndNetwork) => match self.read_cache(operation, variables).await {
                    Ok(response) => Some((Ok(response), Step::Network { cache: None })),
                    Err(cache) => {
                        let network = self.fetch_network(operation, variables).await;
                        let item = network.map_err(|network| FetchError::CacheAndNetwork { cache, network });
                        Some((item, Step::Done))
                    }
                },
                (Step::Start, policy) => Some((self.execute(operation, variables, policy).await, Step::Done)),
                (Step::Network { cache }, _) => {
                    let item = self.fetch_network(operation, variables).await.map_err(|network| match cache {
                        Some(cache) => FetchError::CacheAndNetwork { cache, network },
                        None => FetchError::Network(network),
                    });
                    Some((item, Step::Done))
                }
                (Step::Done, _) => None,
            }
        })
    }

    /// Runs a mutation. When `optimistic_data` is given, it is written as optimistic updates
    /// first, then rolled back once the server answers. The rollback and the write of the real
    /// response are published as a single change batch.
    pub async fn mutate(
        &self,
        operation: &Operation,
        variables: &Variables,
        optimistic_data: Option<&Map<String, Value>>,
    ) -> Result<FetchResponse, FetchError> {
        let mutation_id = Uuid::new_v4();
        if let Some(data) = optimistic_data {
            self.store
                .write_optimistic_updates(operation, data, variables, mutation_id, true)
                .await;
        }

        let response = self.transport.execute(operation, variables).await;

        let mut changed = HashSet::new();
        if optimistic_data.is_some() {
            changed.extend(self.store.rollback_optimistic_updates(mutation_id, false).await);
        }

        let result = match response {
            Ok(response) => match self.accept(response) {
                Ok((data, errors, store)) => {
                    if store {
                        changed.extend(
                            self.store
                                .write_operation(operation, &data, variables, &CacheHeaders::none(), false)
                                .await,
                        );
                    }
                    Ok(FetchResponse {
                        data,
                        errors,
                        source: ResponseSource::Network,
                    })
                }
                Err(error) => Err(error.into()),
            },
            Err(error) => Err(error.into()),
        };

        self.store.publish(changed);
        result
    }

    async fn read_cache(&self, operation: &Operation, variables: &Variables) -> Result<FetchResponse, CacheError> {
        let read = self
            .store
            .read_operation(operation, variables, &ReadOptions::default())
            .await?;

        Ok(FetchResponse {
            data: read.data,
            errors: Vec::new(),
            source: ResponseSource::Cache,
        })
    }

    async fn fetch_network(&self, operation: &Operation, variables: &Variables) -> Result<FetchResponse, NetworkError> {
        let response = self.transport.execute(operation, variables).await?;
        let (data, errors, store) = self.accept(response)?;

        if store {
            self.store
                .write_operation(operation, &data, variables, &CacheHeaders::none(), true)
                .await;
        }

        Ok(FetchResponse {
            data,
            errors,
            source: ResponseSource::Network,
        })
    }

    /// Splits a response into its data, its errors and whether it may be written.
    fn accept(&self, response: GraphqlResponse) -> Result<(Map<String, Value>, Vec<Value>, bool), NetworkError> {
        let GraphqlResponse { data, errors } = response;
        match data {
            Some(data) => {
                let store = errors.is_empty() || self.store_partial_responses;
                Ok((data, errors, store))
            }
            None => Err(NetworkError::NoData { errors }),
        }
    }
}
