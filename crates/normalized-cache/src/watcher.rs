use std::{collections::HashSet, sync::Arc};

use futures_util::{stream, Stream};
use normalized_cache_api::{CacheError, Operation, Variables};
use serde_json::{Map, Value};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::{ApolloStore, ChangedKeys, ReadOptions, ReadResult};

struct Watcher {
    store: Arc<ApolloStore>,
    operation: Operation,
    variables: Variables,
    options: ReadOptions,
    changes: BroadcastStream<ChangedKeys>,
    /// Dependent keys of the last successful read, `None` before the first one and after errors.
    dependent_keys: Option<HashSet<String>>,
    last: Last,
}

#[derive(PartialEq)]
enum Last {
    Nothing,
    Data(Map<String, Value>),
    Error(String),
}

impl ApolloStore {
    /// Reads `operation` now and again every time a published change touches one of the fields
    /// the previous read depended on. Reads yielding the same outcome as the previous one are not
    /// repeated in the stream.
    ///
    /// Dropped change batches, when the stream is not polled fast enough, always trigger a re-read.
    /// After a failed read, any change triggers one.
    pub fn watch(
        self: &Arc<Self>,
        operation: Operation,
        variables: Variables,
        options: ReadOptions,
    ) -> impl Stream<Item = Result<ReadResult, CacheError>> + Send + 'static {
        // Subscribe before the first read so no change made in between is lost.
        let watcher = Watcher {
            store: Arc::clone(self),
            operation,
            variables,
            options,
            changes: self.changed_keys(),
            dependent_keys: None,
            last: Last::Nothing,
        };

        stream::unfold(watcher, |mut watcher| async move {
            if watcher.last != Last::Nothing && watcher.wait_for_change().await.is_none() {
                return None;
            }

            loop {
                let result = watcher.read().await;
                let last = match &result {
                    Ok(read) => Last::Data(read.data.clone()),
                    Err(error) => Last::Error(error.to_string()),
                };
                if last != watcher.last {
                    watcher.last = last;
                    return Some((result, watcher));
                }
                if watcher.wait_for_change().await.is_none() {
                    return None;
                }
            }
        })
    }
}

impl Watcher {
    async fn read(&mut self) -> Result<ReadResult, CacheError> {
        let result = self
            .store
            .read_operation(&self.operation, &self.variables, &self.options)
            .await;
        self.dependent_keys = result.as_ref().ok().map(|read| read.dependent_keys.clone());
        result
    }

    /// `None` once the channel is closed.
    async fn wait_for_change(&mut self) -> Option<()> {
        loop {
            match self.changes.next().await? {
                Ok(changed) => {
                    let relevant = match &self.dependent_keys {
                        Some(dependent_keys) => !changed.is_disjoint(dependent_keys),
                        None => true,
                    };
                    if relevant {
                        return Some(());
                    }
                }
                Err(error) => {
                    tracing::debug!("query watcher lagging behind: {error}");
                    return Some(());
                }
            }
        }
    }
}
