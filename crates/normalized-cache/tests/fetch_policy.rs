#![allow(unused_crate_dependencies)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use normalized_cache::{
    api::{ArgumentValue, CacheHeaders, Field, IdCacheKeyGenerator, Operation, Variables},
    ApolloStore, FetchError, FetchPolicy, GraphqlResponse, NetworkError, NetworkTransport, QueryExecutor,
    ReadOptions, ResponseSource,
};
use rstest::rstest;
use serde_json::{json, Map, Value};
use tokio_stream::StreamExt;

#[derive(Default)]
struct MockTransport {
    responses: Mutex<VecDeque<Result<GraphqlResponse, NetworkError>>>,
    calls: AtomicUsize,
}

impl MockTransport {
    fn respond(self, response: Result<Value, NetworkError>) -> Self {
        let response = response.map(|value| serde_json::from_value(value).unwrap());
        self.responses.lock().unwrap().push_back(response);
        self
    }
}

#[async_trait::async_trait]
impl NetworkTransport for MockTransport {
    async fn execute(&self, _: &Operation, _: &Variables) -> Result<GraphqlResponse, NetworkError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(NetworkError::Transport("no more responses".into())))
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(object) => object,
        _ => unreachable!(),
    }
}

fn hero_query() -> Operation {
    Operation::query(
        "Hero",
        [Field::new("hero")
            .selections([Field::new("id").into(), Field::new("name").into()])
            .into()],
    )
}

fn network_hero(name: &str) -> Result<Value, NetworkError> {
    Ok(json!({"data": {"hero": {"id": "1000", "name": name}}}))
}

fn offline() -> Result<Value, NetworkError> {
    Err(NetworkError::Transport("offline".into()))
}

async fn executor(cached: bool, response: Result<Value, NetworkError>) -> QueryExecutor<MockTransport> {
    let store = Arc::new(
        ApolloStore::builder()
            .key_generator(IdCacheKeyGenerator::default())
            .build(),
    );
    if cached {
        store
            .write_operation(
                &hero_query(),
                &object(json!({"hero": {"id": "1000", "name": "Luke"}})),
                &Variables::new(),
                &CacheHeaders::none(),
                true,
            )
            .await;
    }
    QueryExecutor::new(store, MockTransport::default().respond(response))
}

#[rstest]
#[case::cache_first_hit(FetchPolicy::CacheFirst, true, network_hero("Leia"), ResponseSource::Cache, "Luke", 0)]
#[case::cache_first_miss(FetchPolicy::CacheFirst, false, network_hero("Leia"), ResponseSource::Network, "Leia", 1)]
#[case::network_first(FetchPolicy::NetworkFirst, true, network_hero("Leia"), ResponseSource::Network, "Leia", 1)]
#[case::network_first_offline(FetchPolicy::NetworkFirst, true, offline(), ResponseSource::Cache, "Luke", 1)]
#[case::cache_only(FetchPolicy::CacheOnly, true, network_hero("Leia"), ResponseSource::Cache, "Luke", 0)]
#[case::network_only(FetchPolicy::NetworkOnly, true, network_hero("Leia"), ResponseSource::Network, "Leia", 1)]
#[case::cache_and_network(FetchPolicy::CacheAndNetwork, true, network_hero("Leia"), ResponseSource::Network, "Leia", 1)]
#[tokio::test]
async fn policies(
    #[case] policy: FetchPolicy,
    #[case] cached: bool,
    #[case] response: Result<Value, NetworkError>,
    #[case] source: ResponseSource,
    #[case] name: &str,
    #[case] calls: usize,
) {
    let executor = executor(cached, response).await;

    let response = executor
        .execute(&hero_query(), &Variables::new(), policy)
        .await
        .unwrap();

    assert_eq!(response.source, source);
    assert_eq!(response.data["hero"]["name"], json!(name));
    assert_eq!(executor_calls(&executor), calls);
}

fn executor_calls(executor: &QueryExecutor<MockTransport>) -> usize {
    executor.transport().calls.load(Ordering::Relaxed)
}

#[tokio::test]
async fn both_failures_are_kept() {
    let executor = executor(false, offline()).await;

    let error = executor
        .execute(&hero_query(), &Variables::new(), FetchPolicy::CacheFirst)
        .await
        .unwrap_err();

    let FetchError::CacheAndNetwork { cache, network } = error else {
        unreachable!();
    };
    assert!(cache.as_miss().is_some());
    assert!(matches!(network, NetworkError::Transport(_)));
}

#[tokio::test]
async fn cache_only_does_not_touch_the_network() {
    let executor = executor(false, network_hero("Leia")).await;

    let error = executor
        .execute(&hero_query(), &Variables::new(), FetchPolicy::CacheOnly)
        .await
        .unwrap_err();

    assert!(matches!(error, FetchError::Cache(_)));
    assert_eq!(executor_calls(&executor), 0);
}

#[tokio::test]
async fn cache_and_network_streams_both() {
    let executor = executor(true, network_hero("Leia")).await;

    let responses = executor
        .execute_stream(&hero_query(), &Variables::new(), FetchPolicy::CacheAndNetwork)
        .collect::<Vec<_>>()
        .await;

    let responses = responses
        .into_iter()
        .map(|response| {
            let response = response.unwrap();
            (response.source, response.data["hero"]["name"].clone())
        })
        .collect::<Vec<_>>();
    assert_eq!(
        responses,
        [
            (ResponseSource::Cache, json!("Luke")),
            (ResponseSource::Network, json!("Leia"))
        ]
    );
}

#[tokio::test]
async fn responses_with_errors_are_not_stored() {
    let executor = executor(false, Ok(json!({
        "data": {"hero": {"id": "1000", "name": "Leia"}},
        "errors": [{"message": "partial failure"}]
    })))
    .await;

    let response = executor
        .execute(&hero_query(), &Variables::new(), FetchPolicy::NetworkOnly)
        .await
        .unwrap();
    assert_eq!(response.errors.len(), 1);

    assert!(executor
        .store()
        .read_operation(&hero_query(), &Variables::new(), &ReadOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn optimistic_mutations_publish_once_settled() {
    let mutation = Operation::mutation(
        "UpdateHero",
        [Field::new("updateHero")
            .argument("id", ArgumentValue::literal("1000"))
            .argument("name", ArgumentValue::variable("name"))
            .selections([Field::new("id").into(), Field::new("name").into()])
            .into()],
    );
    let variables = object(json!({"name": "Luke Skywalker"}));
    let executor = executor(
        true,
        Ok(json!({"data": {"updateHero": {"id": "1000", "name": "Luke Skywalker"}}})),
    )
    .await;
    let mut changes = executor.store().changed_keys();

    let optimistic = object(json!({"updateHero": {"id": "1000", "name": "Optimistic Luke"}}));
    let response = executor
        .mutate(&mutation, &variables, Some(&optimistic))
        .await
        .unwrap();
    assert_eq!(response.data["updateHero"]["name"], json!("Luke Skywalker"));

    let optimistic_batch = changes.next().await.unwrap().unwrap();
    assert!(optimistic_batch.contains("1000.name"));
    let settled_batch = changes.next().await.unwrap().unwrap();
    assert!(settled_batch.contains("1000.name"));

    let read = executor
        .store()
        .read_operation(&hero_query(), &Variables::new(), &ReadOptions::default())
        .await
        .unwrap();
    assert_eq!(read.data["hero"]["name"], json!("Luke Skywalker"));
    assert!(executor.store().dump().await["OptimisticCache"].is_empty());
}
