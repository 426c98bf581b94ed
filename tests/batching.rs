// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use amqp_core::{
    contract::MessageDefinition,
    dispatcher::ConsumerOptions,
    errors::HandlerError,
    handler::{batch_handler_fn, ConsumerMessage},
    headers,
    memory::Operation,
    publisher::PublishOptions,
    queue::QueueDefinition,
    retry::{RetryPolicy, TtlBackoffPolicy, AMQP_HEADERS_LAST_ERROR, AMQP_HEADERS_RETRY_COUNT},
    schema::AnyObject,
    ConsumerRegistration,
};
use common::{eventually, orders_topology, Harness};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;

type Batches = Arc<Mutex<Vec<(Instant, Vec<i64>)>>>;

fn recording(batches: &Batches, options: ConsumerOptions) -> ConsumerRegistration {
    let seen = batches.clone();
    ConsumerRegistration::new(batch_handler_fn(move |msgs: Vec<ConsumerMessage>| {
        let ids = msgs.iter().filter_map(|m| m.payload["n"].as_i64()).collect();
        seen.lock().unwrap().push((Instant::now(), ids));
        async { Ok::<(), HandlerError>(()) }
    }))
    .options(options)
}

fn harness() -> Harness {
    Harness::new(orders_topology(
        QueueDefinition::classic("orders"),
        MessageDefinition::new(AnyObject),
    ))
}

#[tokio::test(start_paused = true)]
async fn full_windows_flush_in_publish_order() {
    let harness = harness();
    let client = harness.client().await;
    for n in 0..7 {
        client
            .publish("orderCreated", &json!({ "n": n }), PublishOptions::new())
            .await
            .unwrap();
    }

    let batches = Batches::default();
    let worker = harness
        .worker("orders", recording(&batches, ConsumerOptions::new().batch_size(3)))
        .await;

    assert!(eventually(|| batches.lock().unwrap().len() == 3).await);

    let sizes: Vec<Vec<i64>> = batches.lock().unwrap().iter().map(|(_, ids)| ids.clone()).collect();
    assert_eq!(sizes, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    assert_eq!(harness.broker.message_count("orders"), 0);
    assert_eq!(harness.broker.unacked_count("orders"), 0);

    // batch size doubles as prefetch when none is given
    assert!(harness.broker.operations().contains(&Operation::Qos(3)));

    worker.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn partial_window_flushes_on_timeout() {
    let harness = harness();
    let client = harness.client().await;
    for n in 0..2 {
        client
            .publish("orderCreated", &json!({ "n": n }), PublishOptions::new())
            .await
            .unwrap();
    }

    let started = Instant::now();
    let batches = Batches::default();
    let worker = harness
        .worker(
            "orders",
            recording(
                &batches,
                ConsumerOptions::new()
                    .batch_size(5)
                    .batch_timeout(Duration::from_millis(500)),
            ),
        )
        .await;

    assert!(eventually(|| !batches.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let batches = batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);

    let (flushed_at, ids) = &batches[0];
    assert_eq!(ids, &vec![0, 1]);
    let waited = *flushed_at - started;
    assert!(
        waited >= Duration::from_millis(500) && waited < Duration::from_millis(600),
        "flushed after {:?}",
        waited
    );

    worker.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn closing_flushes_the_open_window() {
    let harness = harness();
    let client = harness.client().await;
    client
        .publish("orderCreated", &json!({ "n": 1 }), PublishOptions::new())
        .await
        .unwrap();

    let batches = Batches::default();
    let worker = harness
        .worker(
            "orders",
            recording(
                &batches,
                ConsumerOptions::new()
                    .batch_size(10)
                    .batch_timeout(Duration::from_secs(60)),
            ),
        )
        .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.broker.unacked_count("orders"), 1);
    assert!(batches.lock().unwrap().is_empty());

    worker.close().await.unwrap();

    let ids: Vec<Vec<i64>> = batches.lock().unwrap().iter().map(|(_, ids)| ids.clone()).collect();
    assert_eq!(ids, vec![vec![1]]);
    assert_eq!(harness.broker.message_count("orders"), 0);

    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_batch_retries_each_delivery_on_its_own_count() {
    let queue = QueueDefinition::classic("orders").retry(RetryPolicy::ttl_backoff(TtlBackoffPolicy {
        max_retries: 3,
        initial_delay_ms: 60_000,
        max_delay_ms: 600_000,
        backoff_multiplier: 2.0,
        jitter: false,
    }));
    let harness = Harness::new(orders_topology(queue, MessageDefinition::new(AnyObject)));
    let client = harness.client().await;

    // one fresh delivery, one already retried twice
    for (n, retries) in [(1, 0i64), (2, 2)] {
        let headers = BTreeMap::from([(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(retries),
        )]);
        harness
            .broker
            .publish(
                "orders",
                "order.created",
                json!({ "n": n }).to_string().as_bytes(),
                BasicProperties::default().with_headers(FieldTable::from(headers)),
            )
            .unwrap();
    }

    let batches = Batches::default();
    let seen = batches.clone();
    let handler = ConsumerRegistration::new(batch_handler_fn(move |msgs: Vec<ConsumerMessage>| {
        let ids = msgs.iter().filter_map(|m| m.payload["n"].as_i64()).collect();
        seen.lock().unwrap().push((Instant::now(), ids));
        async { Err::<(), _>(HandlerError::retryable("warehouse offline")) }
    }))
    .options(ConsumerOptions::new().batch_size(2));

    let worker = harness.worker("orders", handler).await;

    assert!(eventually(|| harness.broker.message_count("orders-wait") == 2).await);

    let ids: Vec<Vec<i64>> = batches.lock().unwrap().iter().map(|(_, ids)| ids.clone()).collect();
    assert_eq!(ids, vec![vec![1, 2]]);
    assert_eq!(harness.broker.message_count("orders"), 0);
    assert_eq!(harness.broker.unacked_count("orders"), 0);

    let mut parked: Vec<(i64, Value, Option<String>)> = harness
        .broker
        .messages("orders-wait")
        .iter()
        .map(|m| {
            let body: Value = serde_json::from_slice(&m.data).unwrap();
            let table = headers::table_to_json(&m.properties.headers().clone().unwrap_or_default());
            assert_eq!(table[AMQP_HEADERS_LAST_ERROR], json!("warehouse offline"));
            (
                body["n"].as_i64().unwrap(),
                table[AMQP_HEADERS_RETRY_COUNT].clone(),
                m.properties.expiration().as_ref().map(|e| e.as_str().to_owned()),
            )
        })
        .collect();
    parked.sort_by_key(|(n, _, _)| *n);

    assert_eq!(
        parked,
        vec![
            (1, json!(1), Some("60000".to_owned())),
            (2, json!(3), Some("240000".to_owned())),
        ]
    );

    worker.close().await.unwrap();
    client.close().await.unwrap();
}
