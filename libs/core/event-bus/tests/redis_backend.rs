//! Redis-backed broker and dead letters
//!
//! Requires Docker: `cargo test -p event-bus --features integration`

#![cfg(feature = "integration")]

mod common;

use common::contract::{self, DeadLetters};
use common::*;
use event_bus::{
    Broker, EventBus, EventBusName, EventDeadLetters, Group, JsonEventSerializer, RedisBroker,
    RedisEventDeadLetters,
};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Redis container, stopped and removed on drop.
struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection_string: String,
}

impl TestRedis {
    async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");
        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        Self {
            container,
            connection_string: format!("redis://127.0.0.1:{host_port}"),
        }
    }

    async fn connection_manager(&self) -> ConnectionManager {
        let client =
            redis::Client::open(self.connection_string.as_str()).expect("Invalid Redis URL");
        ConnectionManager::new(client)
            .await
            .expect("Failed to connect to Redis")
    }
}

struct RedisBus {
    broker: RedisBroker,
    dead_letters: Arc<RedisEventDeadLetters<TestEvent>>,
    bus: EventBus<TestEvent>,
}

async fn redis_bus(redis: &TestRedis) -> RedisBus {
    let broker = RedisBroker::connect(&redis.connection_string)
        .await
        .expect("Failed to connect broker");
    let serializer = Arc::new(JsonEventSerializer::new());
    let dead_letters = Arc::new(RedisEventDeadLetters::new(
        redis.connection_manager().await,
        &EventBusName::new("events").unwrap(),
        serializer.clone(),
    ));
    let bus = EventBus::new(
        config("events", fast_retry(2)),
        Arc::new(broker.clone()),
        serializer,
        converter(),
        dead_letters.clone(),
    );
    RedisBus {
        broker,
        dead_letters,
        bus,
    }
}

async fn dead_letters(redis: &TestRedis) -> DeadLetters {
    Arc::new(RedisEventDeadLetters::new(
        redis.connection_manager().await,
        &EventBusName::new("events").unwrap(),
        Arc::new(JsonEventSerializer::new()),
    ))
}

mod dead_letters_contract {
    use super::*;

    #[tokio::test]
    async fn test_store_then_load() {
        let redis = TestRedis::new().await;
        contract::store_then_load(dead_letters(&redis).await).await;
    }

    #[tokio::test]
    async fn test_ids_are_listed_oldest_first() {
        let redis = TestRedis::new().await;
        contract::ids_are_listed_oldest_first(dead_letters(&redis).await).await;
    }

    #[tokio::test]
    async fn test_same_event_stored_twice_gets_two_ids() {
        let redis = TestRedis::new().await;
        contract::same_event_stored_twice_gets_two_ids(dead_letters(&redis).await).await;
    }

    #[tokio::test]
    async fn test_remove_is_scoped_and_idempotent() {
        let redis = TestRedis::new().await;
        contract::remove_is_scoped_and_idempotent(dead_letters(&redis).await).await;
    }

    #[tokio::test]
    async fn test_groups_with_failed_events_tracks_content() {
        let redis = TestRedis::new().await;
        contract::groups_with_failed_events_tracks_content(dead_letters(&redis).await).await;
    }

    #[tokio::test]
    async fn test_unknown_entries_are_absent() {
        let redis = TestRedis::new().await;
        contract::unknown_entries_are_absent(dead_letters(&redis).await).await;
    }
}

mod bus_tests {
    use super::*;

    #[tokio::test]
    async fn test_group_delivery_over_redis() {
        let redis = TestRedis::new().await;
        let node = redis_bus(&redis).await;
        let collector = EventCollector::new();
        node.bus
            .register_group(collector.clone(), Group::new("audit"))
            .await
            .unwrap();
        node.bus.start().await.unwrap();

        let first = TestEvent::new("first");
        let second = TestEvent::new("second");
        node.bus.dispatch(&first, &[]).await.unwrap();
        node.bus.dispatch(&second, &[]).await.unwrap();

        assert!(eventually(|| collector.count() == 2).await);
        assert_eq!(collector.events(), vec![first, second]);
        node.bus.stop().await;
    }

    #[tokio::test]
    async fn test_retries_then_dead_letters_over_redis() {
        let redis = TestRedis::new().await;
        let node = redis_bus(&redis).await;
        let recovering = FailingListener::failing_times(2);
        let hopeless = FailingListener::always();
        node.bus
            .register_group(recovering.clone(), Group::new("recovering"))
            .await
            .unwrap();
        node.bus
            .register_group(hopeless.clone(), Group::new("hopeless"))
            .await
            .unwrap();
        node.bus.start().await.unwrap();

        let event = TestEvent::new("retry me");
        node.bus.dispatch(&event, &[]).await.unwrap();

        let dead_letters = node.dead_letters.clone();
        assert!(
            eventually_async(|| {
                let dead_letters = dead_letters.clone();
                async move {
                    !dead_letters
                        .failed_ids(&Group::new("hopeless"))
                        .await
                        .unwrap()
                        .is_empty()
                }
            })
            .await
        );
        assert!(eventually(|| recovering.calls() == 3).await);
        assert_eq!(hopeless.calls(), 3);
        assert_eq!(
            node.dead_letters.groups_with_failed_events().await.unwrap(),
            vec![Group::new("hopeless")]
        );
        let ids = node
            .dead_letters
            .failed_ids(&Group::new("hopeless"))
            .await
            .unwrap();
        assert_eq!(
            node.dead_letters
                .failed_event(&Group::new("hopeless"), ids[0])
                .await
                .unwrap(),
            Some(event)
        );
        node.bus.stop().await;
    }

    #[tokio::test]
    async fn test_key_delivery_over_redis() {
        let redis = TestRedis::new().await;
        let node = redis_bus(&redis).await;
        node.bus.start().await.unwrap();
        let collector = EventCollector::new();
        node.bus
            .register_key(collector.clone(), &UserKey::new("alice"))
            .await
            .unwrap();

        let event = TestEvent::new("for alice");
        node.bus
            .dispatch(&event, &[&UserKey::new("alice")])
            .await
            .unwrap();
        node.bus
            .dispatch(&TestEvent::new("for bob"), &[&UserKey::new("bob")])
            .await
            .unwrap();

        assert!(eventually(|| collector.count() == 1).await);
        settle().await;
        assert_eq!(collector.events(), vec![event]);

        let key_queue = node.bus.naming().key_queue(&node.bus.event_bus_id());
        node.bus.stop().await;
        assert!(node.broker.queue_depth(&key_queue).await.is_err());
    }

    #[tokio::test]
    async fn test_group_queue_survives_stop_over_redis() {
        let redis = TestRedis::new().await;
        let first = redis_bus(&redis).await;
        first
            .bus
            .register_group(EventCollector::new(), Group::new("audit"))
            .await
            .unwrap();
        first.bus.start().await.unwrap();
        first.bus.stop().await;

        first.bus.dispatch(&TestEvent::new("kept"), &[]).await.unwrap();
        assert_eq!(
            first
                .broker
                .queue_depth("events-workQueue-audit")
                .await
                .unwrap(),
            1
        );

        let second = redis_bus(&redis).await;
        let collector = EventCollector::new();
        second
            .bus
            .register_group(collector.clone(), Group::new("audit"))
            .await
            .unwrap();
        second.bus.start().await.unwrap();

        assert!(eventually(|| collector.count() == 1).await);
        second.bus.stop().await;
    }
}
