//! Shared fixtures for the event bus integration tests

#![allow(dead_code)]

pub mod contract;

use async_trait::async_trait;
use event_bus::{
    Event, EventBus, EventBusConfig, EventBusName, EventId, EventListener, ExecutionMode,
    FnKeyFactory, InMemoryBroker, ListenerError, MemoryEventDeadLetters, RegistrationKey,
    RetryBackoffConfiguration, RoutingKeyConverter, JsonEventSerializer,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEvent {
    pub event_id: EventId,
    pub payload: String,
    #[serde(default)]
    pub noop: bool,
}

impl TestEvent {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            event_id: EventId::random(),
            payload: payload.into(),
            noop: false,
        }
    }

    pub fn noop() -> Self {
        Self {
            noop: true,
            ..Self::new("noop")
        }
    }
}

impl Event for TestEvent {
    fn event_id(&self) -> EventId {
        self.event_id
    }

    fn is_noop(&self) -> bool {
        self.noop
    }
}

/// Key of a user mailbox, wire form `user:{name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserKey(pub String);

impl UserKey {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl RegistrationKey for UserKey {
    fn key_type(&self) -> &str {
        "user"
    }

    fn as_string(&self) -> String {
        self.0.clone()
    }
}

pub fn converter() -> RoutingKeyConverter {
    RoutingKeyConverter::new()
        .with_factory(FnKeyFactory::new("user", |value: &str| {
            Ok(Box::new(UserKey(value.to_string())) as Box<dyn RegistrationKey>)
        }))
        .unwrap()
}

/// Records every event it receives.
#[derive(Default)]
pub struct EventCollector {
    events: Mutex<Vec<TestEvent>>,
    mode: ExecutionMode,
}

impl EventCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn asynchronous() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            mode: ExecutionMode::Asynchronous,
        })
    }

    pub fn events(&self) -> Vec<TestEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

#[async_trait]
impl EventListener<TestEvent> for EventCollector {
    async fn event(&self, event: &TestEvent) -> Result<(), ListenerError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }
}

/// Fails a fixed number of times, then succeeds.
pub struct FailingListener {
    failures: u32,
    calls: AtomicU32,
}

impl FailingListener {
    pub fn failing_times(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    pub fn always() -> Arc<Self> {
        Self::failing_times(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventListener<TestEvent> for FailingListener {
    async fn event(&self, _event: &TestEvent) -> Result<(), ListenerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ListenerError::new(format!("failure #{}", call + 1)));
        }
        Ok(())
    }
}

pub fn fast_retry(max_retries: u32) -> RetryBackoffConfiguration {
    RetryBackoffConfiguration::new(max_retries, Duration::from_millis(5), 0.0).unwrap()
}

pub struct TestBus {
    pub broker: Arc<InMemoryBroker>,
    pub dead_letters: Arc<MemoryEventDeadLetters<TestEvent>>,
    pub bus: EventBus<TestEvent>,
}

impl std::ops::Deref for TestBus {
    type Target = EventBus<TestEvent>;

    fn deref(&self) -> &Self::Target {
        &self.bus
    }
}

pub fn config(namespace: &str, retry: RetryBackoffConfiguration) -> EventBusConfig {
    EventBusConfig::new(EventBusName::new(namespace).unwrap())
        .with_retry(retry)
        .with_pool_timeout(Duration::from_secs(5))
}

/// A bus on `broker`, with its own dead letters.
pub fn bus_on(broker: &Arc<InMemoryBroker>, config: EventBusConfig) -> TestBus {
    let dead_letters = Arc::new(MemoryEventDeadLetters::new());
    let bus = EventBus::new(
        config,
        broker.clone(),
        Arc::new(JsonEventSerializer::new()),
        converter(),
        dead_letters.clone(),
    );
    TestBus {
        broker: broker.clone(),
        dead_letters,
        bus,
    }
}

pub fn new_bus(retry: RetryBackoffConfiguration) -> TestBus {
    bus_on(&Arc::new(InMemoryBroker::new()), config("events", retry))
}

/// Poll `condition` every 10ms for up to 5s.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Async flavour of [`eventually`].
pub async fn eventually_async<F, Fut>(condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}

/// Give in-flight deliveries time to land before asserting nothing happened.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
