//! The event bus orchestrator.

use futures::future::try_join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backoff::WaitDelayGenerator;
use crate::broker::{Broker, ChannelPool, OutboundMessage, QueueOptions};
use crate::config::EventBusConfig;
use crate::dead_letters::EventDeadLetters;
use crate::error::EventBusError;
use crate::event::Event;
use crate::group::{Group, GroupContext, GroupRegistrationHandler};
use crate::key::{KeyRegistrationHandler, Registration};
use crate::listener::EventListener;
use crate::metrics::EventBusMetrics;
use crate::naming::{EventBusId, NamingStrategy};
use crate::registration_key::{RegistrationKey, RoutingKey, RoutingKeyConverter};
use crate::serializer::EventSerializer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Started { with_keys: bool },
}

/// Outcome of [`EventBus::redeliver_failed_events`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RedeliveryReport {
    pub redelivered: usize,
    pub failed: usize,
}

/// A distributed event bus over one namespace.
///
/// Group listeners share a durable queue per group across instances and get
/// retries and dead letters. Key listeners receive events dispatched with a
/// matching key, on this instance only, best effort.
pub struct EventBus<E: Event> {
    config: EventBusConfig,
    naming: NamingStrategy,
    pool: ChannelPool,
    serializer: Arc<dyn EventSerializer<E>>,
    converter: Arc<RoutingKeyConverter>,
    dead_letters: Arc<dyn EventDeadLetters<E>>,
    groups: GroupRegistrationHandler<E>,
    keys: KeyRegistrationHandler<E>,
    lifecycle: Mutex<Lifecycle>,
    metrics: EventBusMetrics,
}

impl<E: Event> EventBus<E> {
    pub fn new(
        config: EventBusConfig,
        broker: Arc<dyn Broker>,
        serializer: Arc<dyn EventSerializer<E>>,
        converter: RoutingKeyConverter,
        dead_letters: Arc<dyn EventDeadLetters<E>>,
    ) -> Self {
        let naming = NamingStrategy::new(config.name.clone());
        let pool = ChannelPool::new(broker, config.pool);
        let converter = Arc::new(converter);

        let groups = GroupRegistrationHandler::new(Arc::new(GroupContext {
            pool: pool.clone(),
            naming: naming.clone(),
            serializer: serializer.clone(),
            dead_letters: dead_letters.clone(),
            delays: WaitDelayGenerator::new(config.retry),
            max_concurrent_deliveries: config.max_concurrent_deliveries,
        }));
        let keys = KeyRegistrationHandler::new(
            pool.clone(),
            &naming,
            naming.key_queue(&config.event_bus_id),
            serializer.clone(),
            converter.clone(),
        );
        let metrics = EventBusMetrics::new(config.name.as_str(), "dispatch");

        Self {
            config,
            naming,
            pool,
            serializer,
            converter,
            dead_letters,
            groups,
            keys,
            lifecycle: Mutex::new(Lifecycle::Stopped),
            metrics,
        }
    }

    pub fn naming(&self) -> &NamingStrategy {
        &self.naming
    }

    pub fn event_bus_id(&self) -> EventBusId {
        self.config.event_bus_id
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> &Arc<dyn EventDeadLetters<E>> {
        &self.dead_letters
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        self.pool.broker()
    }

    pub async fn is_started(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Started { .. })
    }

    /// Declare the namespace topology, start group registrations then the key
    /// handler. Idempotent.
    pub async fn start(&self) -> Result<(), EventBusError> {
        self.start_with(true).await
    }

    /// Like [`Self::start`], deferring key queue creation.
    pub async fn start_without_key_handler(&self) -> Result<(), EventBusError> {
        self.start_with(false).await
    }

    async fn start_with(&self, with_keys: bool) -> Result<(), EventBusError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Lifecycle::Started { with_keys: running } = *lifecycle {
            if with_keys && !running {
                self.keys.start().await?;
                *lifecycle = Lifecycle::Started { with_keys: true };
            }
            return Ok(());
        }

        info!(
            namespace = %self.config.name,
            event_bus_id = %self.config.event_bus_id,
            with_keys,
            "Starting event bus"
        );
        self.declare_topology().await?;
        self.groups.start().await?;
        if with_keys {
            self.keys.start().await?;
        }
        *lifecycle = Lifecycle::Started { with_keys };
        Ok(())
    }

    async fn declare_topology(&self) -> Result<(), EventBusError> {
        let exchange = self.naming.exchange();
        let dead_letter_exchange = self.naming.dead_letter_exchange();
        let dead_letter_queue = self.naming.dead_letter_queue();

        self.pool
            .execute("declare_topology", |broker| async move {
                broker.declare_exchange(&exchange).await?;
                broker.declare_exchange(&dead_letter_exchange).await?;
                match broker
                    .declare_queue(&dead_letter_queue, QueueOptions::durable())
                    .await
                {
                    Err(e) if e.is_precondition_failed() => {
                        warn!(queue = %dead_letter_queue, error = %e, "Dead-letter queue exists with different arguments, keeping it");
                    }
                    other => other?,
                }
                broker
                    .bind(
                        &dead_letter_queue,
                        &dead_letter_exchange,
                        RoutingKey::unconditional().as_str(),
                    )
                    .await
            })
            .await
    }

    /// Stop consuming. Exchanges, group queues and dead letters stay. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            return;
        }
        self.groups.stop().await;
        self.keys.stop().await;
        *lifecycle = Lifecycle::Stopped;
        info!(namespace = %self.config.name, "Event bus stopped");
    }

    pub async fn register_group(
        &self,
        listener: Arc<dyn EventListener<E>>,
        group: Group,
    ) -> Result<(), EventBusError> {
        self.groups.register(listener, group).await
    }

    pub async fn unregister_group(&self, group: &Group) {
        self.groups.unregister(group).await
    }

    pub async fn registered_groups(&self) -> Vec<Group> {
        self.groups.registered_groups().await
    }

    pub async fn register_key(
        &self,
        listener: Arc<dyn EventListener<E>>,
        key: &dyn RegistrationKey,
    ) -> Result<Registration<E>, EventBusError> {
        self.keys.register(listener, key).await
    }

    /// Publish `event` to every group and to listeners of any of `keys`.
    ///
    /// Noop events are skipped. When publishing fails the event is stored
    /// under [`Group::dispatching_failure`] and the error returned.
    pub async fn dispatch(
        &self,
        event: &E,
        keys: &[&dyn RegistrationKey],
    ) -> Result<(), EventBusError> {
        if event.is_noop() {
            debug!(event_id = %event.event_id(), "Skipping noop event");
            return Ok(());
        }

        let payload = self.serializer.to_bytes(event)?;
        let mut routing_keys: BTreeSet<RoutingKey> = keys
            .iter()
            .map(|key| self.converter.to_routing_key(*key))
            .collect();
        routing_keys.insert(RoutingKey::unconditional());

        let published = routing_keys.len();
        let exchange = self.naming.exchange();
        let result = try_join_all(routing_keys.into_iter().map(|routing_key| {
            let message = OutboundMessage::new(routing_key.as_str(), payload.clone());
            let exchange = exchange.clone();
            self.pool.execute("publish", |broker| async move {
                broker.publish(&exchange, message).await
            })
        }))
        .await;

        match result {
            Ok(_) => {
                self.metrics.event_dispatched(published);
                debug!(event_id = %event.event_id(), routing_keys = published, "Dispatched event");
                Ok(())
            }
            Err(e) => {
                self.metrics.dispatch_failed();
                self.store_dispatch_failure(event, &e).await;
                Err(e)
            }
        }
    }

    /// Dispatch several events with the same keys, stopping at the first failure.
    pub async fn dispatch_all(
        &self,
        events: &[E],
        keys: &[&dyn RegistrationKey],
    ) -> Result<(), EventBusError> {
        for event in events {
            self.dispatch(event, keys).await?;
        }
        Ok(())
    }

    /// Redeliver an event to one group.
    ///
    /// For [`Group::dispatching_failure`] the event is dispatched again to every
    /// group. A failure stores the event back in the dead letters.
    pub async fn re_deliver(&self, group: &Group, event: &E) -> Result<(), EventBusError> {
        if group.is_dispatching_failure() {
            let result = self.publish_unconditionally(event).await;
            if let Err(e) = &result {
                self.store_dispatch_failure(event, e).await;
            }
            return result;
        }
        self.groups.re_deliver(group, event).await
    }

    /// Redeliver stored dead letters of one group, or of every group.
    ///
    /// Redelivered entries are removed; failed ones are kept as they are.
    pub async fn redeliver_failed_events(
        &self,
        group: Option<&Group>,
    ) -> Result<RedeliveryReport, EventBusError> {
        let groups = match group {
            Some(group) => vec![group.clone()],
            None => self.dead_letters.groups_with_failed_events().await?,
        };

        let mut report = RedeliveryReport::default();
        for group in groups {
            for insertion_id in self.dead_letters.failed_ids(&group).await? {
                let Some(event) = self.dead_letters.failed_event(&group, insertion_id).await?
                else {
                    continue;
                };

                let result = if group.is_dispatching_failure() {
                    self.publish_unconditionally(&event).await
                } else {
                    self.groups.try_re_deliver(&group, &event).await
                };
                match result {
                    Ok(()) => {
                        self.dead_letters.remove(&group, insertion_id).await?;
                        report.redelivered += 1;
                    }
                    Err(e) => {
                        warn!(group = %group, insertion_id = %insertion_id, error = %e, "Failed to redeliver dead letter");
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            redelivered = report.redelivered,
            failed = report.failed,
            "Dead letter redelivery finished"
        );
        Ok(report)
    }

    async fn publish_unconditionally(&self, event: &E) -> Result<(), EventBusError> {
        let payload = self.serializer.to_bytes(event)?;
        let message = OutboundMessage::new(RoutingKey::unconditional().as_str(), payload);
        let exchange = self.naming.exchange();
        self.pool
            .execute("publish", |broker| async move {
                broker.publish(&exchange, message).await
            })
            .await
    }

    async fn store_dispatch_failure(&self, event: &E, cause: &EventBusError) {
        let group = Group::dispatching_failure();
        match self.dead_letters.store(&group, event).await {
            Ok(insertion_id) => error!(
                event_id = %event.event_id(),
                insertion_id = %insertion_id,
                error = %cause,
                "Dispatch failed, event stored in dead letters"
            ),
            Err(store_error) => error!(
                event_id = %event.event_id(),
                error = %cause,
                store_error = %store_error,
                "Dispatch failed and the event could not be stored"
            ),
        }
    }
}
