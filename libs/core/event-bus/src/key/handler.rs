use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::{AddOutcome, LocalListenerRegistry, RemoveOutcome};
use crate::broker::{ChannelPool, Consumer, Delivery, QueueOptions};
use crate::error::EventBusError;
use crate::event::Event;
use crate::listener::{self, EventListener, ExecutionMode};
use crate::metrics::EventBusMetrics;
use crate::naming::NamingStrategy;
use crate::registration_key::{RegistrationKey, RoutingKey, RoutingKeyConverter};
use crate::serializer::EventSerializer;

const KEY_QUEUE_PREFETCH: usize = 64;

/// Ephemeral pub/sub delivery for keys registered on this instance.
///
/// One exclusive queue per instance is bound once for every key that has at
/// least one local listener. Deliveries are best effort: failures are logged
/// and never retried.
pub struct KeyRegistrationHandler<E: Event> {
    inner: Arc<KeyHandlerInner<E>>,
}

struct KeyHandlerInner<E: Event> {
    pool: ChannelPool,
    exchange: String,
    queue: String,
    serializer: Arc<dyn EventSerializer<E>>,
    converter: Arc<RoutingKeyConverter>,
    metrics: EventBusMetrics,
    // held across bind/unbind so the binding always mirrors the registry
    registry: Mutex<Registry<E>>,
    running: Mutex<Option<RunningConsumer>>,
}

struct Registry<E: Event> {
    listeners: LocalListenerRegistry<E>,
    started: bool,
}

struct RunningConsumer {
    consumer_tag: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Handle returned by a key registration.
pub struct Registration<E: Event> {
    inner: Arc<KeyHandlerInner<E>>,
    routing_key: RoutingKey,
    listener: Arc<dyn EventListener<E>>,
}

impl<E: Event> KeyRegistrationHandler<E> {
    pub(crate) fn new(
        pool: ChannelPool,
        naming: &NamingStrategy,
        queue: String,
        serializer: Arc<dyn EventSerializer<E>>,
        converter: Arc<RoutingKeyConverter>,
    ) -> Self {
        let inner = KeyHandlerInner {
            pool,
            exchange: naming.exchange(),
            queue,
            serializer,
            converter,
            metrics: EventBusMetrics::new(naming.event_bus_name().as_str(), "keys"),
            registry: Mutex::new(Registry {
                listeners: LocalListenerRegistry::new(),
                started: false,
            }),
            running: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue
    }

    /// Declare the instance queue, bind every registered key, start consuming.
    pub async fn start(&self) -> Result<(), EventBusError> {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let queue = inner.queue.clone();
        inner
            .pool
            .execute("declare_queue", |broker| async move {
                broker.declare_queue(&queue, QueueOptions::ephemeral()).await
            })
            .await?;

        let mut registry = inner.registry.lock().await;
        for routing_key in registry.listeners.routing_keys() {
            inner.bind(&routing_key).await?;
        }

        let queue = inner.queue.clone();
        let consumer = inner
            .pool
            .execute("consume", |broker| async move {
                broker.consume(&queue, KEY_QUEUE_PREFETCH).await
            })
            .await?;
        registry.started = true;
        drop(registry);

        let consumer_tag = consumer.tag.clone();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consume_loop(inner.clone(), consumer, shutdown_rx));
        info!(queue = %inner.queue, consumer_tag = %consumer_tag, "Key registration handler started");

        *running = Some(RunningConsumer {
            consumer_tag,
            shutdown,
            task,
        });
        Ok(())
    }

    /// Cancel consumption and delete the instance queue.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let Some(running) = inner.running.lock().await.take() else {
            return;
        };
        inner.registry.lock().await.started = false;

        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            error!(error = %e, "Key consume loop panicked");
        }

        let tag = running.consumer_tag;
        if let Err(e) = inner
            .pool
            .execute("cancel", |broker| async move { broker.cancel(&tag).await })
            .await
        {
            warn!(queue = %inner.queue, error = %e, "Failed to cancel key consumer");
        }

        let queue = inner.queue.clone();
        if let Err(e) = inner
            .pool
            .execute("delete_queue", |broker| async move {
                broker.delete_queue(&queue).await
            })
            .await
        {
            warn!(queue = %inner.queue, error = %e, "Failed to delete key queue");
        }
        info!(queue = %inner.queue, "Key registration handler stopped");
    }

    /// Register `listener` for `key`. The same listener twice is kept once.
    pub async fn register(
        &self,
        listener: Arc<dyn EventListener<E>>,
        key: &dyn RegistrationKey,
    ) -> Result<Registration<E>, EventBusError> {
        let inner = &self.inner;
        let routing_key = inner.converter.to_routing_key(key);

        let mut registry = inner.registry.lock().await;
        let outcome = registry
            .listeners
            .add(routing_key.clone(), listener.clone());
        if outcome == AddOutcome::FirstListener
            && registry.started
            && let Err(e) = inner.bind(&routing_key).await
        {
            registry.listeners.remove(&routing_key, &listener);
            return Err(e);
        }
        debug!(routing_key = %routing_key, ?outcome, "Registered key listener");

        Ok(Registration {
            inner: inner.clone(),
            routing_key,
            listener,
        })
    }
}

impl<E: Event> Registration<E> {
    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    /// Remove the listener, unbinding the key when it was the last one.
    ///
    /// Calling this more than once is harmless.
    pub async fn unregister(&self) -> Result<(), EventBusError> {
        let inner = &self.inner;
        let mut registry = inner.registry.lock().await;
        let outcome = registry.listeners.remove(&self.routing_key, &self.listener);
        if outcome == RemoveOutcome::LastListener && registry.started {
            inner.unbind(&self.routing_key).await?;
        }
        debug!(routing_key = %self.routing_key, ?outcome, "Unregistered key listener");
        Ok(())
    }
}

impl<E: Event> KeyHandlerInner<E> {
    async fn bind(&self, routing_key: &RoutingKey) -> Result<(), EventBusError> {
        let (queue, exchange, key) = (
            self.queue.clone(),
            self.exchange.clone(),
            routing_key.as_str().to_string(),
        );
        self.pool
            .execute("bind", |broker| async move {
                broker.bind(&queue, &exchange, &key).await
            })
            .await
    }

    async fn unbind(&self, routing_key: &RoutingKey) -> Result<(), EventBusError> {
        let (queue, exchange, key) = (
            self.queue.clone(),
            self.exchange.clone(),
            routing_key.as_str().to_string(),
        );
        self.pool
            .execute("unbind", |broker| async move {
                broker.unbind(&queue, &exchange, &key).await
            })
            .await
    }

    async fn handle(&self, delivery: &Delivery) {
        let key = match self.converter.to_registration_key(&delivery.routing_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(routing_key = %delivery.routing_key, error = %e, "Dropping message with unknown routing key");
                self.metrics.malformed_dropped();
                return;
            }
        };
        let event = match self.serializer.from_bytes(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(routing_key = %delivery.routing_key, error = %e, "Dropping malformed message");
                self.metrics.malformed_dropped();
                return;
            }
        };
        if event.is_noop() {
            return;
        }

        let routing_key = RoutingKey::of(&*key);
        let listeners: Vec<_> = self
            .registry
            .lock()
            .await
            .listeners
            .listeners(&routing_key)
            .into_iter()
            .filter(|subscriber| subscriber.is_handling(&event))
            .collect();
        self.metrics.key_delivered(listeners.len());

        let (asynchronous, synchronous): (Vec<_>, Vec<_>) = listeners
            .into_iter()
            .partition(|subscriber| subscriber.execution_mode() == ExecutionMode::Asynchronous);

        for subscriber in asynchronous {
            let event = event.clone();
            let metrics = self.metrics.clone();
            let routing_key = routing_key.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                match listener::invoke(&subscriber, &event).await {
                    Ok(()) => metrics.listener_succeeded(started.elapsed()),
                    Err(e) => {
                        metrics.listener_failed();
                        error!(routing_key = %routing_key, listener = subscriber.name(), error = %e, "Key listener failed");
                    }
                }
            });
        }

        let started = Instant::now();
        let outcomes = join_all(
            synchronous
                .iter()
                .map(|subscriber| listener::invoke(subscriber, &event)),
        )
        .await;
        for (subscriber, outcome) in synchronous.iter().zip(outcomes) {
            match outcome {
                Ok(()) => self.metrics.listener_succeeded(started.elapsed()),
                Err(e) => {
                    self.metrics.listener_failed();
                    error!(
                        routing_key = %routing_key,
                        listener = subscriber.name(),
                        event_id = %event.event_id(),
                        error = %e,
                        "Key listener failed"
                    );
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self
            .pool
            .execute("ack", |broker| async move { broker.ack(delivery).await })
            .await
        {
            warn!(delivery_tag = %delivery.delivery_tag, error = %e, "Failed to acknowledge key delivery");
        }
    }
}

async fn consume_loop<E: Event>(
    inner: Arc<KeyHandlerInner<E>>,
    mut consumer: Consumer,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            delivery = consumer.deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            inner.handle(&delivery).await;
            inner.ack(&delivery).await;
        });
    }
    debug!(queue = %inner.queue, "Key consume loop exited");
}
