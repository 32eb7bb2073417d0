use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::retry::DeliveryState;
use super::{Group, GroupContext};
use crate::broker::{Consumer, DEFAULT_EXCHANGE, Delivery, OutboundMessage, QueueOptions};
use crate::error::EventBusError;
use crate::event::Event;
use crate::listener::{self, EventListener};
use crate::metrics::EventBusMetrics;
use crate::registration_key::RoutingKey;

/// One group listener bound to its work queue on this instance.
pub(crate) struct GroupRegistration<E: Event> {
    worker: Arc<GroupWorker<E>>,
    running: Mutex<Option<RunningConsumer>>,
}

struct RunningConsumer {
    consumer_tag: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Message handling shared with the consume loop.
struct GroupWorker<E: Event> {
    group: Group,
    listener: Arc<dyn EventListener<E>>,
    context: Arc<GroupContext<E>>,
    work_queue: String,
    retry_exchange: String,
    metrics: EventBusMetrics,
}

impl<E: Event> GroupRegistration<E> {
    pub fn new(
        group: Group,
        listener: Arc<dyn EventListener<E>>,
        context: Arc<GroupContext<E>>,
    ) -> Self {
        let naming = &context.naming;
        let worker = GroupWorker {
            work_queue: naming.work_queue(&group),
            retry_exchange: naming.retry_exchange(&group),
            metrics: EventBusMetrics::new(naming.event_bus_name().as_str(), group.as_str()),
            group,
            listener,
            context: context.clone(),
        };
        Self {
            worker: Arc::new(worker),
            running: Mutex::new(None),
        }
    }

    pub fn listener(&self) -> &Arc<dyn EventListener<E>> {
        &self.worker.listener
    }

    /// Declare the group topology and start consuming. Idempotent.
    pub async fn start(&self) -> Result<(), EventBusError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        self.declare_topology().await?;

        let worker = &self.worker;
        let prefetch = worker.context.max_concurrent_deliveries.max(1);
        let queue = worker.work_queue.clone();
        let consumer = worker
            .context
            .pool
            .execute("consume", |broker| async move {
                broker.consume(&queue, prefetch).await
            })
            .await?;

        let consumer_tag = consumer.tag.clone();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consume_loop(worker.clone(), consumer, shutdown_rx, prefetch));

        info!(
            group = %worker.group,
            queue = %worker.work_queue,
            consumer_tag = %consumer_tag,
            "Group registration started"
        );
        *running = Some(RunningConsumer {
            consumer_tag,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn declare_topology(&self) -> Result<(), EventBusError> {
        let worker = &self.worker;
        let naming = &worker.context.naming;
        let exchange = naming.exchange();
        let work_queue = worker.work_queue.clone();
        let retry_exchange = worker.retry_exchange.clone();
        let retry_queue = naming.retry_queue(&worker.group);

        let work_options = QueueOptions::durable()
            .with_dead_letter(naming.dead_letter_exchange(), Some(String::new()));
        let retry_options = QueueOptions::durable()
            .with_dead_letter(DEFAULT_EXCHANGE, Some(work_queue.clone()));

        tolerate_changed_arguments(
            &worker.group,
            &work_queue,
            worker
                .context
                .pool
                .execute("declare_queue", |broker| {
                    let queue = work_queue.clone();
                    async move { broker.declare_queue(&queue, work_options).await }
                })
                .await,
        )?;
        tolerate_changed_arguments(
            &worker.group,
            &retry_queue,
            worker
                .context
                .pool
                .execute("declare_queue", |broker| {
                    let queue = retry_queue.clone();
                    async move { broker.declare_queue(&queue, retry_options).await }
                })
                .await,
        )?;

        worker
            .context
            .pool
            .execute("declare_topology", |broker| async move {
                broker
                    .bind(&work_queue, &exchange, RoutingKey::unconditional().as_str())
                    .await?;
                broker.declare_exchange(&retry_exchange).await?;
                broker
                    .bind(&retry_queue, &retry_exchange, RoutingKey::unconditional().as_str())
                    .await
            })
            .await
    }

    /// Cancel the local consumer; the queue and its messages stay.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let worker = &self.worker;

        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            error!(group = %worker.group, error = %e, "Group consume loop panicked");
        }

        let tag = running.consumer_tag;
        if let Err(e) = worker
            .context
            .pool
            .execute("cancel", |broker| async move { broker.cancel(&tag).await })
            .await
        {
            warn!(group = %worker.group, error = %e, "Failed to cancel group consumer");
        }
        info!(group = %worker.group, "Group registration stopped");
    }

    /// Publish an event straight into this group's work queue.
    ///
    /// Fails with `GroupRegistrationNotFound` while the registration is not
    /// consuming. A failed publish stores the event in the dead letters of the group.
    pub async fn re_deliver(&self, event: &E) -> Result<(), EventBusError> {
        self.ensure_active().await?;
        let worker = &self.worker;
        let result = worker.publish_to_work_queue(event).await;
        if let Err(e) = &result {
            error!(
                group = %worker.group,
                event_id = %event.event_id(),
                error = %e,
                "Redelivery failed, storing event in dead letters"
            );
            if let Err(store_error) = worker.context.dead_letters.store(&worker.group, event).await
            {
                error!(group = %worker.group, error = %store_error, "Failed to store event in dead letters");
            }
        }
        result
    }

    /// Publish without the dead-letter fallback.
    pub async fn try_re_deliver(&self, event: &E) -> Result<(), EventBusError> {
        self.ensure_active().await?;
        self.worker.publish_to_work_queue(event).await
    }

    /// The work queue is only known to exist once the registration started.
    async fn ensure_active(&self) -> Result<(), EventBusError> {
        if self.running.lock().await.is_none() {
            return Err(EventBusError::GroupRegistrationNotFound(
                self.worker.group.clone(),
            ));
        }
        Ok(())
    }
}

fn tolerate_changed_arguments(
    group: &Group,
    queue: &str,
    result: Result<(), EventBusError>,
) -> Result<(), EventBusError> {
    match result {
        Err(e) if e.is_precondition_failed() => {
            warn!(group = %group, queue, error = %e, "Queue exists with different arguments, keeping it");
            Ok(())
        }
        other => other,
    }
}

async fn consume_loop<E: Event>(
    worker: Arc<GroupWorker<E>>,
    mut consumer: Consumer,
    mut shutdown: watch::Receiver<bool>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            delivery = consumer.deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                worker.requeue(&delivery).await;
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let worker = worker.clone();
        tokio::spawn(async move {
            worker.handle(delivery).await;
            drop(permit);
        });
    }

    // deliveries buffered but not started go back to the queue
    consumer.deliveries.close();
    while let Ok(delivery) = consumer.deliveries.try_recv() {
        worker.requeue(&delivery).await;
    }
    debug!(group = %worker.group, "Group consume loop exited");
}

impl<E: Event> GroupWorker<E> {
    async fn handle(&self, delivery: Delivery) {
        let event = match self.context.serializer.from_bytes(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    group = %self.group,
                    delivery_tag = %delivery.delivery_tag,
                    error = %e,
                    "Dropping malformed message"
                );
                self.metrics.malformed_dropped();
                self.settle(&delivery, Settlement::DeadLetter).await;
                return;
            }
        };

        if event.is_noop() || !self.listener.is_handling(&event) {
            debug!(group = %self.group, event_id = %event.event_id(), "Skipping event");
            self.settle(&delivery, Settlement::Ack).await;
            return;
        }

        let started = Instant::now();
        match listener::invoke(&self.listener, &event).await {
            Ok(()) => {
                self.metrics.listener_succeeded(started.elapsed());
                self.settle(&delivery, Settlement::Ack).await;
            }
            Err(e) => {
                self.metrics.listener_failed();
                warn!(
                    group = %self.group,
                    listener = self.listener.name(),
                    event_id = %event.event_id(),
                    retry_count = delivery.retry_count,
                    error = %e,
                    "Group listener failed"
                );
                self.on_failure(&delivery, &event).await;
            }
        }
    }

    async fn on_failure(&self, delivery: &Delivery, event: &E) {
        let state = DeliveryState::received(delivery.retry_count).fail(&self.context.delays);

        if let DeliveryState::AwaitingRetry { retry_count, delay } = state {
            match self.schedule_retry(delivery, retry_count, delay).await {
                Ok(()) => {
                    info!(
                        group = %self.group,
                        event_id = %event.event_id(),
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduled retry"
                    );
                    self.metrics.retry_scheduled();
                    self.settle(delivery, Settlement::Ack).await;
                    return;
                }
                Err(e) => {
                    error!(
                        group = %self.group,
                        event_id = %event.event_id(),
                        error = %e,
                        "Failed to schedule retry, dead-lettering event"
                    );
                }
            }
        }

        match self.context.dead_letters.store(&self.group, event).await {
            Ok(insertion_id) => {
                error!(
                    group = %self.group,
                    event_id = %event.event_id(),
                    insertion_id = %insertion_id,
                    "Event stored in dead letters"
                );
                self.metrics.dead_lettered();
                self.settle(delivery, Settlement::Ack).await;
            }
            Err(e) => {
                error!(
                    group = %self.group,
                    event_id = %event.event_id(),
                    error = %e,
                    "Failed to store event in dead letters, requeueing"
                );
                self.settle(delivery, Settlement::Requeue).await;
            }
        }
    }

    async fn schedule_retry(
        &self,
        delivery: &Delivery,
        retry_count: u32,
        delay: std::time::Duration,
    ) -> Result<(), EventBusError> {
        let message = OutboundMessage::new(RoutingKey::unconditional().as_str(), delivery.payload.clone())
            .with_retry_count(retry_count)
            .with_expiration(delay);
        let exchange = self.retry_exchange.clone();
        self.context
            .pool
            .execute("publish", |broker| async move {
                broker.publish(&exchange, message).await
            })
            .await
    }

    async fn publish_to_work_queue(&self, event: &E) -> Result<(), EventBusError> {
        let payload = self.context.serializer.to_bytes(event)?;
        let message = OutboundMessage::new(self.work_queue.clone(), payload);
        self.context
            .pool
            .execute("publish", |broker| async move {
                broker.publish(DEFAULT_EXCHANGE, message).await
            })
            .await
    }

    async fn requeue(&self, delivery: &Delivery) {
        self.settle(delivery, Settlement::Requeue).await;
    }

    async fn settle(&self, delivery: &Delivery, settlement: Settlement) {
        let result = self
            .context
            .pool
            .execute(settlement.operation(), |broker| async move {
                match settlement {
                    Settlement::Ack => broker.ack(delivery).await,
                    Settlement::Requeue => broker.reject(delivery, true).await,
                    Settlement::DeadLetter => broker.reject(delivery, false).await,
                }
            })
            .await;
        if let Err(e) = result {
            warn!(
                group = %self.group,
                delivery_tag = %delivery.delivery_tag,
                operation = settlement.operation(),
                error = %e,
                "Failed to settle delivery"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

impl Settlement {
    fn operation(self) -> &'static str {
        match self {
            Settlement::Ack => "ack",
            Settlement::Requeue | Settlement::DeadLetter => "reject",
        }
    }
}
