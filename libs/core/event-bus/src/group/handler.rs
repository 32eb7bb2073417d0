use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::registration::GroupRegistration;
use super::{Group, GroupContext};
use crate::error::EventBusError;
use crate::event::Event;
use crate::listener::EventListener;

/// Group registrations of one bus instance.
pub struct GroupRegistrationHandler<E: Event> {
    context: Arc<GroupContext<E>>,
    registrations: Mutex<HashMap<Group, Arc<GroupRegistration<E>>>>,
    started: AtomicBool,
}

impl<E: Event> GroupRegistrationHandler<E> {
    pub(crate) fn new(context: Arc<GroupContext<E>>) -> Self {
        Self {
            context,
            registrations: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register `listener` for `group`, starting it right away when the bus runs.
    ///
    /// Registering the same listener again is a no-op.
    pub async fn register(
        &self,
        listener: Arc<dyn EventListener<E>>,
        group: Group,
    ) -> Result<(), EventBusError> {
        self.context.naming.validate_group(&group)?;

        let registration = {
            let mut registrations = self.registrations.lock().await;
            if let Some(existing) = registrations.get(&group) {
                if std::ptr::addr_eq(Arc::as_ptr(existing.listener()), Arc::as_ptr(&listener)) {
                    return Ok(());
                }
                return Err(EventBusError::GroupAlreadyRegistered(group));
            }
            let registration = Arc::new(GroupRegistration::new(
                group.clone(),
                listener,
                self.context.clone(),
            ));
            registrations.insert(group.clone(), registration.clone());
            registration
        };

        // broker I/O happens outside the map lock
        if self.started.load(Ordering::SeqCst) {
            if let Err(e) = registration.start().await {
                let mut registrations = self.registrations.lock().await;
                if registrations
                    .get(&group)
                    .is_some_and(|current| Arc::ptr_eq(current, &registration))
                {
                    registrations.remove(&group);
                }
                return Err(e);
            }
        }
        info!(group = %group, "Registered group listener");
        Ok(())
    }

    /// Stop and forget the local registration. The group queue stays.
    pub async fn unregister(&self, group: &Group) {
        let removed = self.registrations.lock().await.remove(group);
        if let Some(registration) = removed {
            registration.stop().await;
            info!(group = %group, "Unregistered group listener");
        }
    }

    pub async fn start(&self) -> Result<(), EventBusError> {
        self.started.store(true, Ordering::SeqCst);
        for (group, registration) in self.snapshot().await {
            if let Err(e) = registration.start().await {
                warn!(group = %group, error = %e, "Failed to start group registration");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop consuming for every group, keeping the registrations.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        for (_, registration) in self.snapshot().await {
            registration.stop().await;
        }
    }

    /// Publish `event` into the work queue of a locally registered group.
    pub async fn re_deliver(&self, group: &Group, event: &E) -> Result<(), EventBusError> {
        self.registration(group).await?.re_deliver(event).await
    }

    /// Like [`Self::re_deliver`] but leaves dead letters untouched on failure.
    pub(crate) async fn try_re_deliver(&self, group: &Group, event: &E) -> Result<(), EventBusError> {
        self.registration(group).await?.try_re_deliver(event).await
    }

    pub async fn registered_groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.registrations.lock().await.keys().cloned().collect();
        groups.sort();
        groups
    }

    async fn snapshot(&self) -> Vec<(Group, Arc<GroupRegistration<E>>)> {
        let registrations = self.registrations.lock().await;
        let mut snapshot: Vec<_> = registrations
            .iter()
            .map(|(group, registration)| (group.clone(), registration.clone()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    async fn registration(&self, group: &Group) -> Result<Arc<GroupRegistration<E>>, EventBusError> {
        self.registrations
            .lock()
            .await
            .get(group)
            .cloned()
            .ok_or_else(|| EventBusError::GroupRegistrationNotFound(group.clone()))
    }
}
