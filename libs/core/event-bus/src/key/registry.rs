use std::collections::HashMap;
use std::sync::Arc;

use crate::event::Event;
use crate::listener::EventListener;
use crate::registration_key::RoutingKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddOutcome {
    /// The key had no listener before; its binding is needed.
    FirstListener,
    Added,
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveOutcome {
    /// No listener remains for the key; its binding can go.
    LastListener,
    Removed,
    NotRegistered,
}

/// Listeners registered on this instance, per routing key.
pub(crate) struct LocalListenerRegistry<E: Event> {
    listeners: HashMap<RoutingKey, Vec<Arc<dyn EventListener<E>>>>,
}

impl<E: Event> LocalListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }

    pub fn add(&mut self, key: RoutingKey, listener: Arc<dyn EventListener<E>>) -> AddOutcome {
        let entry = self.listeners.entry(key).or_default();
        if entry.iter().any(|existing| same(existing, &listener)) {
            return AddOutcome::AlreadyRegistered;
        }
        entry.push(listener);
        if entry.len() == 1 {
            AddOutcome::FirstListener
        } else {
            AddOutcome::Added
        }
    }

    pub fn remove(&mut self, key: &RoutingKey, listener: &Arc<dyn EventListener<E>>) -> RemoveOutcome {
        let Some(entry) = self.listeners.get_mut(key) else {
            return RemoveOutcome::NotRegistered;
        };
        let before = entry.len();
        entry.retain(|existing| !same(existing, listener));
        if entry.len() == before {
            return RemoveOutcome::NotRegistered;
        }
        if entry.is_empty() {
            self.listeners.remove(key);
            return RemoveOutcome::LastListener;
        }
        RemoveOutcome::Removed
    }

    pub fn listeners(&self, key: &RoutingKey) -> Vec<Arc<dyn EventListener<E>>> {
        self.listeners.get(key).cloned().unwrap_or_default()
    }

    pub fn routing_keys(&self) -> Vec<RoutingKey> {
        let mut keys: Vec<RoutingKey> = self.listeners.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn same<E: Event>(a: &Arc<dyn EventListener<E>>, b: &Arc<dyn EventListener<E>>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
