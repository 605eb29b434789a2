//! Registered UI clients.

use std::collections::HashMap;
use tracing::debug;
use tunhost_core::{Messenger, MessengerId, ServiceToClient};

struct Client {
    messenger: Messenger,
    is_activity: bool,
}

/// Clients keyed by messenger identity. A client whose inbox is gone is
/// dropped on the first failed send.
#[derive(Default)]
pub(crate) struct ClientRegistry {
    clients: HashMap<MessengerId, Client>,
}

impl ClientRegistry {
    pub fn register(&mut self, messenger: Messenger, is_activity: bool) {
        let id = messenger.id();
        if self
            .clients
            .insert(id, Client { messenger, is_activity })
            .is_some()
        {
            debug!("{} registered again", id);
        }
    }

    pub fn unregister(&mut self, id: MessengerId) -> bool {
        self.clients.remove(&id).is_some()
    }

    pub fn contains(&self, id: MessengerId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn is_activity(&self, id: MessengerId) -> bool {
        self.clients.get(&id).is_some_and(|c| c.is_activity)
    }

    pub fn activity_ids(&self) -> Vec<MessengerId> {
        self.clients
            .iter()
            .filter(|(_, c)| c.is_activity)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Send to one client. Returns `false` (and prunes) if it is gone.
    pub fn send(&mut self, id: MessengerId, message: ServiceToClient) -> bool {
        let Some(client) = self.clients.get(&id) else {
            return false;
        };
        if client.messenger.send(message).is_ok() {
            return true;
        }
        debug!("Pruning dead client {}", id);
        self.clients.remove(&id);
        false
    }

    pub fn broadcast(&mut self, message: &ServiceToClient) {
        self.clients.retain(|id, client| match client.messenger.send(message.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Pruning dead client {}", id);
                false
            }
        });
    }
}
