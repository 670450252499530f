use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::types::{ClientHandle, PluginFrame};

/// Delivery of plugin messages to connected clients.
pub trait Outbound: Send + Sync {
    /// Queues `payload` for `client`. Returns false when the client is gone.
    fn send(&self, client: &ClientHandle, plugin: &str, payload: Bytes) -> bool;

    /// Queues `payload` for every client `accept` selects and returns how
    /// many got it.
    fn broadcast(&self, plugin: &str, payload: Bytes, accept: &dyn Fn(&ClientHandle) -> bool)
        -> usize;
}

struct Entry {
    handle: ClientHandle,
    outbox: UnboundedSender<Bytes>,
}

/// The connected clients, each with the queue its connection task writes
/// out.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<Uuid, Entry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handle: ClientHandle, outbox: UnboundedSender<Bytes>) {
        debug!("Client {} ({}) registered", handle, handle.id);
        self.clients.insert(handle.id, Entry { handle, outbox });
    }

    pub fn remove(&self, id: &Uuid) -> Option<ClientHandle> {
        self.clients.remove(id).map(|(_, entry)| entry.handle)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// The connected clients at this moment.
    pub fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients.iter().map(|e| e.handle.clone()).collect()
    }

    fn outbox(&self, id: &Uuid) -> Option<UnboundedSender<Bytes>> {
        self.clients.get(id).map(|e| e.outbox.clone())
    }
}

impl Outbound for ClientRegistry {
    fn send(&self, client: &ClientHandle, plugin: &str, payload: Bytes) -> bool {
        let Some(outbox) = self.outbox(&client.id) else {
            debug!("Not sending to {client}, it disconnected");
            return false;
        };
        if outbox.send(PluginFrame::encode(plugin, &payload)).is_err() {
            warn!("Connection of {client} is closing, message dropped");
            return false;
        }
        true
    }

    fn broadcast(
        &self,
        plugin: &str,
        payload: Bytes,
        accept: &dyn Fn(&ClientHandle) -> bool,
    ) -> usize {
        let frame = PluginFrame::encode(plugin, &payload);
        let targets: Vec<_> = self
            .clients
            .iter()
            .filter(|e| accept(&e.handle))
            .map(|e| (e.handle.clone(), e.outbox.clone()))
            .collect();

        let mut delivered = 0;
        for (client, outbox) in targets {
            if outbox.send(frame.clone()).is_err() {
                warn!("Broadcast to {client} failed");
            } else {
                delivered += 1;
            }
        }
        delivered
    }
}
