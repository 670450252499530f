use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use log::{info, warn};

use super::Plugin;
use crate::network::types::ClientHandle;

/// Name to plugin map shared by all connections.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `plugin`, replacing any plugin of the same name.
    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        info!("Registering plugin {name}");
        if self.plugins.insert(name.clone(), plugin).is_some() {
            warn!("Plugin {name} was already registered, replaced");
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.remove(name).map(|(_, plugin)| plugin)
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|e| e.key().clone()).collect()
    }

    fn all(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn client_connected(&self, client: &ClientHandle) {
        for plugin in self.all() {
            plugin.client_connected(client);
        }
    }

    pub fn client_disconnected(&self, client: &ClientHandle) {
        for plugin in self.all() {
            plugin.client_disconnected(client);
        }
    }

    /// Hands `payload` to the plugin called `name`. Returns false if there
    /// is none.
    pub fn dispatch(&self, client: &ClientHandle, name: &str, payload: Bytes) -> bool {
        let plugin = self.plugins.get(name).map(|e| Arc::clone(e.value()));
        match plugin {
            Some(plugin) => {
                plugin.message_from_client(client, payload);
                true
            }
            None => {
                warn!("Message from {client} for unknown plugin {name:?}");
                false
            }
        }
    }
}
