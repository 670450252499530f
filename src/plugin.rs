//! Plugins are the handlers of client traffic. Every frame after the hello
//! names the plugin it is for; the [`registry::PluginRegistry`] routes it.

pub mod registry;

use bytes::Bytes;

use crate::network::types::ClientHandle;

pub use registry::PluginRegistry;

pub trait Plugin: Send + Sync {
    /// Must match the name the client side uses.
    fn name(&self) -> &str;

    fn client_connected(&self, _client: &ClientHandle) {}

    /// Called once the client is no longer reachable.
    fn client_disconnected(&self, _client: &ClientHandle) {}

    fn message_from_client(&self, client: &ClientHandle, payload: Bytes);
}
