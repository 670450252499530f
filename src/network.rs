//! Connection layer: the unix socket the front-end proxy forwards probes to,
//! the framing on it and the set of connected clients.

pub mod clients;
pub mod frontend;
pub mod listener;
pub mod types;

pub use clients::{ClientRegistry, Outbound};
pub use types::ClientHandle;
