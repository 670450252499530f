//! Flow plugin
//!
//! - `batch`: binary flow batches sent by probes.
//! - `ingest`: turns batches into directional events and stores them.
//! - `store`: reads config and filter history.
//! - `diff`: filter diffs and their cache.
//! - `reconcile`: decides what to broadcast when storage changes.
//! - `messages`: wire payloads of the plugin.
//! - `service`: the event loop tying it together.

pub mod batch;
pub mod diff;
pub mod ingest;
pub mod messages;
pub mod reconcile;
pub mod service;
pub mod store;

pub use service::{FlowPlugin, FlowService, PLUGIN_NAME};
