//! # Flow service
//!
//! The event loop of the flow plugin. It owns everything that changes over
//! time: the reconciliation baseline, the diff cache and the diff requests
//! waiting for storage.
//!
//! ```text
//! ┌──────────────┐ FlowMessage ┌─────────────┐   jobs    ┌─────────────┐
//! │ FlowPlugin   │────────────▶│ FlowService │──────────▶│ StoragePool │
//! │ (registry)   │   (mpsc)    │  (one task) │◀──────────│  (threads)  │
//! └──────────────┘             └──────┬──────┘completions└─────────────┘
//!                                     │ send / broadcast
//!                                     ▼
//!                               ┌──────────┐
//!                               │ Outbound │
//!                               └──────────┘
//! ```
//!
//! Messages of one client reach the loop in the order the client sent them.
//! Storage work never runs on the loop: flow batches are handed to a worker
//! and forgotten, snapshot loads and diff queries come back as completions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::diff::{compute_diff, DiffCache, DiffKey};
use super::ingest::store_flows;
use super::messages::{build_diff, Request};
use super::reconcile::Baseline;
use super::store::{load_history, load_snapshot, Snapshot};
use crate::configuration::FlowConfig;
use crate::error_handling::types::{DbError, IngestError};
use crate::network::clients::Outbound;
use crate::network::types::ClientHandle;
use crate::plugin::Plugin;
use crate::storage::StoragePool;

/// Name the probes use for this plugin.
pub const PLUGIN_NAME: &str = "Flow";

#[derive(Debug)]
pub struct FlowMessage {
    pub client: ClientHandle,
    pub payload: Bytes,
}

/// The registry-facing half: forwards client messages to the service.
pub struct FlowPlugin {
    messages: UnboundedSender<FlowMessage>,
}

impl Plugin for FlowPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn message_from_client(&self, client: &ClientHandle, payload: Bytes) {
        let message = FlowMessage {
            client: client.clone(),
            payload,
        };
        if self.messages.send(message).is_err() {
            warn!("Flow service is not running, message from {client} dropped");
        }
    }
}

enum Completion {
    Snapshot(Option<Result<Snapshot, DbError>>),
    Diff {
        key: DiffKey,
        generation: u64,
        result: Option<Result<Bytes, DbError>>,
    },
}

pub struct FlowService {
    storage_key: String,
    reconcile_interval: Duration,
    storage: Arc<StoragePool>,
    outbound: Arc<dyn Outbound>,
    messages: UnboundedReceiver<FlowMessage>,
    completions: UnboundedReceiver<Completion>,
    completion_tx: UnboundedSender<Completion>,
    baseline: Baseline,
    cache: DiffCache,
    pending: HashMap<DiffKey, Vec<ClientHandle>>,
    snapshot_in_flight: bool,
}

impl FlowService {
    /// Creates the service and the plugin feeding it.
    pub fn new(
        settings: &FlowConfig,
        storage: Arc<StoragePool>,
        outbound: Arc<dyn Outbound>,
    ) -> (FlowPlugin, FlowService) {
        let (message_tx, messages) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let service = FlowService {
            storage_key: settings.plugin.clone(),
            reconcile_interval: Duration::from_secs(settings.reconcile_interval_secs),
            storage,
            outbound,
            messages,
            completions,
            completion_tx,
            baseline: Baseline::new(),
            cache: DiffCache::new(),
            pending: HashMap::new(),
            snapshot_in_flight: false,
        };
        (FlowPlugin { messages: message_tx }, service)
    }

    /// Runs until `shutdown` is cancelled. The first reconciliation starts
    /// right away.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Flow service started, reconciling every {:?}",
            self.reconcile_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.start_reconcile(),
                Some(message) = self.messages.recv() => self.handle_message(message),
                Some(completion) = self.completions.recv() => self.complete(completion),
            }
        }

        if !self.pending.is_empty() {
            debug!("Dropping {} pending diff requests", self.pending.len());
        }
        info!("Flow service stopped");
    }

    fn start_reconcile(&mut self) {
        if self.snapshot_in_flight {
            debug!("Previous config check still running, skipping this one");
            return;
        }
        self.snapshot_in_flight = true;

        let storage = Arc::clone(&self.storage);
        let completions = self.completion_tx.clone();
        let key = self.storage_key.clone();
        tokio::spawn(async move {
            let result = storage.call(move |db| load_snapshot(db, &key)).await;
            let _ = completions.send(Completion::Snapshot(result));
        });
    }

    fn handle_message(&mut self, message: FlowMessage) {
        let FlowMessage { client, payload } = message;
        let request = match Request::parse(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed flow message from {client}: {e}");
                return;
            }
        };

        match request {
            Request::Config => self.send_config(&client),
            Request::Flows(data) => self.store(client, data),
            Request::Diff(key) => self.request_diff(client, key),
        }
    }

    fn send_config(&self, client: &ClientHandle) {
        match self.baseline.config_for(client.protocol_version) {
            None => info!("Config requested by {client} before it was loaded, ignoring"),
            Some(Err(e)) => error!("Unable to build config for {client}: {e}"),
            Some(Ok(payload)) => {
                debug!("Sending config to {client}");
                self.outbound.send(client, PLUGIN_NAME, payload.clone());
            }
        }
    }

    fn store(&self, client: ClientHandle, data: Bytes) {
        debug!("Flows from {client}");
        let expected = self.baseline.config_version();
        self.storage.execute(move |db| {
            match store_flows(db, &client.name, &data, expected) {
                Ok(_) => {}
                Err(IngestError::UnknownClient(name)) => {
                    warn!("Dropping flows of {name}, the client is not in the database")
                }
                Err(e) => error!("Flows from {client} not stored: {e}"),
            }
        });
    }

    fn request_diff(&mut self, client: ClientHandle, key: DiffKey) {
        debug!(
            "Sending diff for filter {}@{} from {} to {} to client {client}",
            key.name, key.epoch, key.from, key.to
        );
        if let Some(payload) = self.cache.get(&key) {
            self.outbound.send(&client, PLUGIN_NAME, payload);
            return;
        }
        if let Some(waiting) = self.pending.get_mut(&key) {
            waiting.push(client);
            return;
        }
        self.pending.insert(key.clone(), vec![client]);

        let storage = Arc::clone(&self.storage);
        let completions = self.completion_tx.clone();
        let generation = self.cache.generation();
        tokio::spawn(async move {
            let query = key.clone();
            let result = storage
                .call(move |db| -> Result<Bytes, DbError> {
                    let records = load_history(db, &query.name, query.epoch, query.from, query.to)?;
                    Ok(build_diff(&query, &compute_diff(&records, query.full)))
                })
                .await;
            let _ = completions.send(Completion::Diff {
                key,
                generation,
                result,
            });
        });
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Snapshot(result) => {
                self.snapshot_in_flight = false;
                match result {
                    Some(Ok(snapshot)) => self.apply_snapshot(snapshot),
                    Some(Err(e)) => error!("Config check failed: {e}"),
                    None => error!("Config check did not complete"),
                }
            }
            Completion::Diff {
                key,
                generation,
                result,
            } => {
                let waiting = self.pending.remove(&key).unwrap_or_default();
                match result {
                    Some(Ok(payload)) => {
                        self.cache.insert(key, payload.clone(), generation);
                        for client in waiting {
                            self.outbound.send(&client, PLUGIN_NAME, payload.clone());
                        }
                    }
                    Some(Err(e)) => error!(
                        "Diff of filter {} for {} clients failed: {e}",
                        key.name,
                        waiting.len()
                    ),
                    None => error!("Diff of filter {} did not complete", key.name),
                }
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let reconciled = self.baseline.reconcile(snapshot);
        for message in reconciled.messages {
            let audience = message.audience;
            let sent = self
                .outbound
                .broadcast(PLUGIN_NAME, message.payload, &|client| {
                    audience.accepts(client.protocol_version)
                });
            debug!("Broadcast to {sent} {audience:?} clients");
        }
        if reconciled.invalidate {
            self.cache.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::batch::tests::{encode_batch, sample_record};
    use crate::flow::messages::{build_announcement, build_config};
    use crate::flow::store::tests::{add_change, set_config};
    use crate::flow::store::ConfigSnapshot;
    use crate::storage::test_support::temp_settings;
    use crate::storage::Database;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records what would have been written to each client.
    struct FakeOutbound {
        clients: Vec<ClientHandle>,
        sent: Mutex<Vec<(String, Bytes)>>,
    }

    impl FakeOutbound {
        fn sent_to(&self, name: &str) -> Vec<Bytes> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| to == name)
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    impl Outbound for FakeOutbound {
        fn send(&self, client: &ClientHandle, _plugin: &str, payload: Bytes) -> bool {
            self.sent.lock().unwrap().push((client.name.clone(), payload));
            true
        }

        fn broadcast(
            &self,
            _plugin: &str,
            payload: Bytes,
            accept: &dyn Fn(&ClientHandle) -> bool,
        ) -> usize {
            let targets: Vec<_> = self.clients.iter().filter(|c| accept(c)).collect();
            for client in &targets {
                self.sent
                    .lock()
                    .unwrap()
                    .push((client.name.clone(), payload.clone()));
            }
            targets.len()
        }
    }

    struct Harness {
        _dir: TempDir,
        storage: Arc<StoragePool>,
        outbound: Arc<FakeOutbound>,
        plugin: FlowPlugin,
        shutdown: CancellationToken,
        legacy: ClientHandle,
        modern: ClientHandle,
    }

    fn config() -> ConfigSnapshot {
        [
            ("version", "4"),
            ("max_flows", "100"),
            ("timeout", "5000"),
            ("minpackets", "1"),
            ("filter", "i(10.0.0.1)"),
            ("filter-diff", "T"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    async fn start(prepare: impl FnOnce(&mut Database) + Send + 'static) -> Harness {
        let (dir, settings) = temp_settings();
        let storage = Arc::new(StoragePool::new(&settings, 2).unwrap());
        storage
            .call(move |db| {
                db.ensure_schema().unwrap();
                for (name, value) in config() {
                    set_config(db, "flow", &name, &value);
                }
                prepare(db);
            })
            .await
            .unwrap();

        let legacy = ClientHandle::new("legacy", 1);
        let modern = ClientHandle::new("modern", 2);
        let outbound = Arc::new(FakeOutbound {
            clients: vec![legacy.clone(), modern.clone()],
            sent: Mutex::new(Vec::new()),
        });
        let (plugin, service) =
            FlowService::new(&FlowConfig::default(), Arc::clone(&storage), outbound.clone());
        let shutdown = CancellationToken::new();
        tokio::spawn(service.run(shutdown.clone()));

        let harness = Harness {
            _dir: dir,
            storage,
            outbound,
            plugin,
            shutdown,
            legacy,
            modern,
        };
        wait_for(|| harness.outbound.sent_to("legacy").len() == 1).await;
        harness
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_first_tick_broadcasts_config() {
        let h = start(|db| add_change(db, "blocked", 1, 3, "10.9.9.9", true)).await;
        wait_for(|| h.outbound.sent_to("modern").len() == 2).await;

        assert_eq!(
            h.outbound.sent_to("legacy"),
            vec![build_config(&config(), "filter").unwrap()]
        );
        assert_eq!(
            h.outbound.sent_to("modern"),
            vec![
                build_config(&config(), "filter-diff").unwrap(),
                build_announcement("blocked", 1, 3),
            ]
        );
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_config_request_depends_on_version() {
        let h = start(|_| {}).await;

        h.plugin.message_from_client(&h.legacy, Bytes::from_static(b"C"));
        h.plugin.message_from_client(&h.modern, Bytes::from_static(b"C"));
        wait_for(|| h.outbound.sent_to("modern").len() == 2).await;
        wait_for(|| h.outbound.sent_to("legacy").len() == 2).await;

        let legacy = h.outbound.sent_to("legacy");
        let modern = h.outbound.sent_to("modern");
        assert_eq!(&legacy[1][17..], b"i\x00\x00\x00\x01\x04\x0a\x00\x00\x01");
        assert_eq!(&modern[1][17..], b"T");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_diff_request() {
        let h = start(|db| {
            add_change(db, "f", 1, 1, "A", true);
            add_change(db, "f", 1, 1, "10.0.0.1", true);
            add_change(db, "f", 1, 3, "10.0.0.1", false);
            add_change(db, "f", 1, 4, "10.0.0.2", true);
        })
        .await;

        let request = Bytes::from_static(b"U\x01\x00\x00\x00\x01f\x00\x00\x00\x01\x00\x00\x00\x05");
        h.plugin.message_from_client(&h.modern, request.clone());
        h.plugin.message_from_client(&h.legacy, request);
        wait_for(|| h.outbound.sent_to("legacy").len() == 2).await;
        wait_for(|| h.outbound.sent_to("modern").len() >= 3).await;

        let expected = build_diff(
            &DiffKey::full("f", 1, 5),
            &BTreeMap::from([("10.0.0.2".to_string(), true)]),
        );
        assert_eq!(h.outbound.sent_to("legacy")[1], expected);
        assert_eq!(h.outbound.sent_to("modern").last().unwrap(), &expected);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_flows_are_stored() {
        let h = start(|db| {
            db.transaction(true, |cursor| {
                cursor.execute("INSERT INTO clients (name) VALUES ('modern')", vec![])
            })
            .unwrap();
        })
        .await;

        let mut payload = vec![b'D'];
        payload.extend_from_slice(&encode_batch(4, 5_000, &[sample_record()]));
        h.plugin.message_from_client(&h.modern, Bytes::from(payload));

        let storage = Arc::clone(&h.storage);
        let mut stored = 0;
        for _ in 0..500 {
            stored = storage
                .call(|db| {
                    db.transaction(true, |cursor| {
                        let row = cursor.query_one("SELECT COUNT(*) AS n FROM flows", vec![])?;
                        Ok(row.map_or(0, |r| r.try_get::<i64>("", "n").unwrap_or(0)))
                    })
                    .unwrap()
                })
                .await
                .unwrap();
            if stored == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored, 2);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let h = start(|_| {}).await;
        h.plugin.message_from_client(&h.modern, Bytes::from_static(b"U\x01"));
        h.plugin.message_from_client(&h.modern, Bytes::from_static(b"C"));
        wait_for(|| h.outbound.sent_to("modern").len() == 2).await;
        h.shutdown.cancel();
    }
}
