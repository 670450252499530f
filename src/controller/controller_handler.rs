use std::process::ExitStatus;
use std::sync::Arc;

use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::configuration::Config;
use crate::error_handling::types::*;
use crate::flow::{FlowService, PLUGIN_NAME};
use crate::network::clients::ClientRegistry;
use crate::network::frontend::Frontend;
use crate::network::listener::Listener;
use crate::plugin::PluginRegistry;
use crate::storage::StoragePool;

/// Owns the whole master: storage workers, the flow service, the listener and
/// the front-end proxy.
pub struct Controller {
    pub config: Config,
}

async fn frontend_exit(frontend: &mut Option<Frontend>) -> std::io::Result<ExitStatus> {
    match frontend {
        Some(frontend) => frontend.wait().await,
        None => std::future::pending().await,
    }
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Runs until Ctrl-C, the loss of the front-end proxy or a listener
    /// failure, then shuts everything down in order. Only the last two are
    /// reported as errors.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        let storage = Arc::new(StoragePool::new(
            &self.config.database,
            self.config.flow.workers,
        )?);
        storage
            .call(|db| db.ensure_schema())
            .await
            .ok_or(ControllerError::StorageUnavailable)??;
        info!("Database ready, {} storage workers", storage.size());

        let plugins = Arc::new(PluginRegistry::new());
        let clients = Arc::new(ClientRegistry::new());
        let (flow_plugin, flow_service) =
            FlowService::new(&self.config.flow, Arc::clone(&storage), clients.clone());
        plugins.register(Arc::new(flow_plugin));

        let socket_path = self.config.listener.socket_path.clone();
        let listener = Listener::bind(&socket_path, Arc::clone(&plugins), Arc::clone(&clients))?;
        let mut frontend = if self.config.frontend.enabled {
            Some(Frontend::spawn(&self.config.frontend, &socket_path)?)
        } else {
            debug!("Front-end proxy disabled");
            None
        };

        let shutdown = CancellationToken::new();
        let service_task = tokio::spawn(flow_service.run(shutdown.clone()));
        let mut listener_task = tokio::spawn(listener.run(shutdown.clone()));
        info!(
            "Init done, checking config every {:?}",
            self.config.reconcile_interval()
        );

        let mut listener_done = false;
        let outcome = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Interrupted, shutting down"),
                    Err(e) => error!("Unable to wait for Ctrl-C ({e}), shutting down"),
                }
                Ok(())
            }
            status = frontend_exit(&mut frontend) => {
                error!("Lost front-end proxy ({status:?}), terminating");
                Err(ControllerError::FrontendLost)
            }
            result = &mut listener_task => {
                listener_done = true;
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(e.into()),
                }
            }
        };

        shutdown.cancel();
        if let Some(frontend) = frontend.take() {
            frontend.stop().await;
        }
        if !listener_done {
            if let Err(e) = listener_task.await {
                error!("Listener task failed: {e}");
            }
        }
        if let Err(e) = service_task.await {
            error!("Flow service task failed: {e}");
        }
        plugins.unregister(PLUGIN_NAME);

        // Joining the workers blocks until their queued jobs are done.
        let joined = tokio::task::spawn_blocking(move || drop(storage)).await;
        if let Err(e) = joined {
            error!("Storage shutdown failed: {e}");
        }
        info!("Shutdown done");
        outcome
    }
}
