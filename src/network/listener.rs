//! # Listener
//!
//! Accepts the connections the TLS front-end proxy forwards to the local unix
//! socket, one per probe, and pumps frames between them and the plugins.
//!
//! ```text
//! ┌──────────┐  TLS  ┌───────────┐  unix  ┌──────────┐ dispatch ┌────────────────┐
//! │  Probe   │──────▶│ front-end │───────▶│ Listener │─────────▶│ PluginRegistry │
//! └──────────┘       └───────────┘        │          │◀─────────┤ (via outbox)   │
//!                                         └──────────┘          └────────────────┘
//! ```
//!
//! Every frame is prefixed with its length as a big-endian u32. The first
//! frame is a [`Hello`]; all later ones, in both directions, are
//! [`PluginFrame`]s.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::clients::ClientRegistry;
use super::types::{ClientHandle, Hello, PluginFrame};
use crate::error_handling::types::NetworkError;
use crate::plugin::PluginRegistry;

pub struct Listener {
    socket_path: PathBuf,
    listener: UnixListener,
    plugins: Arc<PluginRegistry>,
    clients: Arc<ClientRegistry>,
}

impl Listener {
    /// Binds the socket, replacing a stale socket file left by a previous
    /// run.
    pub fn bind(
        socket_path: &Path,
        plugins: Arc<PluginRegistry>,
        clients: Arc<ClientRegistry>,
    ) -> Result<Self, NetworkError> {
        if socket_path.exists() {
            debug!("Removing stale socket {}", socket_path.display());
            std::fs::remove_file(socket_path).map_err(NetworkError::BindFail)?;
        }
        let listener = UnixListener::bind(socket_path).map_err(NetworkError::BindFail)?;
        info!("Listening on {}", socket_path.display());
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
            plugins,
            clients,
        })
    }

    /// Accepts connections until `shutdown` is cancelled. Open connections
    /// are closed on shutdown as well.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), NetworkError> {
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => break Err(NetworkError::AcceptFail(e)),
                    };
                    let plugins = Arc::clone(&self.plugins);
                    let clients = Arc::clone(&self.clients);
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, &plugins, &clients, shutdown).await {
                            warn!("Connection closed with error: {e}");
                        }
                    });
                }
            }
        };

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            error!("Unable to remove socket {}: {e}", self.socket_path.display());
        }
        result
    }
}

/// Serves one connection: reads the hello, registers the client, then routes
/// frames until either side closes.
pub async fn serve_connection<S>(
    stream: S,
    plugins: &PluginRegistry,
    clients: &ClientRegistry,
    shutdown: CancellationToken,
) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let hello = match framed.next().await {
        Some(frame) => Hello::decode(frame?.freeze())?,
        None => return Err(NetworkError::NoHello),
    };

    let client = ClientHandle::new(hello.name, hello.protocol_version);
    info!(
        "Client {client} connected (protocol version {})",
        client.protocol_version
    );
    let (outbox_tx, mut outbox) = mpsc::unbounded_channel();
    clients.add(client.clone(), outbox_tx);
    plugins.client_connected(&client);

    let result = pump(&mut framed, &client, &mut outbox, plugins, &shutdown).await;

    clients.remove(&client.id);
    plugins.client_disconnected(&client);
    info!("Client {client} disconnected");
    result
}

async fn pump<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    client: &ClientHandle,
    outbox: &mut UnboundedReceiver<Bytes>,
    plugins: &PluginRegistry,
    shutdown: &CancellationToken,
) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = framed.next() => {
                let frame = match frame {
                    Some(frame) => frame?,
                    None => return Ok(()),
                };
                match PluginFrame::decode(frame.freeze()) {
                    Ok(frame) => {
                        plugins.dispatch(client, &frame.plugin, frame.payload);
                    }
                    Err(e) => warn!("Malformed frame from {client}: {e}"),
                }
            }
            Some(out) = outbox.recv() => framed.send(out).await?,
        }
    }
}
