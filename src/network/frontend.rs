use std::path::Path;
use std::process::{ExitStatus, Stdio};

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::configuration::FrontendConfig;
use crate::error_handling::types::NetworkError;

/// The TLS proxy in front of the listener socket.
///
/// Probes only ever talk to the proxy, so when it exits the master is
/// unreachable and must shut down.
pub struct Frontend {
    child: Child,
    stderr: Option<JoinHandle<()>>,
}

/// Arguments for a socat style proxy terminating TLS on `settings.port` and
/// forwarding every connection to `socket_path`.
pub fn command_line(settings: &FrontendConfig, socket_path: &Path) -> Vec<String> {
    vec![
        format!(
            "OPENSSL-LISTEN:{},fork,backlog=50,key={},cert={},verify=0,reuseaddr,pf=ip6",
            settings.port,
            settings.key.display(),
            settings.cert.display()
        ),
        format!("UNIX-CONNECT:{}", socket_path.display()),
    ]
}

impl Frontend {
    pub fn spawn(settings: &FrontendConfig, socket_path: &Path) -> Result<Self, NetworkError> {
        let args = command_line(settings, socket_path);
        debug!("Starting {} with: {args:?}", settings.program.display());
        let mut child = Command::new(&settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(NetworkError::FrontendSpawn)?;
        info!("Started front-end proxy (pid {:?})", child.id());

        let stderr = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("Front-end complained: {line}");
                }
            })
        });
        Ok(Self { child, stderr })
    }

    /// Resolves when the proxy exits.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Terminates the proxy as part of an orderly shutdown.
    pub async fn stop(mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("Front-end proxy already exited with {status}");
        } else if let Err(e) = self.child.kill().await {
            warn!("Unable to stop the front-end proxy: {e}");
        } else {
            info!("Front-end proxy stopped");
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
    }
}
