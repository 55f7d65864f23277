//! IPC server: Unix socket listener and per-client request handling.
//!
//! Each accepted connection carries exactly one request/response round
//! trip. Handler errors are converted to failure envelopes and logged;
//! the accept loop only stops when shutdown is signalled.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use sockpool_common::{PoolResult, RequestId};
use sockpool_config::DaemonConfig;
use sockpool_ipc::protocol::{Request, Response};

use crate::dispatcher::Dispatcher;

/// Prepare the IPC socket path for binding.
///
/// A stale socket file is unlinked; if that fails the permissions are
/// forced and the unlink retried; if the path still cannot be freed the
/// daemon falls back to `<base>_<pid>.sock` and logs the substitution.
pub fn prepare_socket_path(config: &DaemonConfig) -> PathBuf {
    let path = config.socket_path.clone();
    if !path.exists() {
        return path;
    }

    match fs::remove_file(&path) {
        Ok(()) => {
            debug!(path = %path.display(), "Unlinked stale IPC socket");
            path
        }
        Err(first_error) => {
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o666));
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Unlinked stale IPC socket after chmod");
                    path
                }
                Err(second_error) => {
                    let fallback = amended_path(&path, std::process::id());
                    warn!(
                        path = %path.display(),
                        fallback = %fallback.display(),
                        first_error = %first_error,
                        second_error = %second_error,
                        "Could not unlink stale IPC socket, using per-pid fallback path"
                    );
                    fallback
                }
            }
        }
    }
}

fn amended_path(path: &Path, pid: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sockpool".to_string());
    path.with_file_name(format!("{stem}_{pid}.sock"))
}

/// The Unix-socket accept loop.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    request_buffer: usize,
    client_io_timeout: std::time::Duration,
}

impl IpcServer {
    /// Bind the listener and open it up to other local users.
    pub fn bind(
        path: PathBuf,
        dispatcher: Arc<Dispatcher>,
        config: &DaemonConfig,
    ) -> PoolResult<Self> {
        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666))?;
        info!(path = %path.display(), "IPC server listening");
        Ok(Self {
            listener,
            path,
            dispatcher,
            request_buffer: config.request_buffer,
            client_io_timeout: config.io_timeout,
        })
    }

    /// The socket path actually bound.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept clients until shutdown is signalled, then drain in-flight
    /// handlers within `drain_timeout`.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        drain_timeout: std::time::Duration,
    ) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutdown signalled, closing accept loop");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let request_buffer = self.request_buffer;
                            let io_timeout = self.client_io_timeout;
                            handlers.spawn(async move {
                                handle_client(stream, dispatcher, request_buffer, io_timeout)
                                    .await;
                            });
                        }
                        Err(e) => {
                            // Transient accept failures must not kill the loop.
                            error!(error = %e, "Failed to accept IPC client");
                        }
                    }
                }
                // Reap finished handlers so the set does not grow.
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        let draining = handlers.len();
        if draining > 0 {
            info!(in_flight = draining, "Draining in-flight requests");
            let drain = async {
                while handlers.join_next().await.is_some() {}
            };
            if timeout(drain_timeout, drain).await.is_err() {
                warn!(
                    timeout_ms = drain_timeout.as_millis() as u64,
                    "Drain timed out, aborting remaining handlers"
                );
                handlers.abort_all();
            }
        }
    }
}

/// One request/response round trip with a single client.
async fn handle_client(
    mut stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    request_buffer: usize,
    io_timeout: std::time::Duration,
) {
    let started = Instant::now();
    let request_id = RequestId::new();

    // The request is the first chunk read, interpreted as JSON.
    let mut buf = vec![0u8; request_buffer];
    let n = match timeout(io_timeout, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            warn!(request_id = %request_id, error = %e, "Failed to read client request");
            return;
        }
        Err(_) => {
            warn!(request_id = %request_id, "Client sent no request within timeout");
            return;
        }
    };
    if n == 0 {
        debug!(request_id = %request_id, "Client closed without sending a request");
        return;
    }

    let mut response = match Request::from_slice(&buf[..n]) {
        Ok(request) => {
            debug!(
                request_id = %request_id,
                action = request.action(),
                "Handling request"
            );
            dispatcher.dispatch(request).await
        }
        Err(error) => {
            warn!(request_id = %request_id, error = %error, "Rejected request");
            Response::failure(&error)
        }
    };
    response.request_id = Some(request_id.to_string());
    response.processing_time = Some(started.elapsed().as_secs_f64() * 1000.0);

    let raw = match serde_json::to_vec(&response) {
        Ok(raw) => raw,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Failed to serialize response");
            format!(
                "{{\"success\":false,\"error\":\"internal: response serialization\",\"request_id\":\"{request_id}\"}}"
            )
            .into_bytes()
        }
    };

    // A client that went away mid-response is its problem, not ours.
    if let Err(e) = stream.write_all(&raw).await {
        debug!(request_id = %request_id, error = %e, "Client disconnected before response");
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amended_path_embeds_pid() {
        let path = amended_path(Path::new("/tmp/socket_pool_service.sock"), 4242);
        assert_eq!(
            path,
            PathBuf::from("/tmp/socket_pool_service_4242.sock")
        );
    }

    #[test]
    fn prepare_passes_through_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.socket_path = dir.path().join("fresh.sock");
        assert_eq!(prepare_socket_path(&config), dir.path().join("fresh.sock"));
    }

    #[test]
    fn prepare_unlinks_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        fs::write(&path, b"").unwrap();
        let mut config = DaemonConfig::default();
        config.socket_path = path.clone();

        assert_eq!(prepare_socket_path(&config), path);
        assert!(!path.exists());
    }
}
