//! Control socket server
//!
//! One request and one response per connection. Composite requests go
//! through [`Operations`], so they queue behind each other and behind the
//! nightly backup.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use crate::operations::Operations;
use crate::protocol::{read_frame, write_frame, BackupInfo, Request, Response};
use crate::supervisor::Launcher;

/// How long a client has to send its request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Listening control socket; the socket file is removed on drop
pub struct ControlServer {
    listener: UnixListener,
    socket_path: PathBuf,
    shutdown: Arc<Notify>,
}

impl ControlServer {
    pub fn bind(socket_path: &Path) -> std::io::Result<Self> {
        // Remove stale socket from a previous run
        let _ = std::fs::remove_file(socket_path);

        if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        // Only the owner may control the game server
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Resolves once a client has sent [`Request::Shutdown`]
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await
    }

    /// Accept connections forever, serving each on its own task
    pub async fn serve<L: Launcher>(&self, ops: Arc<Operations<L>>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(stream, Arc::clone(&ops), Arc::clone(&self.shutdown)));
                }
                Err(e) => {
                    log::error!("accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection<L: Launcher>(stream: UnixStream, ops: Arc<Operations<L>>, shutdown: Arc<Notify>) {
    match stream.peer_cred() {
        Ok(cred) => log::info!(
            "connection from uid={} pid={}",
            cred.uid(),
            cred.pid().map_or_else(|| "?".to_string(), |p| p.to_string())
        ),
        Err(e) => log::warn!("connection from unknown peer: {}", e),
    }
    serve_stream(stream, &ops, &shutdown, REQUEST_TIMEOUT).await;
}

/// Read one request, answer it, done
async fn serve_stream<S, L>(mut stream: S, ops: &Operations<L>, shutdown: &Notify, read_timeout: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
    L: Launcher,
{
    let request: Request = match tokio::time::timeout(read_timeout, read_frame(&mut stream)).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            log::error!("read error: {}", e);
            let _ = write_frame(&mut stream, &Response::Error("invalid request".into())).await;
            return;
        }
        Err(_) => {
            log::warn!("no request within {:?}, closing connection", read_timeout);
            let _ = write_frame(&mut stream, &Response::Error("request timed out".into())).await;
            return;
        }
    };
    log::debug!("request: {:?}", request);

    let response = handle_request(request, ops, shutdown).await;
    if let Err(e) = write_frame(&mut stream, &response).await {
        log::error!("write error: {}", e);
    }
}

pub async fn handle_request<L: Launcher>(request: Request, ops: &Operations<L>, shutdown: &Notify) -> Response {
    match request {
        Request::Ping => Response::Pong,
        Request::Status => Response::Status {
            running: ops.supervisor().running(),
            status: ops.supervisor().status(),
        },
        Request::ListBackups => match ops.list_backups().await {
            Ok(records) => Response::Backups(records.into_iter().map(BackupInfo::from).collect()),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::BackupPath { id } => match ops.backup_path(id).await {
            Ok(path) => Response::BackupPath(path),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Restart => to_response(ops.restart().await, "restart"),
        Request::Backup { comment } => match ops.backup(&comment).await {
            Ok(id) => Response::BackupCreated(id),
            Err(e) => {
                log::error!("backup failed: {}", e);
                Response::Error(e.to_string())
            }
        },
        Request::Restore { id } => to_response(ops.restore(id).await, "restore"),
        Request::Update => to_response(ops.update().await, "update"),
        Request::Shutdown => {
            log::info!("Shutdown requested over control socket");
            // Stored as a permit if the daemon isn't waiting yet
            shutdown.notify_one();
            Response::Ok
        }
    }
}

fn to_response<E: std::fmt::Display>(result: Result<(), E>, what: &str) -> Response {
    match result {
        Ok(()) => Response::Ok,
        Err(e) => {
            log::error!("{} failed: {}", what, e);
            Response::Error(e.to_string())
        }
    }
}
