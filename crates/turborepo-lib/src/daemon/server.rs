use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use notify::Watcher;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::mpsc,
};
use tracing::{debug, warn};
use turbopath::AbsoluteSystemPathBuf;
use turborepo_pidlock::Pidlock;

use super::{glob_watcher::GlobWatcher, proto, DaemonError, Paths, PROTOCOL_VERSION};

#[derive(Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// No client activity within the idle timeout.
    Timeout,
    /// A client asked us to stop, or connected with a mismatched version.
    Shutdown,
    /// The watched repository no longer exists.
    RepoRootGone,
    Interrupt,
    SocketClosed,
}

/// The daemon process: one pid-locked instance per repository, owning the
/// filesystem watcher and answering output-change queries over a unix
/// socket.
pub struct DaemonServer {
    repo_root: AbsoluteSystemPathBuf,
    paths: Paths,
    idle_timeout: Duration,
    start_time: Instant,
}

impl DaemonServer {
    pub fn new(repo_root: AbsoluteSystemPathBuf, paths: Paths, idle_timeout: Duration) -> Self {
        Self {
            repo_root,
            paths,
            idle_timeout,
            start_time: Instant::now(),
        }
    }

    pub async fn serve(self) -> Result<CloseReason, DaemonError> {
        std::fs::create_dir_all(&self.paths.daemon_root)?;

        let mut pidlock = Pidlock::new(self.paths.pid_file());
        pidlock.acquire()?;

        // A previous daemon may have died without cleaning up its socket.
        let sock_path = self.paths.sock_file();
        if sock_path.exists() {
            std::fs::remove_file(&sock_path)?;
        }
        let listener = UnixListener::bind(&sock_path)?;
        debug!("daemon listening at {}", sock_path.display());

        // Bridge notify's callback world into the async world.
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                if let Ok(event) = result {
                    for path in event.paths {
                        event_tx.send(path).ok();
                    }
                }
            })
            .map_err(|err| DaemonError::Unavailable(err.to_string()))?;
        watcher
            .watch(self.repo_root.as_std_path(), notify::RecursiveMode::Recursive)
            .map_err(|err| DaemonError::Unavailable(err.to_string()))?;

        let glob_watcher = Arc::new(GlobWatcher::new(self.repo_root.clone(), event_rx));
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut liveness_check = tokio::time::interval(Duration::from_secs(5));
        let close_reason = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            *last_activity.lock().expect("daemon activity lock") = Instant::now();
                            let connection = Connection {
                                glob_watcher: glob_watcher.clone(),
                                shutdown: shutdown_tx.clone(),
                                last_activity: last_activity.clone(),
                                start_time: self.start_time,
                            };
                            tokio::spawn(connection.handle(stream));
                        }
                        Err(err) => {
                            warn!("daemon failed to accept connection: {err}");
                            break CloseReason::SocketClosed;
                        }
                    }
                }
                _ = liveness_check.tick() => {
                    if !self.repo_root.exists() {
                        break CloseReason::RepoRootGone;
                    }
                    let idle = last_activity
                        .lock()
                        .expect("daemon activity lock")
                        .elapsed();
                    if idle > self.idle_timeout {
                        break CloseReason::Timeout;
                    }
                }
                _ = shutdown_rx.recv() => break CloseReason::Shutdown,
                _ = tokio::signal::ctrl_c() => break CloseReason::Interrupt,
            }
        };

        std::fs::remove_file(&sock_path).ok();
        pidlock.release().ok();
        Ok(close_reason)
    }
}

struct Connection {
    glob_watcher: Arc<GlobWatcher>,
    shutdown: mpsc::Sender<()>,
    last_activity: Arc<Mutex<Instant>>,
    start_time: Instant,
}

impl Connection {
    async fn handle(self, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            *self.last_activity.lock().expect("daemon activity lock") = Instant::now();

            let response = match serde_json::from_str::<proto::Request>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(err) => proto::Response::Error {
                    message: format!("malformed request: {err}"),
                },
            };

            let Ok(mut encoded) = serde_json::to_string(&response) else {
                break;
            };
            encoded.push('\n');
            if write_half.write_all(encoded.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    async fn dispatch(&self, request: proto::Request) -> proto::Response {
        match request {
            proto::Request::Hello { version } => {
                if version == PROTOCOL_VERSION {
                    proto::Response::Hello
                } else {
                    // Let a matching daemon take our place.
                    self.shutdown.send(()).await.ok();
                    proto::Response::Error {
                        message: "version mismatch".to_string(),
                    }
                }
            }
            proto::Request::NotifyOutputsWritten {
                hash,
                output_globs,
                output_exclusion_globs,
                time_saved: _,
            } => match self
                .glob_watcher
                .watch_globs(hash, output_globs, output_exclusion_globs)
                .await
            {
                Ok(()) => proto::Response::NotifyOutputsWritten,
                Err(err) => proto::Response::Error {
                    message: err.to_string(),
                },
            },
            proto::Request::GetChangedOutputs { hash, output_globs } => {
                match self
                    .glob_watcher
                    .get_changed_globs(hash, output_globs.into_iter().collect())
                    .await
                {
                    Ok(changed) => proto::Response::GetChangedOutputs {
                        changed_output_globs: changed.into_iter().collect(),
                    },
                    Err(err) => proto::Response::Error {
                        message: err.to_string(),
                    },
                }
            }
            proto::Request::Status => proto::Response::Status {
                uptime_ms: self.start_time.elapsed().as_millis() as u64,
            },
            proto::Request::Shutdown => {
                self.shutdown.send(()).await.ok();
                proto::Response::Shutdown
            }
        }
    }
}
