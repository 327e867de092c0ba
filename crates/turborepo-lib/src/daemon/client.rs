use std::time::Duration;

use tracing::debug;

use super::{proto, DaemonError, Paths, PROTOCOL_VERSION};

/// A connection to the daemon. All methods are best-effort from the caller's
/// point of view: the run treats any error as "no daemon" and falls back to
/// direct filesystem checks.
pub struct DaemonClient {
    #[cfg(unix)]
    read: tokio::io::BufReader<tokio::net::unix::OwnedReadHalf>,
    #[cfg(unix)]
    write: tokio::net::unix::OwnedWriteHalf,
}

#[cfg(unix)]
impl DaemonClient {
    pub async fn connect(paths: &Paths) -> Result<Self, DaemonError> {
        let stream = tokio::net::UnixStream::connect(paths.sock_file())
            .await
            .map_err(|err| DaemonError::Unavailable(err.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            read: tokio::io::BufReader::new(read_half),
            write: write_half,
        })
    }

    async fn request(&mut self, request: proto::Request) -> Result<proto::Response, DaemonError> {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

        let mut encoded = serde_json::to_string(&request)
            .map_err(|err| DaemonError::MalformedResponse(err.to_string()))?;
        encoded.push('\n');
        self.write.write_all(encoded.as_bytes()).await?;

        let mut line = String::new();
        let read = self.read.read_line(&mut line).await?;
        if read == 0 {
            return Err(DaemonError::Unavailable("daemon closed the connection".to_string()));
        }
        let response = serde_json::from_str(&line)
            .map_err(|err| DaemonError::MalformedResponse(err.to_string()))?;
        match response {
            proto::Response::Error { message } if message == "version mismatch" => {
                Err(DaemonError::VersionMismatch)
            }
            proto::Response::Error { message } => Err(DaemonError::Unavailable(message)),
            response => Ok(response),
        }
    }

    /// Verifies the daemon speaks our protocol version.
    pub async fn handshake(&mut self) -> Result<(), DaemonError> {
        match self
            .request(proto::Request::Hello {
                version: PROTOCOL_VERSION.to_string(),
            })
            .await?
        {
            proto::Response::Hello => Ok(()),
            other => Err(DaemonError::MalformedResponse(format!("{other:?}"))),
        }
    }

    pub async fn get_changed_outputs(
        &mut self,
        hash: String,
        output_globs: Vec<String>,
    ) -> Result<Vec<String>, DaemonError> {
        match self
            .request(proto::Request::GetChangedOutputs { hash, output_globs })
            .await?
        {
            proto::Response::GetChangedOutputs {
                changed_output_globs,
            } => Ok(changed_output_globs),
            other => Err(DaemonError::MalformedResponse(format!("{other:?}"))),
        }
    }

    pub async fn notify_outputs_written(
        &mut self,
        hash: String,
        output_globs: Vec<String>,
        output_exclusion_globs: Vec<String>,
        time_saved: u64,
    ) -> Result<(), DaemonError> {
        match self
            .request(proto::Request::NotifyOutputsWritten {
                hash,
                output_globs,
                output_exclusion_globs,
                time_saved,
            })
            .await?
        {
            proto::Response::NotifyOutputsWritten => Ok(()),
            other => Err(DaemonError::MalformedResponse(format!("{other:?}"))),
        }
    }

    pub async fn status(&mut self) -> Result<u64, DaemonError> {
        match self.request(proto::Request::Status).await? {
            proto::Response::Status { uptime_ms } => Ok(uptime_ms),
            other => Err(DaemonError::MalformedResponse(format!("{other:?}"))),
        }
    }

    /// Stops the daemon and consumes the connection.
    pub async fn stop(mut self) -> Result<(), DaemonError> {
        match self.request(proto::Request::Shutdown).await? {
            proto::Response::Shutdown => Ok(()),
            other => Err(DaemonError::MalformedResponse(format!("{other:?}"))),
        }
    }
}

#[cfg(not(unix))]
impl DaemonClient {
    pub async fn connect(_paths: &Paths) -> Result<Self, DaemonError> {
        Err(DaemonError::Unsupported)
    }

    pub async fn handshake(&mut self) -> Result<(), DaemonError> {
        Err(DaemonError::Unsupported)
    }

    pub async fn get_changed_outputs(
        &mut self,
        _hash: String,
        _output_globs: Vec<String>,
    ) -> Result<Vec<String>, DaemonError> {
        Err(DaemonError::Unsupported)
    }

    pub async fn notify_outputs_written(
        &mut self,
        _hash: String,
        _output_globs: Vec<String>,
        _output_exclusion_globs: Vec<String>,
        _time_saved: u64,
    ) -> Result<(), DaemonError> {
        Err(DaemonError::Unsupported)
    }

    pub async fn status(&mut self) -> Result<u64, DaemonError> {
        Err(DaemonError::Unsupported)
    }

    pub async fn stop(self) -> Result<(), DaemonError> {
        Err(DaemonError::Unsupported)
    }
}

/// Finds or starts a daemon for the repository. Every failure is degradable:
/// the caller runs without a daemon.
pub struct DaemonConnector {
    pub paths: Paths,
    pub can_start_server: bool,
}

impl DaemonConnector {
    const CONNECT_ATTEMPTS: usize = 3;
    const RETRY_DELAY: Duration = Duration::from_millis(300);

    pub fn new(paths: Paths, can_start_server: bool) -> Self {
        Self {
            paths,
            can_start_server,
        }
    }

    pub async fn connect(&self) -> Result<DaemonClient, DaemonError> {
        let mut started_server = false;
        for attempt in 0..Self::CONNECT_ATTEMPTS {
            match DaemonClient::connect(&self.paths).await {
                Ok(mut client) => match client.handshake().await {
                    Ok(()) => return Ok(client),
                    Err(DaemonError::VersionMismatch) => {
                        // The old daemon shuts itself down; retry and start
                        // a fresh one.
                        debug!("daemon version mismatch, restarting");
                    }
                    Err(err) => return Err(err),
                },
                Err(err) if attempt + 1 == Self::CONNECT_ATTEMPTS => return Err(err),
                Err(_) => {}
            }

            if self.can_start_server && !started_server {
                started_server = true;
                self.start_server()?;
            }
            tokio::time::sleep(Self::RETRY_DELAY).await;
        }
        Err(DaemonError::Unavailable(
            "could not connect to daemon".to_string(),
        ))
    }

    /// Launches `turbo daemon start` detached from the current process.
    fn start_server(&self) -> Result<(), DaemonError> {
        let exe = std::env::current_exe()?;
        debug!("starting daemon: {} daemon start", exe.display());
        std::process::Command::new(exe)
            .args(["daemon", "start"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        Ok(())
    }
}
