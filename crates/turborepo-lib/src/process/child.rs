use std::{
    collections::HashMap,
    io::Write,
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    sync::{mpsc, watch},
};
use tracing::debug;
use turbopath::AbsoluteSystemPathBuf;

/// A command to spawn, built up by the visitor from the package's script and
/// the resolved environment.
#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<String>,
    cwd: Option<AbsoluteSystemPathBuf>,
    env: HashMap<String, String>,
    env_clear: bool,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            env_clear: false,
        }
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(&mut self, cwd: AbsoluteSystemPathBuf) -> &mut Self {
        self.cwd = Some(cwd);
        self
    }

    /// Drop the inherited environment; only explicitly provided vars reach
    /// the child. This is how strict env mode is enforced.
    pub fn env_clear(&mut self) -> &mut Self {
        self.env_clear = true;
        self
    }

    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn label(&self) -> String {
        format!("({}) {} {}",
            self.cwd.as_ref().map(|cwd| cwd.as_str()).unwrap_or("."),
            self.program,
            self.args.join(" "))
    }
}

impl From<Command> for tokio::process::Command {
    fn from(command: Command) -> Self {
        let Command {
            program,
            args,
            cwd,
            env,
            env_clear,
        } = command;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if env_clear {
            cmd.env_clear();
        }
        cmd.envs(env);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd.as_std_path());
        }
        cmd
    }
}

/// Why a child is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Finished(Option<i32>),
    /// The child did not exit within the grace period and was killed.
    Killed,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum ShutdownStyle {
    /// SIGINT, wait for the grace period, then SIGKILL.
    Graceful(Duration),
    Kill,
}

/// A spawned child process. Cloning shares the same underlying process; any
/// clone may wait on or stop it.
#[derive(Debug, Clone)]
pub struct Child {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ChildExit>>,
    kill_tx: mpsc::Sender<ShutdownStyle>,
    stdout: Arc<Mutex<Option<tokio::process::ChildStdout>>>,
    stderr: Arc<Mutex<Option<tokio::process::ChildStderr>>>,
    stop_timeout: Duration,
}

impl Child {
    pub fn spawn(command: Command, stop_timeout: Duration) -> std::io::Result<Child> {
        let mut child = tokio::process::Command::from(command).spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<ShutdownStyle>(1);

        tokio::spawn(async move {
            let exit = loop {
                tokio::select! {
                    status = child.wait() => {
                        break match status {
                            Ok(status) => ChildExit::Finished(status.code()),
                            Err(_) => ChildExit::Failed,
                        };
                    }
                    Some(style) = kill_rx.recv() => {
                        match style {
                            ShutdownStyle::Graceful(grace_period) => {
                                #[cfg(unix)]
                                if let Some(pid) = pid {
                                    debug!("sending SIGINT to child {pid}");
                                    // SAFETY: pid came from a process we spawned.
                                    unsafe {
                                        libc::kill(pid as i32, libc::SIGINT);
                                    }
                                }
                                match tokio::time::timeout(grace_period, child.wait()).await {
                                    Ok(Ok(status)) => break ChildExit::Finished(status.code()),
                                    Ok(Err(_)) => break ChildExit::Failed,
                                    Err(_) => {
                                        debug!("child {pid:?} outlived the grace period, killing");
                                        break match child.kill().await {
                                            Ok(()) => ChildExit::Killed,
                                            Err(_) => ChildExit::Failed,
                                        };
                                    }
                                }
                            }
                            ShutdownStyle::Kill => {
                                break match child.kill().await {
                                    Ok(()) => ChildExit::Killed,
                                    Err(_) => ChildExit::Failed,
                                };
                            }
                        }
                    }
                }
            };
            exit_tx.send(Some(exit)).ok();
        });

        Ok(Child {
            pid,
            exit: exit_rx,
            kill_tx,
            stdout: Arc::new(Mutex::new(stdout)),
            stderr: Arc::new(Mutex::new(stderr)),
            stop_timeout,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for the child to exit, however that happens.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        if let Some(exit) = *self.exit.borrow() {
            return Some(exit);
        }
        while self.exit.changed().await.is_ok() {
            if let Some(exit) = *self.exit.borrow() {
                return Some(exit);
            }
        }
        *self.exit.borrow()
    }

    /// Interrupts the child, waits out the grace period, then kills it.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        self.kill_tx
            .send(ShutdownStyle::Graceful(self.stop_timeout))
            .await
            .ok();
        self.wait().await
    }

    pub async fn kill(&mut self) -> Option<ChildExit> {
        self.kill_tx.send(ShutdownStyle::Kill).await.ok();
        self.wait().await
    }

    /// Streams the child's stdout and stderr, interleaved, into `writer`
    /// until both close, then reports the exit.
    pub async fn wait_with_piped_outputs<W: Write>(
        &mut self,
        mut writer: W,
    ) -> Result<Option<ChildExit>, std::io::Error> {
        let stdout = self.stdout.lock().expect("child stdout lock").take();
        let stderr = self.stderr.lock().expect("child stderr lock").take();
        let mut stdout_open = stdout.is_some();
        let mut stderr_open = stderr.is_some();
        let mut stdout = stdout;
        let mut stderr = stderr;
        let mut stdout_buffer = [0u8; 4096];
        let mut stderr_buffer = [0u8; 4096];

        while stdout_open || stderr_open {
            tokio::select! {
                read = read_stream(&mut stdout, &mut stdout_buffer), if stdout_open => {
                    match read? {
                        0 => stdout_open = false,
                        n => writer.write_all(&stdout_buffer[..n])?,
                    }
                }
                read = read_stream(&mut stderr, &mut stderr_buffer), if stderr_open => {
                    match read? {
                        0 => stderr_open = false,
                        n => writer.write_all(&stderr_buffer[..n])?,
                    }
                }
            }
        }
        writer.flush()?;

        Ok(self.wait().await)
    }
}

async fn read_stream<R: tokio::io::AsyncRead + Unpin>(
    stream: &mut Option<R>,
    buffer: &mut [u8],
) -> Result<usize, std::io::Error> {
    match stream {
        Some(reader) => reader.read(buffer).await,
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let mut command = Command::new("sh");
        command.args(["-c", "exit 3"]);
        let mut child = Child::spawn(command, Duration::from_millis(100)).unwrap();
        assert_eq!(child.wait().await, Some(ChildExit::Finished(Some(3))));
    }

    #[tokio::test]
    async fn test_output_capture() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err 1>&2"]);
        let mut child = Child::spawn(command, Duration::from_millis(100)).unwrap();

        let mut output = Vec::new();
        let exit = child.wait_with_piped_outputs(&mut output).await.unwrap();
        assert_eq!(exit, Some(ChildExit::Finished(Some(0))));
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn test_env_clear_hides_variables() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo value:$CHILD_TEST_VAR"]);
        command.env_clear();
        command.envs([("PATH", std::env::var("PATH").unwrap_or_default())]);
        std::env::set_var("CHILD_TEST_VAR", "leaked");

        let mut child = Child::spawn(command, Duration::from_millis(100)).unwrap();
        let mut output = Vec::new();
        child.wait_with_piped_outputs(&mut output).await.unwrap();
        std::env::remove_var("CHILD_TEST_VAR");

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("value:"), "{text}");
        assert!(!text.contains("leaked"), "{text}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_stop_on_trapped_sigint() {
        // The child traps SIGINT and exits promptly; stop() should not need
        // the kill path.
        let mut command = Command::new("sh");
        command.args(["-c", "trap 'exit 130' INT; sleep 30 & wait"]);
        let mut child = Child::spawn(command, Duration::from_secs(5)).unwrap();

        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let exit = child.stop().await;
        assert_eq!(exit, Some(ChildExit::Finished(Some(130))));
    }
}
