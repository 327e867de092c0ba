//! Child process management for task execution.
//!
//! The manager tracks every spawned child so that a single cancellation
//! signal can stop the whole run: children get a SIGINT, a grace period to
//! wind down, then a SIGKILL.

mod child;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

pub use child::{Child, ChildExit, Command};
use tracing::debug;

#[derive(Debug, Default)]
struct ProcessManagerInner {
    is_closing: bool,
    children: Vec<Child>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerInner>>,
    stop_timeout: Duration,
}

impl ProcessManager {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProcessManagerInner::default())),
            stop_timeout,
        }
    }

    /// Spawns a child process. Returns `None` once the manager is closing,
    /// which is how cancellation stops new tasks from being admitted.
    pub fn spawn(&self, command: Command) -> Option<std::io::Result<Child>> {
        let mut state = self.state.lock().expect("process manager lock");
        if state.is_closing {
            return None;
        }

        let child = Child::spawn(command, self.stop_timeout);
        if let Ok(child) = &child {
            state.children.push(child.clone());
        }
        Some(child)
    }

    /// Stops every running child: SIGINT, grace period, SIGKILL. Children
    /// are stopped concurrently so the grace period is paid once, not per
    /// child. No new children can be spawned afterwards.
    pub async fn stop(&self) {
        let children = {
            let mut state = self.state.lock().expect("process manager lock");
            state.is_closing = true;
            state.children.drain(..).collect::<Vec<_>>()
        };

        futures::future::join_all(children.into_iter().map(|mut child| async move {
            debug!("stopping child {:?}", child.pid());
            child.stop().await;
        }))
        .await;
    }

    /// Waits for every running child to finish on its own, then refuses new
    /// spawns. Used on normal run completion.
    pub async fn wait(&self) {
        let children = {
            let mut state = self.state.lock().expect("process manager lock");
            state.is_closing = true;
            state.children.drain(..).collect::<Vec<_>>()
        };

        futures::future::join_all(
            children.into_iter().map(|mut child| async move {
                child.wait().await;
            }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_command() -> Command {
        let mut command = Command::new("echo");
        command.args(["hello"]);
        command
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let manager = ProcessManager::new(Duration::from_millis(100));
        let mut child = manager.spawn(echo_command()).unwrap().unwrap();
        let exit = child.wait().await;
        assert_eq!(exit, Some(ChildExit::Finished(Some(0))));
    }

    #[tokio::test]
    async fn test_no_spawns_after_stop() {
        let manager = ProcessManager::new(Duration::from_millis(100));
        manager.stop().await;
        assert!(manager.spawn(echo_command()).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_hung_child() {
        let manager = ProcessManager::new(Duration::from_millis(50));
        let mut command = Command::new("sleep");
        command.args(["60"]);
        let mut child = manager.spawn(command).unwrap().unwrap();

        let start = std::time::Instant::now();
        manager.stop().await;
        let exit = child.wait().await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(exit, Some(ChildExit::Killed) | Some(ChildExit::Finished(_))));
    }
}
