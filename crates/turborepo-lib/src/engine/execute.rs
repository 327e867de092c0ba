use std::sync::Arc;

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::visit::EdgeRef;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};

use super::{Built, Engine, TaskNode};
use crate::task_id::TaskId;

/// A task handed to the visitor, along with the channel used to report how
/// it went. Replying `Err(StopExecution)` stops the engine from admitting
/// any further tasks.
pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

/// The visitor's way of telling the engine to stop admitting new work,
/// used on failure when `--continue` is not set and on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopExecution;

#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    pub parallel: bool,
    pub concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(parallel: bool, concurrency: usize) -> Self {
        Self {
            parallel,
            concurrency,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("task executor panicked: {0}")]
    Panic(#[from] tokio::task::JoinError),
}

impl Engine<Built> {
    /// Walks the task graph in dependency order with bounded concurrency,
    /// sending each ready task to `visitor`. Tasks are only emitted once all
    /// of their dependencies have been acknowledged; the visitor decides
    /// what "running" a task means (execute, replay from cache, skip).
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<TaskId<'static>, Result<(), StopExecution>>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions {
            parallel,
            concurrency,
        } = options;
        let sem = Arc::new(Semaphore::new(concurrency));

        // `--parallel` drops every edge that isn't the synthetic root
        // anchor, so all tasks become immediately ready.
        let graph = if parallel {
            let mut graph = self.task_graph.clone();
            graph.retain_edges(|graph, edge| {
                graph
                    .edge_endpoints(edge)
                    .is_some_and(|(_, target)| target == self.root_index)
            });
            for index in graph.node_indices() {
                if index != self.root_index
                    && !graph.edges(index).any(|edge| edge.target() == self.root_index)
                {
                    graph.add_edge(index, self.root_index, ());
                }
            }
            graph
        } else {
            self.task_graph.clone()
        };

        let walker = turborepo_graph_utils::Walker::new(&graph);
        let (walker, mut nodes) = walker.walk();
        let walker = Arc::new(tokio::sync::Mutex::new(Some(walker)));

        let mut handlers = FuturesUnordered::new();
        while let Some((node_index, done)) = nodes.recv().await {
            let task_id = match graph
                .node_weight(node_index)
                .expect("walker emits nodes from the graph")
            {
                TaskNode::Root => {
                    done.send(()).ok();
                    continue;
                }
                TaskNode::Task(task_id) => task_id.clone(),
            };

            let sem = sem.clone();
            let visitor = visitor.clone();
            let walker = walker.clone();
            handlers.push(tokio::spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .expect("semaphore is never closed while executing");

                let (callback, result) = oneshot::channel();
                if visitor
                    .send(Message {
                        info: task_id,
                        callback,
                    })
                    .await
                    .is_err()
                {
                    // The visitor has gone away; finish bookkeeping so the
                    // walk can wind down.
                    done.send(()).ok();
                    return;
                }

                match result.await {
                    Ok(Ok(())) => {}
                    Ok(Err(StopExecution)) => {
                        if let Some(walker) = walker.lock().await.as_mut() {
                            walker.cancel();
                        }
                    }
                    // Dropped callback counts as completion.
                    Err(_) => {}
                }
                done.send(()).ok();
            }));
        }
        drop(visitor);

        while let Some(result) = handlers.next().await {
            result?;
        }

        let walker = walker
            .lock()
            .await
            .take()
            .expect("walker is only taken once");
        walker.wait().await?;

        Ok(())
    }
}
