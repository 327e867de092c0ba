use std::{
    collections::{BTreeSet, HashMap},
    hash::Hash,
};

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::trace;

/// A node handed out by the walker, paired with the channel the caller uses
/// to mark it finished.
pub type WalkMessage<N> = (N, oneshot::Sender<()>);

/// Walks a DAG, emitting each node only after every node it depends on
/// (its outgoing neighbors) has been acknowledged as finished.
///
/// The walk is a single coordinator task running Kahn's algorithm on live
/// completion events: each node carries a count of unfinished dependencies,
/// an acknowledgement decrements the count of every dependent, and nodes
/// whose count reaches zero enter a ready set. Ties between ready nodes are
/// broken by node id, so identical graphs emit in identical order.
///
/// The graph must not be modified once a walker has been constructed.
pub struct Walker<N> {
    cancel: Option<oneshot::Sender<()>>,
    node_events: Option<mpsc::Receiver<WalkMessage<N>>>,
    join_handle: Option<JoinHandle<()>>,
}

impl<N: Eq + Hash + Copy + Ord + Send + 'static> Walker<N> {
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        // Flatten the graph into the two maps the coordinator needs: how
        // many dependencies each node is still waiting on, and who to
        // notify when a node finishes.
        let mut dependency_counts: HashMap<N, usize> = HashMap::new();
        let mut dependents: HashMap<N, Vec<N>> = HashMap::new();
        let mut ready: BTreeSet<N> = BTreeSet::new();
        for node in graph.node_identifiers() {
            let mut count = 0;
            for dependency in graph.neighbors_directed(node, Direction::Outgoing) {
                count += 1;
                dependents.entry(dependency).or_default().push(node);
            }
            dependency_counts.insert(node, count);
            if count == 0 {
                ready.insert(node);
            }
        }

        // Capacity covers every node, so emitting can never block.
        let (node_tx, node_rx) = mpsc::channel(std::cmp::max(dependency_counts.len(), 1));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let join_handle = tokio::spawn(walk_graph(
            dependency_counts,
            dependents,
            ready,
            node_tx,
            cancel_rx,
        ));

        Self {
            cancel: Some(cancel_tx),
            node_events: Some(node_rx),
            join_handle: Some(join_handle),
        }
    }

    /// Starts the walk, returning the stream of ready nodes.
    pub fn walk(mut self) -> (Walker<N>, mpsc::Receiver<WalkMessage<N>>) {
        let node_events = self
            .node_events
            .take()
            .expect("walker can only be started once");
        (self, node_events)
    }

    /// Stops emitting new nodes. Nodes already handed to the channel are
    /// still delivered. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.send(()).ok();
        }
    }

    /// Waits for the coordinator to wind down, typically after a cancel.
    pub async fn wait(mut self) -> Result<(), tokio::task::JoinError> {
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.await?;
        }
        Ok(())
    }
}

async fn walk_graph<N: Eq + Hash + Copy + Ord + Send + 'static>(
    mut dependency_counts: HashMap<N, usize>,
    dependents: HashMap<N, Vec<N>>,
    mut ready: BTreeSet<N>,
    node_tx: mpsc::Sender<WalkMessage<N>>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut in_flight: FuturesUnordered<_> = FuturesUnordered::new();
    let mut cancelled = false;

    loop {
        // Emit everything currently ready, smallest node id first.
        while !cancelled {
            let Some(node) = ready.iter().next().copied() else {
                break;
            };
            ready.remove(&node);

            let (done_tx, done_rx) = oneshot::channel::<()>();
            if node_tx.send((node, done_tx)).await.is_err() {
                // The caller dropped the receiver without cancelling, so
                // nothing can ever be acknowledged again.
                trace!("walk receiver dropped before completion");
                return;
            }
            // A dropped acknowledgement channel counts as completion.
            in_flight.push(async move {
                done_rx.await.ok();
                node
            });
        }

        if in_flight.is_empty() {
            // Either the whole graph has been emitted and acknowledged, or
            // a cancel arrived and the last in-flight node has settled.
            break;
        }

        tokio::select! {
            // A cancel that races with an acknowledgement wins, so no
            // further node is emitted.
            biased;
            _ = &mut cancel_rx, if !cancelled => {
                cancelled = true;
            }
            Some(finished) = in_flight.next() => {
                for dependent in dependents.get(&finished).into_iter().flatten() {
                    let count = dependency_counts
                        .get_mut(dependent)
                        .expect("dependent nodes are in the count map");
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use petgraph::Graph;

    use super::*;

    #[tokio::test]
    async fn test_dependency_order() {
        // a depends on b, b depends on c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let (walker, mut nodes) = walker.walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = nodes.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_ready_ties_break_by_node_id() {
        // Four independent nodes become ready at once; emission follows
        // their ids regardless of insertion order.
        let mut g = Graph::<&str, ()>::new();
        let d = g.add_node("d");
        let c = g.add_node("c");
        let b = g.add_node("b");
        let a = g.add_node("a");

        let walker = Walker::new(&g);
        let (walker, mut nodes) = walker.walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = nodes.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![d, c, b, a]);
    }

    #[tokio::test]
    async fn test_cancel_stops_emission() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let (mut walker, mut nodes) = walker.walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = nodes.recv().await {
            walker.cancel();
            visited.push(index);
            done.send(()).unwrap();
        }
        assert_eq!(visited, vec![c]);
        walker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_siblings_not_blocked_by_slow_branch() {
        // a depends on both b and d; b depends on c, d depends on e.
        // e is held open until b completes, which must not stop c or b.
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        let e = g.add_node("e");
        g.add_edge(a, b, ());
        g.add_edge(a, d, ());
        g.add_edge(b, c, ());
        g.add_edge(d, e, ());

        let walker = Walker::new(&g);
        let visited = Arc::new(Mutex::new(Vec::new()));
        let (walker, mut nodes) = walker.walk();
        let (b_done_tx, b_done_rx) = oneshot::channel::<()>();
        let mut b_done_tx = Some(b_done_tx);
        let mut b_done_rx = Some(b_done_rx);
        while let Some((index, done)) = nodes.recv().await {
            if index == e {
                let b_done_rx = b_done_rx.take().unwrap();
                let visited = visited.clone();
                tokio::spawn(async move {
                    b_done_rx.await.unwrap();
                    visited.lock().unwrap().push(index);
                    done.send(()).unwrap();
                });
            } else {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
                if index == b {
                    b_done_tx.take().unwrap().send(()).unwrap();
                }
            }
        }
        walker.wait().await.unwrap();
        assert_eq!(visited.lock().unwrap().as_slice(), &[c, b, e, d, a]);
    }

    #[tokio::test]
    async fn test_dropped_ack_counts_as_finished() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(a, b, ());

        let walker = Walker::new(&g);
        let (walker, mut nodes) = walker.walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = nodes.recv().await {
            visited.push(index);
            // Never acknowledge explicitly; dropping the channel suffices.
            drop(done);
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![b, a]);
    }
}
