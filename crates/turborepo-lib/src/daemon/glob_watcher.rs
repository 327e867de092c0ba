use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use turbopath::{AbsoluteSystemPathBuf, RelativeUnixPathBuf};
use wax::{Any, Glob, Pattern};

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad glob: {0}")]
    BadGlob(String),
    #[error("glob watcher has shut down")]
    Closed,
}

/// Watch state for one hash: its exclusion matcher and the inclusion globs
/// whose match set has not changed since `NotifyOutputsWritten`.
struct HashState {
    exclude: Option<Any<'static>>,
    unchanged: HashSet<String>,
}

enum Query {
    WatchGlobs {
        hash: String,
        include: Vec<String>,
        exclude: Vec<String>,
        resp: oneshot::Sender<Result<(), Error>>,
    },
    GetChangedGlobs {
        hash: String,
        candidates: HashSet<String>,
        resp: oneshot::Sender<HashSet<String>>,
    },
}

/// The daemon's map of hash to watched output globs, driven by a stream of
/// filesystem events. Queries and events are serialized through one actor
/// task, which is the reader/writer lock in channel form.
pub struct GlobWatcher {
    query_tx: mpsc::Sender<Query>,
    // Dropping this stops the tracker task.
    _exit_tx: oneshot::Sender<()>,
}

struct GlobTracker {
    repo_root: AbsoluteSystemPathBuf,
    /// Per-hash watch state.
    hash_states: HashMap<String, HashState>,
    /// Inclusion glob to (compiled form, hashes for which it is unchanged).
    glob_statuses: HashMap<String, (Glob<'static>, HashSet<String>)>,
}

impl GlobWatcher {
    pub fn new(
        repo_root: AbsoluteSystemPathBuf,
        mut file_events: mpsc::UnboundedReceiver<std::path::PathBuf>,
    ) -> Self {
        let (query_tx, mut query_rx) = mpsc::channel::<Query>(128);
        let (exit_tx, mut exit_rx) = oneshot::channel::<()>();

        let mut tracker = GlobTracker {
            repo_root,
            hash_states: HashMap::new(),
            glob_statuses: HashMap::new(),
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut exit_rx => break,
                    Some(query) = query_rx.recv() => tracker.handle_query(query),
                    Some(path) = file_events.recv() => tracker.handle_file_event(&path),
                    else => break,
                }
            }
        });

        Self {
            query_tx,
            _exit_tx: exit_tx,
        }
    }

    pub async fn watch_globs(
        &self,
        hash: String,
        include: Vec<String>,
        exclude: Vec<String>,
    ) -> Result<(), Error> {
        let (resp, rx) = oneshot::channel();
        self.query_tx
            .send(Query::WatchGlobs {
                hash,
                include,
                exclude,
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// The subset of `candidates` whose matched files changed since the
    /// matching `watch_globs`. An unknown hash returns every candidate so
    /// the caller falls back to a full on-disk check.
    pub async fn get_changed_globs(
        &self,
        hash: String,
        candidates: HashSet<String>,
    ) -> Result<HashSet<String>, Error> {
        let (resp, rx) = oneshot::channel();
        self.query_tx
            .send(Query::GetChangedGlobs {
                hash,
                candidates,
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }
}

impl GlobTracker {
    fn handle_query(&mut self, query: Query) {
        match query {
            Query::WatchGlobs {
                hash,
                include,
                exclude,
                resp,
            } => {
                let result = self.watch(hash, include, exclude);
                resp.send(result).ok();
            }
            Query::GetChangedGlobs {
                hash,
                mut candidates,
                resp,
            } => {
                if let Some(state) = self.hash_states.get(&hash) {
                    candidates.retain(|glob| !state.unchanged.contains(glob));
                }
                resp.send(candidates).ok();
            }
        }
    }

    fn watch(
        &mut self,
        hash: String,
        include: Vec<String>,
        exclude: Vec<String>,
    ) -> Result<(), Error> {
        debug!("watching globs {include:?} (excluding {exclude:?}) for {hash}");
        let exclude_any = if exclude.is_empty() {
            None
        } else {
            let globs = exclude
                .iter()
                .map(|raw| compile_glob(raw))
                .collect::<Result<Vec<_>, _>>()?;
            Some(
                wax::any(globs)
                    .map_err(|_| Error::BadGlob(exclude.join(",")))?,
            )
        };

        let mut unchanged = HashSet::new();
        for raw in include {
            let glob = compile_glob(&raw)?;
            let (_, hashes) = self
                .glob_statuses
                .entry(raw.clone())
                .or_insert_with(|| (glob, HashSet::new()));
            hashes.insert(hash.clone());
            unchanged.insert(raw);
        }

        self.hash_states.insert(
            hash,
            HashState {
                exclude: exclude_any,
                unchanged,
            },
        );
        Ok(())
    }

    fn handle_file_event(&mut self, path: &std::path::Path) {
        let Ok(absolute) = turbopath::AbsoluteSystemPath::from_std_path(path) else {
            return;
        };
        let Ok(relative) = self.repo_root.anchor(absolute) else {
            // An event outside the repo is not relevant.
            return;
        };
        let relative = relative.to_unix();
        trace!("filesystem event for {relative}");
        self.handle_path_change(&relative);
    }

    fn handle_path_change(&mut self, path: &RelativeUnixPathBuf) {
        let hash_states = &mut self.hash_states;
        for (glob_str, (glob, hashes)) in self.glob_statuses.iter_mut() {
            if !glob.is_match(path.as_str()) {
                continue;
            }
            hashes.retain(|hash| {
                let excluded = hash_states
                    .get(hash)
                    .and_then(|state| state.exclude.as_ref())
                    .is_some_and(|exclude| exclude.is_match(path.as_str()));
                if !excluded {
                    if let Some(state) = hash_states.get_mut(hash) {
                        state.unchanged.remove(glob_str);
                    }
                }
                excluded
            });
        }
    }
}

fn compile_glob(raw: &str) -> Result<Glob<'static>, Error> {
    Glob::new(raw)
        .map(Glob::into_owned)
        .map_err(|_| Error::BadGlob(raw.to_string()))
}
