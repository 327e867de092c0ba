mod builder;

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

pub use builder::PackageGraphBuilder;
use petgraph::graph::{Graph, NodeIndex};
use serde::Serialize;
use turbopath::{AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf};
use turborepo_lockfiles::Lockfile;

use crate::{package_json::PackageJson, task_id::ROOT_PKG_NAME};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("package.json at {0} has no name field")]
    MissingName(AbsoluteSystemPathBuf),
    #[error("duplicate package name: {0}")]
    DuplicateName(String),
    #[error(transparent)]
    PackageJson(#[from] crate::package_json::Error),
    #[error("unable to walk workspace globs: {0}")]
    Walk(#[from] turborepo_globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    Graph(#[from] turborepo_graph_utils::Error),
}

/// A workspace package name. The root package is special-cased so that it
/// can never collide with a package that happens to be named `//`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageName {
    Root,
    Other(String),
}

impl Serialize for PackageName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl PackageName {
    pub fn as_str(&self) -> &str {
        match self {
            PackageName::Root => ROOT_PKG_NAME,
            PackageName::Other(name) => name,
        }
    }
}

impl From<&str> for PackageName {
    fn from(value: &str) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value.to_string())
        }
    }
}

impl From<String> for PackageName {
    fn from(value: String) -> Self {
        if value == ROOT_PKG_NAME {
            PackageName::Root
        } else {
            PackageName::Other(value)
        }
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vertex in the workspace graph: a package, or the synthetic root every
/// package implicitly depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackageNode {
    Root,
    Workspace(PackageName),
}

impl fmt::Display for PackageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageNode::Root => f.write_str("___ROOT___"),
            PackageNode::Workspace(name) => name.fmt(f),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub package_json: PackageJson,
    /// Repo-relative directory containing the package.
    pub package_path: AnchoredSystemPathBuf,
}

impl PackageInfo {
    pub fn package_dir(&self) -> &AnchoredSystemPath {
        &self.package_path
    }
}

/// The workspace package graph. Edges point from a package to the packages
/// it depends on, restricted to in-workspace names.
#[derive(Debug)]
pub struct PackageGraph {
    graph: Graph<PackageNode, ()>,
    node_lookup: HashMap<PackageNode, NodeIndex>,
    packages: HashMap<PackageName, PackageInfo>,
    lockfile: Option<Box<dyn Lockfile>>,
}

impl PackageGraph {
    pub fn builder(
        repo_root: &turbopath::AbsoluteSystemPath,
        root_package_json: PackageJson,
    ) -> PackageGraphBuilder {
        PackageGraphBuilder::new(repo_root, root_package_json)
    }

    pub fn packages(&self) -> impl Iterator<Item = (&PackageName, &PackageInfo)> {
        self.packages.iter()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn package_info(&self, name: &PackageName) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn package_json(&self, name: &PackageName) -> Option<&PackageJson> {
        self.packages.get(name).map(|info| &info.package_json)
    }

    pub fn package_dir(&self, name: &PackageName) -> Option<&AnchoredSystemPath> {
        self.packages.get(name).map(|info| info.package_dir())
    }

    pub fn lockfile(&self) -> Option<&dyn Lockfile> {
        self.lockfile.as_deref()
    }

    /// Direct in-workspace dependencies of the given node, the set that
    /// `^task` edges expand over.
    pub fn immediate_dependencies(&self, node: &PackageNode) -> Option<HashSet<&PackageNode>> {
        let index = self.node_lookup.get(node)?;
        Some(
            self.graph
                .neighbors_directed(*index, petgraph::Direction::Outgoing)
                .map(|dep_index| {
                    self.graph
                        .node_weight(dep_index)
                        .expect("node index comes from the graph")
                })
                .filter(|dep| !matches!(dep, PackageNode::Root))
                .collect(),
        )
    }

    /// All packages the given packages transitively depend on, themselves
    /// included. Used by `--include-dependencies`.
    pub fn transitive_dependencies(&self, names: &[PackageName]) -> HashSet<PackageName> {
        let indices = names.iter().filter_map(|name| {
            self.node_lookup
                .get(&PackageNode::Workspace(name.clone()))
                .copied()
        });
        turborepo_graph_utils::transitive_closure(
            &self.graph,
            indices.collect::<Vec<_>>(),
            petgraph::Direction::Outgoing,
        )
        .into_iter()
        .filter_map(|node| match node {
            PackageNode::Workspace(name) => Some(name.clone()),
            PackageNode::Root => None,
        })
        .collect()
    }
}
