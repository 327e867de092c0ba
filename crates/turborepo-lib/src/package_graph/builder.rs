use std::collections::HashMap;

use petgraph::graph::{Graph, NodeIndex};
use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_globwalk::{globwalk, WalkType};
use turborepo_lockfiles::Lockfile;

use super::{Error, PackageGraph, PackageInfo, PackageName, PackageNode};
use crate::package_json::PackageJson;

/// Builds a [`PackageGraph`] from the repo root and the root package.json's
/// workspace globs.
pub struct PackageGraphBuilder<'a> {
    repo_root: &'a AbsoluteSystemPath,
    root_package_json: PackageJson,
    single_package: bool,
    lockfile: Option<Box<dyn Lockfile>>,
    package_jsons: Option<HashMap<AbsoluteSystemPathBuf, PackageJson>>,
}

impl<'a> PackageGraphBuilder<'a> {
    pub fn new(repo_root: &'a AbsoluteSystemPath, root_package_json: PackageJson) -> Self {
        Self {
            repo_root,
            root_package_json,
            single_package: false,
            lockfile: None,
            package_jsons: None,
        }
    }

    pub fn with_single_package_mode(mut self, single_package: bool) -> Self {
        self.single_package = single_package;
        self
    }

    pub fn with_lockfile(mut self, lockfile: Option<Box<dyn Lockfile>>) -> Self {
        self.lockfile = lockfile;
        self
    }

    /// Supplies package.jsons directly instead of discovering them on disk.
    pub fn with_package_jsons(
        mut self,
        package_jsons: Option<HashMap<AbsoluteSystemPathBuf, PackageJson>>,
    ) -> Self {
        self.package_jsons = package_jsons;
        self
    }

    pub fn build(self) -> Result<PackageGraph, Error> {
        let Self {
            repo_root,
            root_package_json,
            single_package,
            lockfile,
            package_jsons,
        } = self;

        let mut packages = HashMap::new();
        packages.insert(
            PackageName::Root,
            PackageInfo {
                package_json: root_package_json.clone(),
                package_path: AnchoredSystemPathBuf::default(),
            },
        );

        if !single_package {
            let discovered = match package_jsons {
                Some(package_jsons) => package_jsons,
                None => Self::discover_package_jsons(repo_root, &root_package_json)?,
            };

            for (package_json_path, package_json) in discovered {
                let Some(name) = package_json.name.clone() else {
                    return Err(Error::MissingName(package_json_path));
                };
                let package_dir = package_json_path
                    .parent()
                    .map(|dir| repo_root.anchor(dir))
                    .transpose()?
                    .unwrap_or_default();
                let previous = packages.insert(
                    PackageName::Other(name.clone()),
                    PackageInfo {
                        package_json,
                        package_path: package_dir,
                    },
                );
                if previous.is_some() {
                    return Err(Error::DuplicateName(name));
                }
            }
        }

        let (graph, node_lookup) = Self::build_graph(&packages);
        turborepo_graph_utils::validate_graph(&graph)?;

        Ok(PackageGraph {
            graph,
            node_lookup,
            packages,
            lockfile,
        })
    }

    fn discover_package_jsons(
        repo_root: &AbsoluteSystemPath,
        root_package_json: &PackageJson,
    ) -> Result<HashMap<AbsoluteSystemPathBuf, PackageJson>, Error> {
        if root_package_json.workspaces.is_empty() {
            warn!("no workspace globs declared in the root package.json");
        }
        let include: Vec<String> = root_package_json
            .workspaces
            .iter()
            .map(|glob| format!("{}/package.json", glob.trim_end_matches('/')))
            .collect();
        let exclude = vec!["**/node_modules/**".to_string()];

        let mut discovered = HashMap::new();
        for path in globwalk(repo_root, &include, &exclude, WalkType::Files)? {
            let package_json = PackageJson::load(&path)?;
            discovered.insert(path, package_json);
        }
        Ok(discovered)
    }

    fn build_graph(
        packages: &HashMap<PackageName, PackageInfo>,
    ) -> (Graph<PackageNode, ()>, HashMap<PackageNode, NodeIndex>) {
        let mut graph = Graph::new();
        let mut node_lookup = HashMap::new();

        let root_index = graph.add_node(PackageNode::Root);
        node_lookup.insert(PackageNode::Root, root_index);
        for name in packages.keys() {
            let node = PackageNode::Workspace(name.clone());
            let index = graph.add_node(node.clone());
            node_lookup.insert(node, index);
        }

        for (name, info) in packages {
            let from_index = node_lookup[&PackageNode::Workspace(name.clone())];
            let mut has_workspace_dep = false;
            for (dep_name, _) in info.package_json.all_dependencies() {
                let dep_node = PackageNode::Workspace(PackageName::from(dep_name.as_str()));
                // Only names that resolve to workspace packages become
                // edges; everything else belongs to the lockfile.
                let Some(dep_index) = node_lookup.get(&dep_node) else {
                    continue;
                };
                if *dep_index == from_index {
                    continue;
                }
                graph.add_edge(from_index, *dep_index, ());
                has_workspace_dep = true;
            }
            if !has_workspace_dep {
                graph.add_edge(from_index, root_index, ());
            }
        }

        (graph, node_lookup)
    }
}
