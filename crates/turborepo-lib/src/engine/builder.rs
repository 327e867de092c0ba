use std::collections::{HashMap, HashSet, VecDeque};

use itertools::Itertools;
use turbopath::{AnchoredSystemPath, RelativeUnixPathBuf};

use super::{Building, Built, Engine};
use crate::{
    package_graph::{PackageGraph, PackageName, PackageNode},
    task_id::{TaskId, TaskName, ROOT_PKG_NAME},
    turbo_json::{RawTaskDefinition, TaskDefinition, TurboJsonLoader},
};

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("Could not find the following tasks in project: {0}")]
    MissingTasks(String),
    #[error("Could not find package {package} referenced by task {task_id}")]
    MissingPackageFromTask { package: String, task_id: String },
    #[error(
        "root task {task_id} must be explicitly defined as //#{task_name} in the root turbo.json"
    )]
    MissingRootTask { task_id: String, task_name: String },
    #[error("Could not find \"{task_id}\" in project. Declare \"{task_name}\" in turbo.json or \
             add a \"{task_name}\" script to {package}/package.json")]
    MissingPackageTask {
        task_id: String,
        task_name: String,
        package: String,
    },
    #[error(transparent)]
    Config(#[from] crate::turbo_json::Error),
    #[error(transparent)]
    Graph(#[from] turborepo_graph_utils::Error),
}

/// Builds the task graph for one run by breadth-first expansion of the
/// requested tasks' `dependsOn` lists.
pub struct EngineBuilder<'a> {
    package_graph: &'a PackageGraph,
    turbo_json_loader: &'a TurboJsonLoader,
    is_single_package: bool,
    workspaces: Vec<PackageName>,
    tasks: Vec<TaskName<'static>>,
    root_enabled_tasks: HashSet<TaskName<'static>>,
    tasks_only: bool,
    scoped_packages_only: bool,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(
        package_graph: &'a PackageGraph,
        turbo_json_loader: &'a TurboJsonLoader,
        is_single_package: bool,
    ) -> Self {
        Self {
            package_graph,
            turbo_json_loader,
            is_single_package,
            workspaces: Vec::new(),
            tasks: Vec::new(),
            root_enabled_tasks: HashSet::new(),
            tasks_only: false,
            scoped_packages_only: false,
        }
    }

    pub fn with_workspaces(mut self, workspaces: Vec<PackageName>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    pub fn with_root_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.root_enabled_tasks = tasks
            .into_iter()
            .filter(|name| name.package() == Some(ROOT_PKG_NAME))
            .map(|name| TaskName::from(name.task().to_string()))
            .collect();
        self
    }

    /// `--only`: run exactly the requested tasks, dropping dependency edges
    /// that point outside the requested set.
    pub fn with_tasks_only(mut self, tasks_only: bool) -> Self {
        self.tasks_only = tasks_only;
        self
    }

    /// `--no-deps`: prune the graph to tasks in the scoped packages.
    pub fn with_scoped_packages_only(mut self, scoped_packages_only: bool) -> Self {
        self.scoped_packages_only = scoped_packages_only;
        self
    }

    // The vertices admissible under --only / --no-deps, or None when
    // everything is allowed.
    fn allowed_task_filter(&self) -> Option<HashSet<TaskId<'static>>> {
        if self.tasks_only {
            Some(
                self.workspaces
                    .iter()
                    .cartesian_product(self.tasks.iter())
                    .map(|(package, task_name)| task_name.task_id_for_package(package.as_str()))
                    .collect(),
            )
        } else if self.scoped_packages_only {
            let packages: HashSet<&PackageName> = self.workspaces.iter().collect();
            Some(
                self.workspaces
                    .iter()
                    .flat_map(|package| {
                        let package_tasks = self
                            .package_graph
                            .package_json(package)
                            .map(|json| json.scripts.keys().cloned().collect::<Vec<_>>())
                            .unwrap_or_default();
                        package_tasks
                            .into_iter()
                            .map(|task| TaskId::from_owned(package.as_str().to_string(), task))
                            .collect::<Vec<_>>()
                    })
                    .filter(|task_id| packages.contains(&PackageName::from(task_id.package())))
                    .collect(),
            )
        } else {
            None
        }
    }

    pub fn build(self) -> Result<Engine<Built>, BuilderError> {
        if self.workspaces.is_empty() {
            return Ok(Engine::default().seal());
        }

        let allowed_tasks = self.allowed_task_filter();
        let mut missing_tasks: HashSet<&TaskName<'static>> = self.tasks.iter().collect();
        let mut traversal_queue = VecDeque::new();

        for (workspace, task) in self
            .workspaces
            .iter()
            .cartesian_product(self.tasks.iter())
        {
            let task_id = task.task_id_for_package(workspace.as_str());

            if !self.has_task_definition(workspace, task, &task_id)? {
                continue;
            }
            missing_tasks.remove(task);

            // Root tasks only run when explicitly declared with the //#
            // prefix; bare names never enqueue work in the root package. In
            // single-package mode the root package is the whole repo, so the
            // restriction does not apply.
            if matches!(workspace, PackageName::Root)
                && !self.is_single_package
                && !self
                    .root_enabled_tasks
                    .contains(&task_id.as_non_workspace_task_name().into_owned())
            {
                continue;
            }
            // Bare names only become vertices where the package declares
            // the script.
            if !task.is_package_qualified() && !self.package_has_script(workspace, task.task()) {
                continue;
            }

            traversal_queue.push_back(task_id);
        }

        if !missing_tasks.is_empty() {
            let mut missing: Vec<String> = missing_tasks
                .into_iter()
                .map(|task| task.to_string())
                .collect();
            missing.sort();
            return Err(BuilderError::MissingTasks(missing.join(", ")));
        }

        let mut visited = HashSet::new();
        let mut engine = Engine::<Building>::new();

        while let Some(task_id) = traversal_queue.pop_front() {
            if visited.contains(&task_id) {
                continue;
            }
            visited.insert(task_id.clone());

            if task_id.package() == ROOT_PKG_NAME
                && !self.is_single_package
                && !self
                    .root_enabled_tasks
                    .contains(&task_id.as_non_workspace_task_name().into_owned())
            {
                return Err(BuilderError::MissingRootTask {
                    task_id: task_id.to_string(),
                    task_name: task_id.task().to_string(),
                });
            }

            let package_name = PackageName::from(task_id.package());
            if self.package_graph.package_info(&package_name).is_none() {
                return Err(BuilderError::MissingPackageFromTask {
                    package: task_id.package().to_string(),
                    task_id: task_id.to_string(),
                });
            }

            let task_definition = self.resolve_task_definition(&task_id)?;

            let mut has_deps = false;

            // `^task` fans out over the direct workspace dependencies that
            // declare the task; packages without it are skipped.
            for (topo_dep, dep_node) in task_definition
                .topological_dependencies
                .iter()
                .cartesian_product(
                    self.package_graph
                        .immediate_dependencies(&PackageNode::Workspace(package_name.clone()))
                        .iter()
                        .flatten(),
                )
            {
                let PackageNode::Workspace(dep_package) = dep_node else {
                    continue;
                };
                let dep_package = (*dep_package).clone();
                if !self.package_has_script(&dep_package, topo_dep.task()) {
                    continue;
                }
                let dep_task_id =
                    TaskId::from_owned(dep_package.as_str().to_string(), topo_dep.task().to_string());
                if let Some(allowed) = &allowed_tasks {
                    if !allowed.contains(&dep_task_id) {
                        continue;
                    }
                }
                has_deps = true;
                engine.add_dependency(&task_id, &dep_task_id);
                traversal_queue.push_back(dep_task_id);
            }

            // Same-package and cross-package (`pkg#task`) dependencies.
            for dep in &task_definition.task_dependencies {
                let dep_task_id = dep.task_id_for_package(task_id.package());
                if let Some(allowed) = &allowed_tasks {
                    if !allowed.contains(&dep_task_id) {
                        continue;
                    }
                }
                if dep.is_package_qualified() && dep_task_id.package() != ROOT_PKG_NAME {
                    // An explicit pkg#task reference must resolve.
                    let dep_package = PackageName::from(dep_task_id.package());
                    if self.package_graph.package_info(&dep_package).is_none() {
                        return Err(BuilderError::MissingPackageFromTask {
                            package: dep_task_id.package().to_string(),
                            task_id: dep_task_id.to_string(),
                        });
                    }
                    if !self.package_has_script(&dep_package, dep_task_id.task()) {
                        return Err(BuilderError::MissingPackageTask {
                            task_id: dep_task_id.to_string(),
                            task_name: dep_task_id.task().to_string(),
                            package: dep_task_id.package().to_string(),
                        });
                    }
                } else if !dep.is_package_qualified()
                    && !self.package_has_script(&PackageName::from(task_id.package()), dep.task())
                {
                    // Same-package dependency on a script the package does
                    // not declare is skipped, mirroring `^task`.
                    continue;
                }
                has_deps = true;
                engine.add_dependency(&task_id, &dep_task_id);
                traversal_queue.push_back(dep_task_id);
            }

            engine.add_definition(task_id.clone(), task_definition);
            if !has_deps {
                engine.connect_to_root(&task_id);
            }
        }

        let engine = engine.seal();
        turborepo_graph_utils::validate_graph(&engine.task_graph)?;
        Ok(engine)
    }

    fn package_has_script(&self, package: &PackageName, task: &str) -> bool {
        if self.is_single_package && matches!(package, PackageName::Root) {
            return self
                .package_graph
                .package_json(package)
                .is_some_and(|json| json.scripts.contains_key(task));
        }
        match package {
            // Root scripts only run via explicit //# declarations, which are
            // checked separately.
            PackageName::Root => true,
            name => self
                .package_graph
                .package_json(name)
                .is_some_and(|json| json.scripts.contains_key(task)),
        }
    }

    /// Whether a definition for this task exists in the package's own config
    /// or the root config.
    fn has_task_definition(
        &self,
        workspace: &PackageName,
        task_name: &TaskName<'static>,
        task_id: &TaskId,
    ) -> Result<bool, BuilderError> {
        let bare_name = TaskName::from(task_name.task().to_string());
        if let Some(turbo_json) = self.turbo_json_loader.load(workspace)? {
            if turbo_json.has_task(task_id, &bare_name) {
                return Ok(true);
            }
        }
        if !matches!(workspace, PackageName::Root) {
            if let Some(root) = self.turbo_json_loader.load(&PackageName::Root)? {
                return Ok(root.has_task(task_id, &bare_name));
            }
        }
        Ok(false)
    }

    /// Merges the root definition with the package override, root first so
    /// the package wins field by field.
    fn resolve_task_definition(
        &self,
        task_id: &TaskId<'static>,
    ) -> Result<TaskDefinition, BuilderError> {
        let package_name = PackageName::from(task_id.package());
        let task_name = task_id.as_non_workspace_task_name().into_owned();

        let mut merged: Option<RawTaskDefinition> = None;
        if let Some(root) = self.turbo_json_loader.load(&PackageName::Root)? {
            if let Some(root_definition) = root.task(task_id, &task_name) {
                merged = Some(root_definition);
            }
        }
        if !matches!(package_name, PackageName::Root) {
            if let Some(package_json) = self.turbo_json_loader.load(&package_name)? {
                if let Some(package_definition) = package_json.task(task_id, &task_name) {
                    match &mut merged {
                        Some(base) => base.merge(package_definition),
                        None => merged = Some(package_definition),
                    }
                }
            }
        }

        let Some(raw) = merged else {
            return Err(BuilderError::MissingPackageTask {
                task_id: task_id.to_string(),
                task_name: task_id.task().to_string(),
                package: task_id.package().to_string(),
            });
        };

        let package_dir = self
            .package_graph
            .package_dir(&package_name)
            .expect("package presence checked before definition resolution");
        TaskDefinition::from_raw(raw, &path_to_repo_root(package_dir)).map_err(Into::into)
    }
}

/// The unix path from a package directory back up to the repo root, used to
/// resolve `$TURBO_ROOT$` tokens.
fn path_to_repo_root(package_dir: &AnchoredSystemPath) -> RelativeUnixPathBuf {
    let levels = package_dir.components().count();
    RelativeUnixPathBuf::new(vec![".."; levels].join("/"))
        .expect("dotdot segments are relative")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::{
        engine::TaskNode,
        package_json::PackageJson,
        turbo_json::{RawTurboJson, TurboJson},
    };

    fn turbo_json(value: serde_json::Value) -> TurboJson {
        let raw = RawTurboJson::parse(&value.to_string(), "turbo.json").unwrap();
        TurboJson::try_from(raw).unwrap()
    }

    fn package_json(scripts: &[&str], deps: &[&str]) -> PackageJson {
        PackageJson {
            name: None,
            scripts: scripts
                .iter()
                .map(|script| (script.to_string(), format!("echo {script}")))
                .collect(),
            dependencies: (!deps.is_empty()).then(|| {
                deps.iter()
                    .map(|dep| (dep.to_string(), "workspace:*".to_string()))
                    .collect()
            }),
            ..Default::default()
        }
    }

    fn mock_package_graph(
        repo_root: &AbsoluteSystemPathBuf,
        packages: &[(&str, &[&str], &[&str])],
    ) -> PackageGraph {
        let mut package_jsons = HashMap::new();
        for (name, scripts, deps) in packages {
            let mut json = package_json(scripts, deps);
            json.name = Some(name.to_string());
            let path = repo_root.join_components(&["packages", name, "package.json"]);
            package_jsons.insert(path, json);
        }
        PackageGraph::builder(repo_root, PackageJson::default())
            .with_package_jsons(Some(package_jsons))
            .build()
            .unwrap()
    }

    fn all_dependencies(engine: &Engine<Built>) -> HashMap<String, HashSet<String>> {
        engine
            .task_ids()
            .map(|task_id| {
                let deps = engine
                    .dependencies(task_id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|node| node.to_string())
                    .collect();
                (task_id.to_string(), deps)
            })
            .collect()
    }

    fn deps(pairs: &[(&str, &[&str])]) -> HashMap<String, HashSet<String>> {
        pairs
            .iter()
            .map(|(task, task_deps)| {
                (
                    task.to_string(),
                    task_deps.iter().map(|dep| dep.to_string()).collect(),
                )
            })
            .collect()
    }

    fn fixture() -> (tempfile::TempDir, AbsoluteSystemPathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_topological_expansion() -> Result<()> {
        let (_dir, repo_root) = fixture();
        let package_graph = mock_package_graph(
            &repo_root,
            &[
                ("app", &["build", "test"], &["ui", "util"]),
                ("ui", &["build"], &["util"]),
                ("util", &["build"], &[]),
            ],
        );
        let loader = TurboJsonLoader::noop(
            vec![(
                PackageName::Root,
                turbo_json(json!({
                    "tasks": {
                        "build": { "dependsOn": ["^build"] },
                        "test": { "dependsOn": ["^build"] },
                    }
                })),
            )]
            .into_iter()
            .collect(),
        );

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(TaskName::from("test")))
            .with_workspaces(vec![
                PackageName::from("app"),
                PackageName::from("ui"),
                PackageName::from("util"),
            ])
            .build()?;

        let expected = deps(&[
            ("app#test", &["ui#build", "util#build"]),
            ("ui#build", &["util#build"]),
            ("util#build", &["___ROOT___"]),
        ]);
        assert_eq!(all_dependencies(&engine), expected);
        Ok(())
    }

    #[test]
    fn test_package_without_script_is_skipped() -> Result<()> {
        let (_dir, repo_root) = fixture();
        let package_graph = mock_package_graph(
            &repo_root,
            &[
                ("app", &["build"], &["no-build-pkg"]),
                ("no-build-pkg", &["lint"], &[]),
            ],
        );
        let loader = TurboJsonLoader::noop(
            vec![(
                PackageName::Root,
                turbo_json(json!({
                    "tasks": { "build": { "dependsOn": ["^build"] } }
                })),
            )]
            .into_iter()
            .collect(),
        );

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(TaskName::from("build")))
            .with_workspaces(vec![
                PackageName::from("app"),
                PackageName::from("no-build-pkg"),
            ])
            .build()?;

        let expected = deps(&[("app#build", &["___ROOT___"])]);
        assert_eq!(all_dependencies(&engine), expected);
        Ok(())
    }

    #[test]
    fn test_explicit_package_task_dependency() -> Result<()> {
        let (_dir, repo_root) = fixture();
        let package_graph = mock_package_graph(
            &repo_root,
            &[
                ("app", &["special"], &["lib"]),
                ("lib", &["build"], &[]),
            ],
        );
        let loader = TurboJsonLoader::noop(
            vec![(
                PackageName::Root,
                turbo_json(json!({
                    "tasks": {
                        "build": {},
                        "app#special": { "dependsOn": ["lib#build"] },
                    }
                })),
            )]
            .into_iter()
            .collect(),
        );

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(TaskName::from("special")))
            .with_workspaces(vec![PackageName::from("app")])
            .build()?;

        let expected = deps(&[
            ("app#special", &["lib#build"]),
            ("lib#build", &["___ROOT___"]),
        ]);
        assert_eq!(all_dependencies(&engine), expected);
        Ok(())
    }

    #[test]
    fn test_missing_task_is_a_preparation_error() {
        let (_dir, repo_root) = fixture();
        let package_graph = mock_package_graph(&repo_root, &[("app", &["build"], &[])]);
        let loader = TurboJsonLoader::noop(
            vec![(
                PackageName::Root,
                turbo_json(json!({ "tasks": { "build": {} } })),
            )]
            .into_iter()
            .collect(),
        );

        let result = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(vec![TaskName::from("build"), TaskName::from("deploy")])
            .with_workspaces(vec![PackageName::from("app")])
            .build();

        match result {
            Err(BuilderError::MissingTasks(missing)) => assert_eq!(missing, "deploy"),
            other => panic!("expected missing task error, got {other:?}"),
        }
    }

    #[test]
    fn test_tasks_only_drops_dependency_edges() -> Result<()> {
        let (_dir, repo_root) = fixture();
        let package_graph = mock_package_graph(
            &repo_root,
            &[
                ("app", &["build", "prepare"], &["lib"]),
                ("lib", &["build", "prepare"], &[]),
            ],
        );
        let loader = TurboJsonLoader::noop(
            vec![(
                PackageName::Root,
                turbo_json(json!({
                    "tasks": {
                        "build": { "dependsOn": ["^build", "prepare"] },
                        "prepare": {},
                    }
                })),
            )]
            .into_iter()
            .collect(),
        );

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks_only(true)
            .with_tasks(Some(TaskName::from("build")))
            .with_workspaces(vec![PackageName::from("app")])
            .build()?;

        let expected = deps(&[("app#build", &["___ROOT___"])]);
        assert_eq!(all_dependencies(&engine), expected);
        Ok(())
    }

    #[test]
    fn test_root_task_requires_explicit_declaration() -> Result<()> {
        let (_dir, repo_root) = fixture();
        let package_graph = mock_package_graph(&repo_root, &[("app", &["build"], &[])]);
        let loader = TurboJsonLoader::noop(
            vec![(
                PackageName::Root,
                turbo_json(json!({
                    "tasks": {
                        "build": {},
                        "//#format": {},
                    }
                })),
            )]
            .into_iter()
            .collect(),
        );

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(vec![TaskName::from("build"), TaskName::from("format")])
            .with_workspaces(vec![PackageName::Root, PackageName::from("app")])
            .with_root_tasks(vec![TaskName::from("//#format")])
            .build()?;

        let expected = deps(&[
            ("app#build", &["___ROOT___"]),
            ("//#format", &["___ROOT___"]),
        ]);
        assert_eq!(all_dependencies(&engine), expected);
        Ok(())
    }

    #[test]
    fn test_cycle_is_rejected() {
        let (_dir, repo_root) = fixture();
        let package_graph = mock_package_graph(&repo_root, &[("app", &["one", "two"], &[])]);
        let loader = TurboJsonLoader::noop(
            vec![(
                PackageName::Root,
                turbo_json(json!({
                    "tasks": {
                        "one": { "dependsOn": ["two"] },
                        "two": { "dependsOn": ["one"] },
                    }
                })),
            )]
            .into_iter()
            .collect(),
        );

        let result = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(TaskName::from("one")))
            .with_workspaces(vec![PackageName::from("app")])
            .build();

        assert!(matches!(result, Err(BuilderError::Graph(_))), "{result:?}");
    }

    #[test]
    fn test_package_turbo_json_overrides_root() -> Result<()> {
        let (_dir, repo_root) = fixture();
        let package_graph = mock_package_graph(&repo_root, &[("app", &["build"], &[])]);
        let loader = TurboJsonLoader::noop(
            vec![
                (
                    PackageName::Root,
                    turbo_json(json!({
                        "tasks": { "build": { "outputs": ["dist/**"] } }
                    })),
                ),
                (
                    PackageName::from("app"),
                    turbo_json(json!({
                        "extends": ["//"],
                        "tasks": { "build": { "outputs": ["build/**"] } }
                    })),
                ),
            ]
            .into_iter()
            .collect(),
        );

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(TaskName::from("build")))
            .with_workspaces(vec![PackageName::from("app")])
            .build()?;

        let app_build = TaskId::new("app", "build").into_owned();
        let definition = engine.task_definition(&app_build).unwrap();
        assert_eq!(definition.outputs.inclusions, vec!["build/**".to_string()]);
        Ok(())
    }

    #[test]
    fn test_engine_validate_persistent_dependency() -> Result<()> {
        let (_dir, repo_root) = fixture();
        let package_graph = mock_package_graph(
            &repo_root,
            &[("app", &["build", "dev"], &[])],
        );
        let loader = TurboJsonLoader::noop(
            vec![(
                PackageName::Root,
                turbo_json(json!({
                    "tasks": {
                        "dev": { "persistent": true, "cache": false },
                        "build": { "dependsOn": ["dev"] },
                    }
                })),
            )]
            .into_iter()
            .collect(),
        );

        let engine = EngineBuilder::new(&package_graph, &loader, false)
            .with_tasks(Some(TaskName::from("build")))
            .with_workspaces(vec![PackageName::from("app")])
            .build()?;

        let errors = engine.validate(&package_graph, 10).unwrap_err();
        assert!(errors.iter().any(|error| matches!(
            error,
            crate::engine::ValidateError::DependencyOnPersistentTask { .. }
        )));
        Ok(())
    }

    #[test]
    fn test_graph_node_is_task_node() {
        let node = TaskNode::from(TaskId::new("app", "build").into_owned());
        assert_eq!(node.to_string(), "app#build");
    }
}
