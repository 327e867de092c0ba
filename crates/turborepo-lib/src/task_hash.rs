use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, RelativeUnixPathBuf};
use turborepo_env::{EnvironmentVariableMap, EnvironmentVariablePairs};
use turborepo_globwalk::{globwalk, WalkType};
use turborepo_hash::TurboHash;
use turborepo_lockfiles::Package;

use crate::{
    cli::EnvMode,
    engine::{Engine, TaskNode},
    package_graph::{PackageGraph, PackageName},
    task_id::TaskId,
    turbo_json::TaskDefinition,
};

/// Env vars the child process keeps even in strict mode.
const STRICT_ENV_ALLOWLIST: &[&str] = &["PATH", "SHELL", "SYSTEMROOT"];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Hash(#[from] turborepo_hash::Error),
    #[error(transparent)]
    Env(#[from] turborepo_env::Error),
    #[error(transparent)]
    Walk(#[from] turborepo_globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    Lockfile(#[from] turborepo_lockfiles::Error),
    #[error("missing package.json for {0}")]
    MissingPackageJson(String),
}

/// Sorted map of package-relative unix path to content hash. This is the
/// `hash_of_files` input to a task hash.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct FileHashes(pub HashMap<RelativeUnixPathBuf, String>);

#[derive(Debug, Serialize)]
struct LockfilePackages<'a>(&'a [Package]);

/// The inputs of one task hash: the canonical serialization of this struct
/// is the hash input. The whole resolved task definition participates, so
/// flipping `cache`, editing `outputs`, or changing `outputMode` all
/// invalidate the cache entry.
#[derive(Debug, Serialize)]
struct TaskHashable<'a> {
    global_hash: &'a str,
    hash_of_files: &'a str,
    external_deps_hash: String,
    task_definition: &'a TaskDefinition,
    resolved_env_vars: EnvironmentVariablePairs,
    task_dependency_hashes: Vec<String>,
    pass_through_args: &'a [String],
    package_dir: &'a str,
    task: String,
    env_mode: EnvMode,
}

/// Per-task hashes of enumerated input files, computed up front for every
/// task in the engine.
#[derive(Debug, Default)]
pub struct PackageInputsHashes {
    pub hashes: HashMap<TaskId<'static>, String>,
    pub expanded_hashes: HashMap<TaskId<'static>, FileHashes>,
}

impl PackageInputsHashes {
    /// Walks each task's input globs (or the default file set) and hashes
    /// every matched file.
    pub fn calculate_file_hashes(
        repo_root: &AbsoluteSystemPath,
        engine: &Engine,
        package_graph: &PackageGraph,
    ) -> Result<PackageInputsHashes, Error> {
        let mut hashes = HashMap::new();
        let mut expanded_hashes = HashMap::new();

        for task_id in engine.task_ids() {
            let Some(definition) = engine.task_definition(task_id) else {
                continue;
            };
            let package_name = PackageName::from(task_id.package());
            let package_dir = package_graph
                .package_dir(&package_name)
                .ok_or_else(|| Error::MissingPackageJson(package_name.to_string()))?;
            let package_root = repo_root.resolve(&package_dir.to_owned());

            let files = enumerate_inputs(&package_root, &definition.inputs)?;

            let mut file_hashes = HashMap::new();
            for file in files {
                let hash = turborepo_hash::hash_file(&file)?;
                let relative = package_root.anchor(&file)?.to_unix();
                file_hashes.insert(relative, hash);
            }

            let expanded = FileHashes(file_hashes);
            let hash = expanded.hash();
            debug!("package inputs hash for {task_id}: {hash}");
            hashes.insert(task_id.clone(), hash);
            expanded_hashes.insert(task_id.clone(), expanded);
        }

        Ok(PackageInputsHashes {
            hashes,
            expanded_hashes,
        })
    }
}

/// Enumerates a task's input files beneath the package directory.
///
/// With explicit inputs this is a plain glob walk. With the default set
/// (empty inputs or `$TURBO_DEFAULT$`), every non-ignored file in the
/// package is taken first and the user's negations are applied to that
/// expanded set.
fn enumerate_inputs(
    package_root: &AbsoluteSystemPath,
    inputs: &crate::turbo_json::TaskInputs,
) -> Result<Vec<turbopath::AbsoluteSystemPathBuf>, Error> {
    let (positive, negative): (Vec<String>, Vec<String>) = {
        let mut positive = Vec::new();
        let mut negative = Vec::new();
        for glob in &inputs.globs {
            if let Some(stripped) = glob.strip_prefix('!') {
                negative.push(stripped.to_string());
            } else {
                positive.push(glob.clone());
            }
        }
        (positive, negative)
    };

    if inputs.uses_default_set() {
        let exclusions = turborepo_globwalk::GlobSet::new(&[], &negative)?;
        let mut files = Vec::new();
        let walker = ignore::WalkBuilder::new(package_root.as_std_path())
            .hidden(false)
            .require_git(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .filter_entry(|entry| {
                entry.file_name().to_str() != Some(".git")
                    && entry.file_name().to_str() != Some("node_modules")
                    && entry.file_name().to_str() != Some(".turbo")
            })
            .build();
        for entry in walker {
            let entry = entry.map_err(|err| {
                Error::Path(turbopath::PathError::IO(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    err,
                )))
            })?;
            if !entry.file_type().is_some_and(|file_type| file_type.is_file()) {
                continue;
            }
            let path = turbopath::AbsoluteSystemPathBuf::try_from(entry.path())?;
            let relative = package_root.anchor(&path)?.to_unix();
            if exclusions.matches(&relative) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    } else {
        let mut files = globwalk(package_root, &positive, &negative, WalkType::Files)?;
        // The manifest always participates, even when inputs are narrowed.
        let package_json = package_root.join_component("package.json");
        if package_json.exists() && !files.contains(&package_json) {
            files.push(package_json);
        }
        let turbo_json = package_root.join_component("turbo.json");
        if turbo_json.exists() && !files.contains(&turbo_json) {
            files.push(turbo_json);
        }
        files.sort();
        Ok(files)
    }
}

/// Hashes recorded while the run progresses, so dependent tasks and the run
/// summary can look them up.
#[derive(Debug, Default, Clone)]
pub struct TaskHashTracker {
    state: Arc<Mutex<TaskHashTrackerState>>,
}

#[derive(Debug, Default)]
struct TaskHashTrackerState {
    task_hashes: HashMap<TaskId<'static>, String>,
    env_vars: HashMap<TaskId<'static>, EnvironmentVariableMap>,
}

impl TaskHashTracker {
    pub fn hash(&self, task_id: &TaskId<'static>) -> Option<String> {
        let state = self.state.lock().expect("hash tracker lock");
        state.task_hashes.get(task_id).cloned()
    }

    pub fn insert_hash(&self, task_id: TaskId<'static>, hash: String) {
        let mut state = self.state.lock().expect("hash tracker lock");
        state.task_hashes.insert(task_id, hash);
    }

    pub fn env_vars(&self, task_id: &TaskId<'static>) -> Option<EnvironmentVariableMap> {
        let state = self.state.lock().expect("hash tracker lock");
        state.env_vars.get(task_id).cloned()
    }

    fn insert_env_vars(&self, task_id: TaskId<'static>, env_vars: EnvironmentVariableMap) {
        let mut state = self.state.lock().expect("hash tracker lock");
        state.env_vars.insert(task_id, env_vars);
    }
}

/// Computes task hashes, combining the global hash, per-package file hashes,
/// external dependencies, the resolved definition, env var values, upstream
/// hashes, and pass-through arguments.
pub struct TaskHasher<'a> {
    package_graph: &'a PackageGraph,
    package_inputs_hashes: PackageInputsHashes,
    env_at_execution_start: &'a EnvironmentVariableMap,
    global_hash: &'a str,
    global_env_mode: EnvMode,
    global_pass_through_env: Option<&'a [String]>,
    pass_through_args: &'a [String],
    task_hash_tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        package_graph: &'a PackageGraph,
        package_inputs_hashes: PackageInputsHashes,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
        global_env_mode: EnvMode,
        global_pass_through_env: Option<&'a [String]>,
        pass_through_args: &'a [String],
    ) -> Self {
        Self {
            package_graph,
            package_inputs_hashes,
            env_at_execution_start,
            global_hash,
            global_env_mode,
            global_pass_through_env,
            pass_through_args,
            task_hash_tracker: TaskHashTracker::default(),
        }
    }

    pub fn task_hash_tracker(&self) -> TaskHashTracker {
        self.task_hash_tracker.clone()
    }

    /// The env mode a task actually runs under. `infer` becomes strict as
    /// soon as any pass-through configuration exists, loose otherwise.
    pub fn resolve_env_mode(&self, task_definition: &TaskDefinition) -> EnvMode {
        match self.global_env_mode {
            EnvMode::Infer => {
                if task_definition.pass_through_env.is_some()
                    || self.global_pass_through_env.is_some()
                {
                    warn!("env mode was inferred as strict because passThroughEnv is configured");
                    EnvMode::Strict
                } else {
                    EnvMode::Loose
                }
            }
            mode => mode,
        }
    }

    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId<'static>,
        task_definition: &TaskDefinition,
        dependency_hashes: Vec<String>,
    ) -> Result<String, Error> {
        let hash_of_files = self
            .package_inputs_hashes
            .hashes
            .get(task_id)
            .map(String::as_str)
            .unwrap_or_default();

        let package_name = PackageName::from(task_id.package());
        let package_dir = self
            .package_graph
            .package_dir(&package_name)
            .ok_or_else(|| Error::MissingPackageJson(package_name.to_string()))?
            .to_unix();

        let external_deps_hash = self.external_deps_hash(package_dir.as_str())?;

        let env_vars = self
            .env_at_execution_start
            .from_wildcards(&task_definition.env)?;
        self.task_hash_tracker
            .insert_env_vars(task_id.clone(), env_vars.clone());

        let mut task_dependency_hashes = dependency_hashes;
        task_dependency_hashes.sort();

        let env_mode = self.resolve_env_mode(task_definition);

        let task_hashable = TaskHashable {
            global_hash: self.global_hash,
            hash_of_files,
            external_deps_hash,
            task_definition,
            resolved_env_vars: env_vars.to_hashable(),
            task_dependency_hashes,
            pass_through_args: self.pass_through_args,
            package_dir: package_dir.as_str(),
            task: task_id.to_string(),
            env_mode,
        };

        let hash = task_hashable.hash();
        self.task_hash_tracker
            .insert_hash(task_id.clone(), hash.clone());
        Ok(hash)
    }

    fn external_deps_hash(&self, package_dir: &str) -> Result<String, Error> {
        let Some(lockfile) = self.package_graph.lockfile() else {
            return Ok(String::new());
        };
        let mut packages = lockfile.external_packages(package_dir)?;
        packages.sort();
        Ok(LockfilePackages(&packages).hash())
    }

    /// Direct dependency hashes for a task, in sorted order. The root node
    /// contributes nothing.
    pub fn dependency_hashes(&self, engine: &Engine, task_id: &TaskId<'static>) -> Vec<String> {
        let mut hashes: Vec<String> = engine
            .dependencies(task_id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|node| match node {
                TaskNode::Root => None,
                TaskNode::Task(dep_id) => self.task_hash_tracker.hash(dep_id),
            })
            .collect();
        hashes.sort();
        hashes
    }

    /// The environment handed to a task's child process.
    pub fn task_env(
        &self,
        task_definition: &TaskDefinition,
        task_hash: &str,
    ) -> Result<EnvironmentVariableMap, Error> {
        let env_mode = self.resolve_env_mode(task_definition);
        let mut child_env = match env_mode {
            EnvMode::Loose | EnvMode::Infer => self.env_at_execution_start.clone(),
            EnvMode::Strict => {
                let mut patterns: Vec<String> = STRICT_ENV_ALLOWLIST
                    .iter()
                    .map(|name| name.to_string())
                    .collect();
                patterns.extend(task_definition.env.iter().cloned());
                if let Some(pass_through) = &task_definition.pass_through_env {
                    patterns.extend(pass_through.iter().cloned());
                }
                if let Some(global_pass_through) = self.global_pass_through_env {
                    patterns.extend(global_pass_through.iter().cloned());
                }
                self.env_at_execution_start.from_wildcards(&patterns)?
            }
        };
        child_env.insert("TURBO_HASH".to_string(), task_hash.to_string());
        Ok(child_env)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use anyhow::Result;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::{engine::Building, package_json::PackageJson};

    fn tracker_smoke_test() -> TaskHashTracker {
        TaskHashTracker::default()
    }

    #[test]
    fn test_hash_tracker_is_send_and_sync() {
        // Multiple tasks query and update the tracker concurrently.
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<TaskHashTracker>();
        assert_sync::<TaskHashTracker>();
        let _ = tracker_smoke_test();
    }

    fn single_package_fixture() -> Result<(
        tempfile::TempDir,
        AbsoluteSystemPathBuf,
        PackageGraph,
        Engine,
    )> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        repo_root
            .join_component("package.json")
            .create_with_contents(r#"{"scripts": {"build": "echo build"}}"#)?;
        repo_root
            .join_component("index.js")
            .create_with_contents("console.log('hi')")?;

        let root_package_json = PackageJson::load(&repo_root.join_component("package.json"))?;
        let package_graph = PackageGraph::builder(&repo_root, root_package_json)
            .with_single_package_mode(true)
            .build()?;

        let mut engine: Engine<Building> = Engine::new();
        let task = TaskId::new("//", "build").into_owned();
        engine.add_definition(task.clone(), TaskDefinition::default());
        engine.connect_to_root(&task);
        let engine = engine.seal();

        Ok((dir, repo_root, package_graph, engine))
    }

    #[test]
    fn test_package_inputs_hash_changes_with_content() -> Result<()> {
        let (_dir, repo_root, package_graph, engine) = single_package_fixture()?;

        let before =
            PackageInputsHashes::calculate_file_hashes(&repo_root, &engine, &package_graph)?;
        let again =
            PackageInputsHashes::calculate_file_hashes(&repo_root, &engine, &package_graph)?;
        let task = TaskId::new("//", "build").into_owned();
        assert_eq!(before.hashes[&task], again.hashes[&task]);

        repo_root
            .join_component("index.js")
            .create_with_contents("console.log('changed')")?;
        let after =
            PackageInputsHashes::calculate_file_hashes(&repo_root, &engine, &package_graph)?;
        assert_ne!(before.hashes[&task], after.hashes[&task]);
        Ok(())
    }

    #[test]
    fn test_task_hash_is_deterministic_and_sensitive() -> Result<()> {
        let (_dir, _repo_root, package_graph, _engine) = single_package_fixture()?;
        let env = EnvironmentVariableMap::default();
        let task = TaskId::new("//", "build").into_owned();
        let definition = TaskDefinition::default();

        let hasher = TaskHasher::new(
            &package_graph,
            PackageInputsHashes::default(),
            &env,
            "global-hash",
            EnvMode::Loose,
            None,
            &[],
        );
        let first = hasher.calculate_task_hash(&task, &definition, vec![])?;
        let second = hasher.calculate_task_hash(&task, &definition, vec![])?;
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        // A different global hash changes the task hash.
        let other_hasher = TaskHasher::new(
            &package_graph,
            PackageInputsHashes::default(),
            &env,
            "other-global-hash",
            EnvMode::Loose,
            None,
            &[],
        );
        let third = other_hasher.calculate_task_hash(&task, &definition, vec![])?;
        assert_ne!(first, third);

        // Upstream hashes participate in order-independent form.
        let with_deps = hasher.calculate_task_hash(
            &task,
            &definition,
            vec!["b".repeat(64), "a".repeat(64)],
        )?;
        let with_deps_reordered = hasher.calculate_task_hash(
            &task,
            &definition,
            vec!["a".repeat(64), "b".repeat(64)],
        )?;
        assert_eq!(with_deps, with_deps_reordered);
        assert_ne!(first, with_deps);
        Ok(())
    }

    #[test]
    fn test_resolved_definition_changes_invalidate() -> Result<()> {
        let (_dir, _repo_root, package_graph, _engine) = single_package_fixture()?;
        let env = EnvironmentVariableMap::default();
        let task = TaskId::new("//", "build").into_owned();
        let hasher = TaskHasher::new(
            &package_graph,
            PackageInputsHashes::default(),
            &env,
            "global",
            EnvMode::Loose,
            None,
            &[],
        );
        let hash_of = |definition: &TaskDefinition| -> Result<String> {
            Ok(hasher.calculate_task_hash(&task, definition, vec![])?)
        };

        let base = hash_of(&TaskDefinition::default())?;
        let uncached = hash_of(&TaskDefinition {
            cache: false,
            ..Default::default()
        })?;
        let new_outputs = hash_of(&TaskDefinition {
            outputs: crate::turbo_json::TaskOutputs {
                inclusions: vec!["dist/**".to_string()],
                exclusions: vec![],
            },
            ..Default::default()
        })?;
        let quieter = hash_of(&TaskDefinition {
            output_logs: crate::cli::OutputLogsMode::HashOnly,
            ..Default::default()
        })?;

        assert_ne!(base, uncached);
        assert_ne!(base, new_outputs);
        assert_ne!(base, quieter);
        Ok(())
    }

    #[test]
    fn test_env_values_change_hash() -> Result<()> {
        let (_dir, _repo_root, package_graph, _engine) = single_package_fixture()?;
        let task = TaskId::new("//", "build").into_owned();
        let definition = TaskDefinition {
            env: vec!["NODE_ENV".to_string()],
            ..Default::default()
        };

        let mut production = StdHashMap::new();
        production.insert("NODE_ENV".to_string(), "production".to_string());
        let production = EnvironmentVariableMap::from(production);

        let mut development = StdHashMap::new();
        development.insert("NODE_ENV".to_string(), "development".to_string());
        let development = EnvironmentVariableMap::from(development);

        let hash_with = |env: &EnvironmentVariableMap| -> Result<String> {
            let hasher = TaskHasher::new(
                &package_graph,
                PackageInputsHashes::default(),
                env,
                "global",
                EnvMode::Loose,
                None,
                &[],
            );
            Ok(hasher.calculate_task_hash(&task, &definition, vec![])?)
        };

        assert_ne!(hash_with(&production)?, hash_with(&development)?);
        Ok(())
    }

    #[test]
    fn test_strict_env_drops_undeclared() -> Result<()> {
        let (_dir, _repo_root, package_graph, _engine) = single_package_fixture()?;
        let mut env = StdHashMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("OTHER_VAR".to_string(), "value".to_string());
        env.insert("DECLARED".to_string(), "declared".to_string());
        let env = EnvironmentVariableMap::from(env);

        let definition = TaskDefinition {
            env: vec!["DECLARED".to_string()],
            ..Default::default()
        };

        let hasher = TaskHasher::new(
            &package_graph,
            PackageInputsHashes::default(),
            &env,
            "global",
            EnvMode::Strict,
            None,
            &[],
        );
        let child_env = hasher.task_env(&definition, "hash")?;
        assert!(child_env.contains_key("PATH"));
        assert!(child_env.contains_key("DECLARED"));
        assert!(!child_env.contains_key("OTHER_VAR"));
        assert_eq!(child_env.get("TURBO_HASH").map(String::as_str), Some("hash"));

        let loose_hasher = TaskHasher::new(
            &package_graph,
            PackageInputsHashes::default(),
            &env,
            "global",
            EnvMode::Loose,
            None,
            &[],
        );
        let child_env = loose_hasher.task_env(&definition, "hash")?;
        assert!(child_env.contains_key("OTHER_VAR"));
        Ok(())
    }

    #[test]
    fn test_infer_env_mode() {
        let (_dir, _repo_root, package_graph, _engine) = single_package_fixture().unwrap();
        let env = EnvironmentVariableMap::default();
        let hasher = TaskHasher::new(
            &package_graph,
            PackageInputsHashes::default(),
            &env,
            "global",
            EnvMode::Infer,
            None,
            &[],
        );

        let plain = TaskDefinition::default();
        assert_eq!(hasher.resolve_env_mode(&plain), EnvMode::Loose);

        let with_pass_through = TaskDefinition {
            pass_through_env: Some(vec!["CI".to_string()]),
            ..Default::default()
        };
        assert_eq!(
            hasher.resolve_env_mode(&with_pass_through),
            EnvMode::Strict
        );
    }

    #[test]
    fn test_default_inputs_respect_gitignore() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        repo_root
            .join_component(".gitignore")
            .create_with_contents("dist/\n")?;
        repo_root
            .join_component("kept.js")
            .create_with_contents("kept")?;
        repo_root.join_component("dist").create_dir_all()?;
        repo_root
            .join_components(&["dist", "ignored.js"])
            .create_with_contents("ignored")?;

        let files = enumerate_inputs(&repo_root, &crate::turbo_json::TaskInputs::default())?;
        let names: Vec<_> = files
            .iter()
            .map(|file| repo_root.anchor(file).unwrap().to_unix().as_str().to_string())
            .collect();
        assert!(names.contains(&"kept.js".to_string()));
        assert!(names.contains(&".gitignore".to_string()));
        assert!(!names.iter().any(|name| name.starts_with("dist/")), "{names:?}");
        Ok(())
    }
}
