use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, RelativeUnixPath, RelativeUnixPathBuf};
use turborepo_cache::RemoteCacheOpts;

use crate::{
    cli::OutputLogsMode,
    package_graph::PackageName,
    task_id::{TaskId, TaskName},
};

pub const CONFIG_FILE: &str = "turbo.json";
pub const CONFIG_FILE_JSONC: &str = "turbo.jsonc";

/// Token in `inputs`/`outputs` globs that anchors the glob at the repo root
/// instead of the package directory.
pub const TURBO_ROOT: &str = "$TURBO_ROOT$";
/// Sentinel in `inputs` that expands to the package's default file set.
pub const TURBO_DEFAULT: &str = "$TURBO_DEFAULT$";
const TOPOLOGICAL_PIPELINE_DELIMITER: &str = "^";
const ENV_PIPELINE_DELIMITER: &str = "$";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {0}: {1}")]
    Io(AbsoluteSystemPathBuf, std::io::Error),
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error(
        "Found both turbo.json and turbo.jsonc in {0}. Remove either one so there is no ambiguity."
    )]
    MultipleTurboConfigs(String),
    #[error("could not find turbo.json or turbo.jsonc in {0}")]
    NoTurboJson(String),
    #[error(
        "Invalid env prefix in \"{value}\". Use \"env\" and \"globalEnv\" instead of $-prefixed \
         dependencies."
    )]
    InvalidEnvPrefix { value: String },
    #[error("interactive tasks must be marked \"cache\": false ({task})")]
    InteractiveNoCacheable { task: String },
    #[error("package turbo.json may only extend from the root workspace (\"//\"), found {0}")]
    ExtendFromNonRoot(String),
    #[error("{TURBO_ROOT} must be used at the start of a glob: {0}")]
    InvalidTurboRootUse(String),
}

/// Output globs split into inclusive and `!`-prefixed exclusive patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

/// Input globs, with the `$TURBO_DEFAULT$` sentinel pulled out. Negations
/// apply to the expanded default set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskInputs {
    pub globs: Vec<String>,
    pub default: bool,
}

impl TaskInputs {
    /// Empty inputs mean "all tracked files in the package directory".
    pub fn uses_default_set(&self) -> bool {
        self.default || self.globs.iter().all(|glob| glob.starts_with('!'))
    }
}

/// The fully merged definition of one task in one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub outputs: TaskOutputs,
    pub cache: bool,
    /// `^task` entries, run in every direct workspace dependency.
    pub topological_dependencies: Vec<TaskName<'static>>,
    /// Same-package or `pkg#task` entries.
    pub task_dependencies: Vec<TaskName<'static>>,
    pub inputs: TaskInputs,
    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
    pub output_logs: OutputLogsMode,
    pub persistent: bool,
    pub interactive: bool,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            outputs: TaskOutputs::default(),
            cache: true,
            topological_dependencies: Vec::new(),
            task_dependencies: Vec::new(),
            inputs: TaskInputs::default(),
            env: Vec::new(),
            pass_through_env: None,
            output_logs: OutputLogsMode::default(),
            persistent: false,
            interactive: false,
        }
    }
}

impl TaskDefinition {
    /// Whether results may be read from or written to the cache at all.
    pub fn cacheable(&self) -> bool {
        self.cache && !self.persistent && !self.interactive
    }

    pub fn from_raw(
        mut raw: RawTaskDefinition,
        path_to_repo_root: &RelativeUnixPath,
    ) -> Result<TaskDefinition, Error> {
        let mut outputs = TaskOutputs::default();
        for glob in raw.outputs.take().unwrap_or_default() {
            if let Some(exclusion) = glob.strip_prefix('!') {
                outputs
                    .exclusions
                    .push(replace_turbo_root(exclusion, path_to_repo_root)?);
            } else {
                outputs
                    .inclusions
                    .push(replace_turbo_root(&glob, path_to_repo_root)?);
            }
        }
        outputs.inclusions.sort();
        outputs.exclusions.sort();

        let cache = raw.cache.unwrap_or(true);
        let interactive = raw.interactive.unwrap_or_default();
        if interactive && cache {
            return Err(Error::InteractiveNoCacheable {
                task: "interactive".to_string(),
            });
        }

        let mut topological_dependencies = Vec::new();
        let mut task_dependencies = Vec::new();
        for depends_on in raw.depends_on.take().unwrap_or_default() {
            if let Some(topological) = depends_on.strip_prefix(TOPOLOGICAL_PIPELINE_DELIMITER) {
                topological_dependencies.push(TaskName::from(topological.to_string()));
            } else if depends_on.starts_with(ENV_PIPELINE_DELIMITER) {
                return Err(Error::InvalidEnvPrefix { value: depends_on });
            } else {
                task_dependencies.push(TaskName::from(depends_on));
            }
        }
        task_dependencies.sort();
        topological_dependencies.sort();

        let mut env = Vec::new();
        for var in raw.env.take().unwrap_or_default() {
            if var.starts_with(ENV_PIPELINE_DELIMITER) {
                return Err(Error::InvalidEnvPrefix { value: var });
            }
            env.push(var);
        }
        env.sort();

        let pass_through_env = raw
            .pass_through_env
            .take()
            .map(|vars| {
                let mut vars = vars;
                vars.sort();
                vars
            });

        let mut inputs = TaskInputs::default();
        for glob in raw.inputs.take().unwrap_or_default() {
            if glob == TURBO_DEFAULT {
                inputs.default = true;
                continue;
            }
            if let Some(exclusion) = glob.strip_prefix('!') {
                inputs
                    .globs
                    .push(format!("!{}", replace_turbo_root(exclusion, path_to_repo_root)?));
            } else {
                inputs.globs.push(replace_turbo_root(&glob, path_to_repo_root)?);
            }
        }

        Ok(TaskDefinition {
            outputs,
            cache,
            topological_dependencies,
            task_dependencies,
            inputs,
            env,
            pass_through_env,
            output_logs: raw.output_logs.unwrap_or_default(),
            persistent: raw.persistent.unwrap_or_default(),
            interactive,
        })
    }

    /// Output globs made repo-relative by prefixing the package directory.
    pub fn repo_relative_hashable_outputs(
        &self,
        task_id: &TaskId,
        package_dir: &RelativeUnixPath,
    ) -> TaskOutputs {
        let make_repo_relative = |glob: &str| {
            if package_dir.as_str().is_empty() {
                glob.to_string()
            } else {
                format!("{}/{glob}", package_dir.as_str().trim_end_matches('/'))
            }
        };

        let mut inclusions: Vec<String> = self
            .outputs
            .inclusions
            .iter()
            .map(|glob| make_repo_relative(glob))
            .collect();
        // The captured log is part of every cached artifact.
        inclusions.push(make_repo_relative(&format!(
            ".turbo/turbo-{}.log",
            task_id.task()
        )));
        inclusions.sort();

        let exclusions = self
            .outputs
            .exclusions
            .iter()
            .map(|glob| make_repo_relative(glob))
            .collect();

        TaskOutputs {
            inclusions,
            exclusions,
        }
    }
}

fn replace_turbo_root(glob: &str, path_to_repo_root: &RelativeUnixPath) -> Result<String, Error> {
    match glob.find(TURBO_ROOT) {
        None => Ok(glob.to_string()),
        Some(0) => {
            let rest = glob[TURBO_ROOT.len()..].trim_start_matches('/');
            Ok(path_to_repo_root
                .join(RelativeUnixPath::new(rest).map_err(|_| Error::InvalidTurboRootUse(glob.to_string()))?)
                .into_string())
        }
        Some(_) => Err(Error::InvalidTurboRootUse(glob.to_string())),
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawTaskDefinition {
    pub cache: Option<bool>,
    pub depends_on: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub inputs: Option<Vec<String>>,
    pub pass_through_env: Option<Vec<String>>,
    pub persistent: Option<bool>,
    pub interactive: Option<bool>,
    pub outputs: Option<Vec<String>>,
    #[serde(alias = "outputMode")]
    pub output_logs: Option<OutputLogsMode>,
}

impl RawTaskDefinition {
    /// Field-wise merge where `other` wins; used to apply a package override
    /// on top of the root definition.
    pub fn merge(&mut self, other: RawTaskDefinition) {
        macro_rules! set_field {
            ($this:ident, $other:ident, $field:ident) => {{
                if let Some(value) = $other.$field {
                    $this.$field = Some(value);
                }
            }};
        }
        set_field!(self, other, cache);
        set_field!(self, other, depends_on);
        set_field!(self, other, env);
        set_field!(self, other, inputs);
        set_field!(self, other, pass_through_env);
        set_field!(self, other, persistent);
        set_field!(self, other, interactive);
        set_field!(self, other, outputs);
        set_field!(self, other, output_logs);
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawRemoteCacheOptions {
    pub enabled: Option<bool>,
    pub signature: Option<bool>,
    pub preflight: Option<bool>,
    pub timeout: Option<u64>,
}

impl From<&RawRemoteCacheOptions> for RemoteCacheOpts {
    fn from(raw: &RawRemoteCacheOptions) -> Self {
        RemoteCacheOpts {
            team_id: None,
            signature: raw.signature.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RawTurboJson {
    #[serde(rename = "$schema")]
    pub schema: Option<String>,
    pub extends: Option<Vec<String>>,
    pub global_dependencies: Option<Vec<String>>,
    pub global_env: Option<Vec<String>>,
    pub global_pass_through_env: Option<Vec<String>>,
    pub global_dot_env: Option<Vec<String>>,
    #[serde(alias = "pipeline")]
    pub tasks: Option<BTreeMap<String, RawTaskDefinition>>,
    pub remote_cache: Option<RawRemoteCacheOptions>,
    pub daemon: Option<bool>,
    pub ui: Option<String>,
}

impl RawTurboJson {
    pub fn parse(text: &str, path: &str) -> Result<RawTurboJson, Error> {
        let value = jsonc_parser::parse_to_serde_value(text, &Default::default())
            .map_err(|err| Error::Parse {
                path: path.to_string(),
                message: err.to_string(),
            })?
            .ok_or_else(|| Error::Parse {
                path: path.to_string(),
                message: "file is empty".to_string(),
            })?;
        serde_json::from_value(value).map_err(|err| Error::Parse {
            path: path.to_string(),
            message: err.to_string(),
        })
    }
}

/// A validated turbo.json, root or per-package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurboJson {
    pub extends: Vec<String>,
    pub global_deps: Vec<String>,
    pub global_env: Vec<String>,
    pub global_pass_through_env: Option<Vec<String>>,
    pub global_dot_env: Vec<RelativeUnixPathBuf>,
    pub tasks: BTreeMap<TaskName<'static>, RawTaskDefinition>,
    pub remote_cache: Option<RawRemoteCacheOptions>,
    pub daemon: Option<bool>,
}

impl TryFrom<RawTurboJson> for TurboJson {
    type Error = Error;

    fn try_from(raw: RawTurboJson) -> Result<Self, Error> {
        let mut global_env = Vec::new();
        for var in raw.global_env.unwrap_or_default() {
            if var.starts_with(ENV_PIPELINE_DELIMITER) {
                return Err(Error::InvalidEnvPrefix { value: var });
            }
            global_env.push(var);
        }
        global_env.sort();

        let mut global_deps = raw.global_dependencies.unwrap_or_default();
        global_deps.sort();

        let global_dot_env = raw
            .global_dot_env
            .unwrap_or_default()
            .into_iter()
            .map(RelativeUnixPathBuf::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| Error::Parse {
                path: "globalDotEnv".to_string(),
                message: err.to_string(),
            })?;

        let extends = raw.extends.unwrap_or_default();
        for parent in &extends {
            if parent != crate::task_id::ROOT_PKG_NAME {
                return Err(Error::ExtendFromNonRoot(parent.clone()));
            }
        }

        Ok(TurboJson {
            extends,
            global_deps,
            global_env,
            global_pass_through_env: raw.global_pass_through_env.map(|mut vars| {
                vars.sort();
                vars
            }),
            global_dot_env,
            tasks: raw
                .tasks
                .unwrap_or_default()
                .into_iter()
                .map(|(name, task)| (TaskName::from(name), task))
                .collect(),
            remote_cache: raw.remote_cache,
            daemon: raw.daemon,
        })
    }
}

impl TurboJson {
    /// Finds the raw definition for a task, preferring the exact
    /// `pkg#task` key over the bare name.
    pub fn task(&self, task_id: &TaskId, task_name: &TaskName) -> Option<RawTaskDefinition> {
        self.tasks
            .get(&TaskName::from(task_id.to_string()))
            .or_else(|| self.tasks.get(&TaskName::from(task_name.task()).into_owned()))
            .cloned()
    }

    pub fn has_task(&self, task_id: &TaskId, task_name: &TaskName) -> bool {
        self.task(task_id, task_name).is_some()
    }

    /// Task names eligible to run in the root package.
    pub fn root_enabled_tasks(&self) -> Vec<TaskName<'static>> {
        self.tasks
            .keys()
            .filter(|name| name.package() == Some(crate::task_id::ROOT_PKG_NAME))
            .cloned()
            .collect()
    }
}

/// Reads the turbo config from a directory, enforcing that only one of
/// turbo.json / turbo.jsonc exists.
pub fn read_turbo_config(dir: &AbsoluteSystemPath) -> Result<Option<RawTurboJson>, Error> {
    let json_path = dir.join_component(CONFIG_FILE);
    let jsonc_path = dir.join_component(CONFIG_FILE_JSONC);

    match (json_path.exists(), jsonc_path.exists()) {
        (true, true) => Err(Error::MultipleTurboConfigs(dir.to_string())),
        (true, false) => {
            let contents = json_path
                .read_to_string()
                .map_err(|err| Error::Io(json_path.to_owned(), err))?;
            Ok(Some(RawTurboJson::parse(&contents, json_path.as_str())?))
        }
        (false, true) => {
            let contents = jsonc_path
                .read_to_string()
                .map_err(|err| Error::Io(jsonc_path.to_owned(), err))?;
            Ok(Some(RawTurboJson::parse(&contents, jsonc_path.as_str())?))
        }
        (false, false) => Ok(None),
    }
}

/// Loads and caches turbo.json files per package for one run.
pub struct TurboJsonLoader {
    repo_root: AbsoluteSystemPathBuf,
    package_dirs: HashMap<PackageName, AbsoluteSystemPathBuf>,
    cache: Mutex<HashMap<PackageName, Option<Arc<TurboJson>>>>,
}

impl TurboJsonLoader {
    pub fn workspace(
        repo_root: AbsoluteSystemPathBuf,
        package_dirs: HashMap<PackageName, AbsoluteSystemPathBuf>,
    ) -> Self {
        Self {
            repo_root,
            package_dirs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A loader seeded with in-memory configs, for tests.
    pub fn noop(turbo_jsons: HashMap<PackageName, TurboJson>) -> Self {
        Self {
            repo_root: AbsoluteSystemPathBuf::cwd()
                .expect("process has a current directory"),
            package_dirs: HashMap::new(),
            cache: Mutex::new(
                turbo_jsons
                    .into_iter()
                    .map(|(package, json)| (package, Some(Arc::new(json))))
                    .collect(),
            ),
        }
    }

    /// Loads the config for a package. `Ok(None)` means the package has no
    /// turbo.json of its own. A missing root config is an error.
    pub fn load(&self, package: &PackageName) -> Result<Option<Arc<TurboJson>>, Error> {
        let mut cache = self.cache.lock().expect("turbo.json cache lock");
        if let Some(cached) = cache.get(package) {
            return Ok(cached.clone());
        }

        let dir = match package {
            PackageName::Root => Some(self.repo_root.clone()),
            name => self.package_dirs.get(name).cloned(),
        };
        let loaded = match dir {
            Some(dir) => read_turbo_config(&dir)?
                .map(|raw| TurboJson::try_from(raw).map(Arc::new))
                .transpose()?,
            None => None,
        };

        if matches!(package, PackageName::Root) && loaded.is_none() {
            return Err(Error::NoTurboJson(self.repo_root.to_string()));
        }

        cache.insert(package.clone(), loaded.clone());
        Ok(loaded)
    }
}
