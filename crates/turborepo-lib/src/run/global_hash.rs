use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;
use turbopath::{AbsoluteSystemPath, RelativeUnixPathBuf};
use turborepo_env::{DetailedMap, EnvironmentVariableMap};
use turborepo_globwalk::{globwalk, WalkType};
use turborepo_hash::TurboHash;
use turborepo_lockfiles::Lockfile;

use crate::{cli::EnvMode, task_hash::Error, turbo_json::TurboJson};

// Bumping this invalidates every cache entry in existence. It changes when
// the layout of the hashable inputs changes.
const GLOBAL_CACHE_KEY: &str = "Buffalo buffalo Buffalo buffalo buffalo buffalo Buffalo buffalo";

/// Everything that feeds the run-wide global hash: global file dependencies,
/// global env vars, dot-env contents, the root external dependencies, and
/// the cache key version.
#[derive(Debug, Serialize)]
pub struct GlobalHashableInputs {
    global_cache_key: &'static str,
    global_file_hash_map: HashMap<RelativeUnixPathBuf, String>,
    root_external_deps_hash: String,
    env: Vec<String>,
    resolved_env_vars: Vec<String>,
    pass_through_env: Vec<String>,
    env_mode: EnvMode,
    framework_inference: bool,
    dot_env: Vec<RelativeUnixPathBuf>,
}

impl GlobalHashableInputs {
    pub fn calculate(self) -> String {
        let hash = self.hash();
        debug!("global hash: {hash}");
        hash
    }
}

#[allow(clippy::too_many_arguments)]
pub fn get_global_hash_inputs(
    repo_root: &AbsoluteSystemPath,
    root_turbo_json: &TurboJson,
    lockfile: Option<&dyn Lockfile>,
    env_at_execution_start: &EnvironmentVariableMap,
    env_mode: EnvMode,
    framework_inference: bool,
) -> Result<GlobalHashableInputs, Error> {
    let mut global_file_hash_map = HashMap::new();

    if !root_turbo_json.global_deps.is_empty() {
        let files = globwalk(
            repo_root,
            &root_turbo_json.global_deps,
            &["node_modules/**".to_string(), ".git/**".to_string()],
            WalkType::Files,
        )?;
        for file in files {
            let hash = turborepo_hash::hash_file(&file)?;
            let relative = repo_root.anchor(&file)?.to_unix();
            global_file_hash_map.insert(relative, hash);
        }
    }

    // Dot-env files are ordered configuration; both their paths and their
    // contents feed the hash.
    for dot_env in &root_turbo_json.global_dot_env {
        let path = repo_root.join_unix_path(dot_env);
        if path.exists() {
            global_file_hash_map.insert(dot_env.clone(), turborepo_hash::hash_file(&path)?);
        }
    }

    let root_external_deps_hash = match lockfile {
        Some(lockfile) => {
            let mut packages = lockfile.external_packages("")?;
            packages.sort();
            packages.hash()
        }
        None => String::new(),
    };

    let env_var_map = global_env_vars(env_at_execution_start, &root_turbo_json.global_env)?;

    Ok(GlobalHashableInputs {
        global_cache_key: GLOBAL_CACHE_KEY,
        global_file_hash_map,
        root_external_deps_hash,
        env: root_turbo_json.global_env.clone(),
        resolved_env_vars: env_var_map.all.to_hashable(),
        pass_through_env: root_turbo_json
            .global_pass_through_env
            .clone()
            .unwrap_or_default(),
        env_mode,
        framework_inference,
        dot_env: root_turbo_json.global_dot_env.clone(),
    })
}

fn global_env_vars(
    env_at_execution_start: &EnvironmentVariableMap,
    global_env: &[String],
) -> Result<DetailedMap, Error> {
    let user_set = env_at_execution_start.wildcard_maps_unresolved(global_env)?;

    let mut all = EnvironmentVariableMap::default();
    all.union(&user_set.inclusions);
    all.difference(&user_set.exclusions);

    let mut explicit = EnvironmentVariableMap::default();
    explicit.union(&user_set.inclusions);
    explicit.difference(&user_set.exclusions);

    Ok(DetailedMap {
        all,
        by_source: turborepo_env::BySource {
            explicit,
            matching: EnvironmentVariableMap::default(),
        },
    })
}
