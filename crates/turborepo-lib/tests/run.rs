//! End-to-end runs against fixture repositories on disk.

use anyhow::Result;
use serde_json::Value;
use turbopath::AbsoluteSystemPathBuf;
use turborepo_lib::{
    cli::{DryRunMode, RunArgs},
    run,
};

fn run_args(tasks: &[&str]) -> RunArgs {
    RunArgs {
        tasks: tasks.iter().map(|task| task.to_string()).collect(),
        cache_workers: 4,
        no_daemon: true,
        ..Default::default()
    }
}

fn write_files(root: &AbsoluteSystemPathBuf, files: &[(&str, &str)]) -> Result<()> {
    for (path, contents) in files {
        let file = root.join_unix_path(turbopath::RelativeUnixPath::new(path)?);
        file.ensure_dir()?;
        file.create_with_contents(contents)?;
    }
    Ok(())
}

/// Reads the single run summary beneath the repo root. Tests clear the runs
/// directory between invocations so exactly one is present.
fn latest_summary(root: &AbsoluteSystemPathBuf) -> Result<Value> {
    let runs_dir = root.join_components(&[".turbo", "runs"]);
    let entries: Vec<_> = std::fs::read_dir(runs_dir.as_std_path())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    assert_eq!(entries.len(), 1, "expected exactly one summary: {entries:?}");
    Ok(serde_json::from_str(&std::fs::read_to_string(&entries[0])?)?)
}

fn clear_summaries(root: &AbsoluteSystemPathBuf) {
    let runs_dir = root.join_components(&[".turbo", "runs"]);
    let _ = std::fs::remove_dir_all(runs_dir.as_std_path());
}

fn single_package_fixture() -> Result<(tempfile::TempDir, AbsoluteSystemPathBuf)> {
    let dir = tempfile::tempdir()?;
    let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
    write_files(
        &root,
        &[
            (
                "package.json",
                r#"{ "name": "single", "scripts": { "build": "echo building > foo" } }"#,
            ),
            (
                "turbo.json",
                r#"{ "tasks": { "build": { "outputs": ["foo"] } } }"#,
            ),
            (".gitignore", "foo\nnode_modules\n.turbo\n"),
        ],
    )?;
    Ok((dir, root))
}

#[tokio::test]
async fn test_single_package_cache_hit() -> Result<()> {
    let (_dir, root) = single_package_fixture()?;

    let mut args = run_args(&["build"]);
    args.single_package = true;
    args.summarize = true;

    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 0);
    assert_eq!(root.join_component("foo").read_to_string()?, "building\n");

    let first = latest_summary(&root)?;
    assert_eq!(first["tasks"][0]["cache"]["status"], "MISS");
    let first_hash = first["tasks"][0]["hash"].as_str().unwrap().to_string();
    assert_eq!(first_hash.len(), 64);

    // Remove the output; the second run restores it from cache.
    clear_summaries(&root);
    root.join_component("foo").remove_file()?;
    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 0);
    assert_eq!(root.join_component("foo").read_to_string()?, "building\n");

    let second = latest_summary(&root)?;
    assert_eq!(second["tasks"][0]["cache"]["status"], "HIT");
    assert_eq!(second["tasks"][0]["cache"]["local"], true);
    assert_eq!(second["tasks"][0]["hash"], first_hash.as_str());
    Ok(())
}

#[tokio::test]
async fn test_topological_dependency_ordering() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
    write_files(
        &root,
        &[
            (
                "package.json",
                r#"{ "name": "monorepo", "workspaces": ["packages/*"] }"#,
            ),
            (
                "turbo.json",
                r#"{ "tasks": { "build": { "dependsOn": ["^build"], "outputs": ["dist/**", "copied"] } } }"#,
            ),
            (
                "packages/util/package.json",
                r#"{ "name": "util", "scripts": { "build": "mkdir -p dist && echo u-content > dist/u" } }"#,
            ),
            ("packages/util/.gitignore", "dist\n"),
            (
                "packages/my-app/package.json",
                r#"{ "name": "my-app", "scripts": { "build": "cat ../util/dist/u > copied" }, "dependencies": { "util": "workspace:*" } }"#,
            ),
            ("packages/my-app/.gitignore", "copied\n"),
            (".gitignore", "node_modules\n.turbo\n"),
        ],
    )?;

    let mut args = run_args(&["build"]);
    args.summarize = true;

    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 0);
    // util#build finished before my-app#build started, or the cat would
    // have found nothing.
    assert_eq!(
        root.join_components(&["packages", "my-app", "copied"])
            .read_to_string()?,
        "u-content\n"
    );

    let first = latest_summary(&root)?;
    let statuses: Vec<_> = first["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|task| task["cache"]["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["MISS", "MISS"]);

    // Everything hits on the second run.
    clear_summaries(&root);
    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 0);
    let second = latest_summary(&root)?;
    let statuses: Vec<_> = second["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|task| task["cache"]["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["HIT", "HIT"]);
    Ok(())
}

#[tokio::test]
async fn test_failed_task_writes_no_cache_entry() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
    write_files(
        &root,
        &[
            (
                "package.json",
                r#"{ "name": "single", "scripts": { "build": "exit 2" } }"#,
            ),
            (
                "turbo.json",
                r#"{ "tasks": { "build": { "outputs": [] } } }"#,
            ),
            (".gitignore", "node_modules\n.turbo\n"),
        ],
    )?;

    let mut args = run_args(&["build"]);
    args.single_package = true;
    args.summarize = true;

    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 1);

    let summary = latest_summary(&root)?;
    assert_eq!(summary["tasks"][0]["execution"]["exitCode"], 2);
    let hash = summary["tasks"][0]["hash"].as_str().unwrap().to_string();

    // Nothing was written for the failed hash.
    let cache_dir = root.join_components(&["node_modules", ".cache", "turbo"]);
    let cached: Vec<_> = std::fs::read_dir(cache_dir.as_std_path())
        .map(|entries| entries.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(
        !cached
            .iter()
            .any(|entry| entry.file_name().to_string_lossy().contains(&hash)),
        "{cached:?}"
    );

    // The failed task reruns with the same hash.
    clear_summaries(&root);
    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 1);
    let second = latest_summary(&root)?;
    assert_eq!(second["tasks"][0]["hash"], hash.as_str());
    assert_eq!(second["tasks"][0]["cache"]["status"], "MISS");
    Ok(())
}

#[tokio::test]
async fn test_dry_run_does_not_execute() -> Result<()> {
    let (_dir, root) = single_package_fixture()?;

    let mut args = run_args(&["build"]);
    args.single_package = true;
    args.dry_run = Some(DryRunMode::Json);

    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 0);
    assert!(!root.join_component("foo").exists());
    Ok(())
}

#[tokio::test]
async fn test_turbo_loop_guard_fails_dry_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
    write_files(
        &root,
        &[
            (
                "package.json",
                r#"{ "name": "single", "scripts": { "build": "turbo run build" } }"#,
            ),
            (
                "turbo.json",
                r#"{ "tasks": { "build": {} } }"#,
            ),
        ],
    )?;

    let mut args = run_args(&["build"]);
    args.single_package = true;
    args.dry_run = Some(DryRunMode::Text);

    let result = run::run(root.clone(), &args, "0.1.0").await;
    let err = result.unwrap_err();
    assert!(
        err.to_string()
            .contains("looks like it invokes turbo and might cause a loop"),
        "{err}"
    );
    assert_eq!(err.exit_code(), 1);
    Ok(())
}

#[tokio::test]
async fn test_env_mode_strict_drops_undeclared_vars() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
    write_files(
        &root,
        &[
            (
                "package.json",
                r#"{ "name": "single", "scripts": { "build": "echo value:$TURBO_E2E_OTHER_VAR > out" } }"#,
            ),
            (
                "turbo.json",
                r#"{ "tasks": { "build": { "outputs": ["out"] } } }"#,
            ),
            (".gitignore", "out\nnode_modules\n.turbo\n"),
        ],
    )?;
    std::env::set_var("TURBO_E2E_OTHER_VAR", "from-parent");

    let mut args = run_args(&["build"]);
    args.single_package = true;
    args.env_mode = turborepo_lib::cli::EnvMode::Strict;
    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 0);
    assert_eq!(root.join_component("out").read_to_string()?, "value:\n");

    args.env_mode = turborepo_lib::cli::EnvMode::Loose;
    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 0);
    assert_eq!(
        root.join_component("out").read_to_string()?,
        "value:from-parent\n"
    );

    std::env::remove_var("TURBO_E2E_OTHER_VAR");
    Ok(())
}

#[tokio::test]
async fn test_continue_runs_siblings_after_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
    write_files(
        &root,
        &[
            (
                "package.json",
                r#"{ "name": "monorepo", "workspaces": ["packages/*"] }"#,
            ),
            (
                "turbo.json",
                r#"{ "tasks": { "build": { "outputs": [] } } }"#,
            ),
            (
                "packages/bad/package.json",
                r#"{ "name": "bad", "scripts": { "build": "exit 1" } }"#,
            ),
            (
                "packages/good/package.json",
                r#"{ "name": "good", "scripts": { "build": "echo ok > done.txt" } }"#,
            ),
            ("packages/good/.gitignore", "done.txt\n"),
            (".gitignore", "node_modules\n.turbo\n"),
        ],
    )?;

    let mut args = run_args(&["build"]);
    args.continue_execution = true;

    let exit = run::run(root.clone(), &args, "0.1.0").await?;
    assert_eq!(exit, 1);
    // The sibling still ran to completion.
    assert!(root
        .join_components(&["packages", "good", "done.txt"])
        .exists());
    Ok(())
}
