#![deny(clippy::all)]
//! Glob walking for task inputs, task outputs, and the daemon's change
//! queries.
//!
//! Matching is anchored at a caller-supplied base directory. Patterns use
//! forward slashes on every platform and support `**`, `*`, `?`, character
//! classes, and brace alternatives. Exclusions win over inclusions and are
//! expanded gitignore-style, so excluding `dist` also excludes everything
//! beneath it.

use std::{collections::HashSet, io::ErrorKind};

use itertools::Itertools;
use path_slash::PathExt;
use thiserror::Error;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, PathError, RelativeUnixPath};
use wax::{Any, Glob, Pattern};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum WalkType {
    Files,
    Folders,
    All,
}

impl WalkType {
    fn should_emit(&self, is_dir: bool) -> bool {
        match self {
            WalkType::Files => !is_dir,
            WalkType::Folders => is_dir,
            WalkType::All => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("bad pattern {0}: {1}")]
    BadPattern(String, Box<wax::BuildError>),
    #[error("walk error: {0}")]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("path is not valid unicode: {0}")]
    InvalidUnicode(String),
}

/// A set of inclusion and exclusion globs compiled for repeated matching.
///
/// The daemon keeps one of these per watched hash; the walker builds one per
/// enumeration.
pub struct GlobSet {
    include: Option<Any<'static>>,
    exclude: Option<Any<'static>>,
}

impl GlobSet {
    pub fn new(raw_includes: &[String], raw_excludes: &[String]) -> Result<Self, WalkError> {
        let include = build_any(raw_includes)?;
        let exclude = build_any(&expand_exclusions(raw_excludes))?;
        Ok(Self { include, exclude })
    }

    /// Whether the repo-relative unix path is matched by this set.
    /// An empty inclusion list matches every path.
    pub fn matches(&self, path: &RelativeUnixPath) -> bool {
        let included = self
            .include
            .as_ref()
            .map_or(true, |any| any.is_match(path.as_str()));
        let excluded = self
            .exclude
            .as_ref()
            .is_some_and(|any| any.is_match(path.as_str()));
        included && !excluded
    }
}

fn compile_glob(raw: &str) -> Result<Glob<'static>, WalkError> {
    Glob::new(raw)
        .map(Glob::into_owned)
        .map_err(|e| WalkError::BadPattern(raw.to_string(), Box::new(e)))
}

fn build_any(raw: &[String]) -> Result<Option<Any<'static>>, WalkError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let globs = raw
        .iter()
        .map(|raw| compile_glob(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let any = wax::any(globs)
        .map_err(|e| WalkError::BadPattern(raw.iter().join(","), Box::new(e)))?;
    Ok(Some(any))
}

/// Expands exclusions so that excluding a directory also excludes its
/// contents, matching git's treatment of ignore entries.
fn expand_exclusions(raw_excludes: &[String]) -> Vec<String> {
    let mut expanded = Vec::with_capacity(raw_excludes.len() * 2);
    for exclusion in raw_excludes {
        if let Some(stripped) = exclusion.strip_suffix('/') {
            expanded.push(format!("{stripped}/**"));
            expanded.push(stripped.to_string());
        } else if exclusion.ends_with("/**") {
            expanded.push(exclusion.clone());
        } else {
            expanded.push(format!("{exclusion}/**"));
            expanded.push(exclusion.clone());
        }
    }
    expanded
}

/// Walks `base_path` and returns the absolute paths matched by `include` and
/// not matched by `exclude`, sorted for determinism.
///
/// An empty `include` list matches every file under the base. Symlinks are
/// reported but never followed, so a link cannot pull the walk outside of the
/// base.
pub fn globwalk(
    base_path: &AbsoluteSystemPath,
    include: &[String],
    exclude: &[String],
    walk_type: WalkType,
) -> Result<Vec<AbsoluteSystemPathBuf>, WalkError> {
    let glob_set = GlobSet::new(include, exclude)?;

    let mut results = HashSet::new();
    let mut iter = walkdir::WalkDir::new(base_path.as_std_path())
        .follow_links(false)
        .into_iter();

    loop {
        let entry = match iter.next() {
            None => break,
            Some(Ok(entry)) => entry,
            // A broken symlink is not an error, there is just nothing to
            // yield for it.
            Some(Err(err))
                if err
                    .io_error()
                    .is_some_and(|io_err| io_err.kind() == ErrorKind::NotFound)
                    && err.path().is_some_and(|path| path.is_symlink()) =>
            {
                continue;
            }
            Some(Err(err)) => return Err(err.into()),
        };

        let path = entry.path();
        if path == base_path.as_std_path() {
            continue;
        }
        let is_symlink = entry.path_is_symlink();
        let is_dir = !is_symlink && entry.file_type().is_dir();

        let relative = path
            .strip_prefix(base_path.as_std_path())
            .expect("walked path is under the base");
        let relative_unix = relative
            .to_slash()
            .ok_or_else(|| WalkError::InvalidUnicode(path.to_string_lossy().into_owned()))?;
        let relative_unix = RelativeUnixPath::new(relative_unix.as_ref())?;

        let excluded = glob_set
            .exclude
            .as_ref()
            .is_some_and(|any| any.is_match(relative_unix.as_str()));
        if is_dir && (excluded || is_symlink) {
            iter.skip_current_dir();
        }
        if excluded {
            continue;
        }

        let included = glob_set
            .include
            .as_ref()
            .map_or(true, |any| any.is_match(relative_unix.as_str()));
        if included && walk_type.should_emit(is_dir) {
            results.insert(AbsoluteSystemPathBuf::try_from(path)?);
        }
    }

    Ok(results.into_iter().sorted().collect())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::TempDir;
    use test_case::test_case;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;

    fn setup_fixture(files: &[&str]) -> Result<(TempDir, AbsoluteSystemPathBuf)> {
        let dir = TempDir::new()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        for file in files {
            let path = root.join_unix_path(RelativeUnixPath::new(file)?);
            path.ensure_dir()?;
            path.create_with_contents("")?;
        }
        Ok((dir, root))
    }

    fn relative_strings(root: &AbsoluteSystemPath, paths: &[AbsoluteSystemPathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|path| root.anchor(path).unwrap().to_unix().as_str().to_string())
            .collect()
    }

    const FIXTURE: &[&str] = &[
        "dist/index.js",
        "dist/js/app.js",
        "dist/js/vendor.map",
        "src/index.ts",
        "package.json",
    ];

    #[test_case(&["dist/**"], &[], &["dist/index.js", "dist/js/app.js", "dist/js/vendor.map"] ; "double star")]
    #[test_case(&["dist/**"], &["dist/js/**"], &["dist/index.js"] ; "exclusion prunes subtree")]
    #[test_case(&["dist/**"], &["dist/js"], &["dist/index.js"] ; "dir exclusion implies contents")]
    #[test_case(&["**/*.js"], &[], &["dist/index.js", "dist/js/app.js"] ; "extension match")]
    #[test_case(&[], &[], FIXTURE ; "empty include matches all")]
    #[test_case(&["*.json"], &[], &["package.json"] ; "single star is anchored")]
    #[test_case(&["dist/??dex.js"], &[], &["dist/index.js"] ; "question mark")]
    fn test_globwalk(include: &[&str], exclude: &[&str], expected: &[&str]) {
        let (_dir, root) = setup_fixture(FIXTURE).unwrap();
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();

        let found = globwalk(&root, &include, &exclude, WalkType::Files).unwrap();
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(relative_strings(&root, &found), expected);
    }

    #[test]
    fn test_idempotent() -> Result<()> {
        let (_dir, root) = setup_fixture(FIXTURE)?;
        let include = vec!["dist/**".to_string()];
        let first = globwalk(&root, &include, &[], WalkType::Files)?;
        let second = globwalk(&root, &include, &[], WalkType::Files)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_symlink_does_not_escape_base() -> Result<()> {
        let outside = TempDir::new()?;
        let outside_root = AbsoluteSystemPathBuf::try_from(outside.path())?;
        outside_root
            .join_component("secret.txt")
            .create_with_contents("secret")?;

        let (_dir, root) = setup_fixture(&["dist/index.js"])?;
        root.join_component("escape")
            .symlink_to_dir(outside_root.as_str())?;

        let found = globwalk(&root, &["**".to_string()], &[], WalkType::Files)?;
        let names = relative_strings(&root, &found);
        assert!(!names.iter().any(|name| name.contains("secret")), "{names:?}");
        Ok(())
    }

    #[test]
    fn test_bad_pattern() {
        let (_dir, root) = setup_fixture(&[]).unwrap();
        let result = globwalk(&root, &["[".to_string()], &[], WalkType::Files);
        assert!(matches!(result, Err(WalkError::BadPattern(_, _))));
    }

    #[test]
    fn test_glob_set_matches() -> Result<()> {
        let set = GlobSet::new(
            &["dist/**".to_string()],
            &["dist/**/*.map".to_string()],
        )?;
        assert!(set.matches(RelativeUnixPath::new("dist/js/app.js")?));
        assert!(!set.matches(RelativeUnixPath::new("dist/js/app.js.map")?));
        assert!(!set.matches(RelativeUnixPath::new("src/index.ts")?));
        Ok(())
    }
}
