use std::collections::HashSet;

use regex::Regex;

use crate::{
    opts::ScopeOpts,
    package_graph::{PackageGraph, PackageName},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid filter pattern: {0}")]
    InvalidPattern(String),
}

/// A package-name pattern supporting `*` wildcards, e.g. `@scope/*`.
struct SimpleGlob {
    regex: Regex,
}

impl SimpleGlob {
    fn new(pattern: &str) -> Result<Self, Error> {
        let regex_text = format!(
            "^{}$",
            pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*")
        );
        let regex =
            Regex::new(&regex_text).map_err(|_| Error::InvalidPattern(pattern.to_string()))?;
        Ok(Self { regex })
    }

    fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// Resolves the run's package scope. No filters means every workspace
/// package; `--include-dependencies` widens the set with the transitive
/// dependencies of every match.
pub fn resolve_packages(
    opts: &ScopeOpts,
    package_graph: &PackageGraph,
) -> Result<Vec<PackageName>, Error> {
    let all_packages: Vec<PackageName> = package_graph
        .packages()
        .map(|(name, _)| name.clone())
        .collect();

    let mut selected: HashSet<PackageName> = if opts.filter_patterns.is_empty() {
        all_packages.into_iter().collect()
    } else {
        let globs = opts
            .filter_patterns
            .iter()
            .map(|pattern| SimpleGlob::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        all_packages
            .into_iter()
            .filter(|name| globs.iter().any(|glob| glob.is_match(name.as_str())))
            .collect()
    };

    if opts.include_dependencies {
        let roots: Vec<PackageName> = selected.iter().cloned().collect();
        selected.extend(package_graph.transitive_dependencies(&roots));
    }

    let mut ordered: Vec<PackageName> = selected.into_iter().collect();
    ordered.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::Result;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::package_json::PackageJson;

    fn package_graph_fixture() -> Result<(tempfile::TempDir, PackageGraph)> {
        let dir = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let mut package_jsons = HashMap::new();
        for (name, deps) in [
            ("web", vec!["ui"]),
            ("docs", vec!["ui"]),
            ("ui", vec![]),
        ] {
            let path = repo_root.join_components(&["packages", name, "package.json"]);
            package_jsons.insert(
                path,
                PackageJson {
                    name: Some(name.to_string()),
                    dependencies: Some(
                        deps.into_iter()
                            .map(|dep| (dep.to_string(), "workspace:*".to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                },
            );
        }
        let graph = PackageGraph::builder(&repo_root, PackageJson::default())
            .with_package_jsons(Some(package_jsons))
            .build()?;
        Ok((dir, graph))
    }

    fn names(packages: &[PackageName]) -> Vec<&str> {
        packages.iter().map(|name| name.as_str()).collect()
    }

    #[test]
    fn test_no_filter_selects_everything() -> Result<()> {
        let (_dir, graph) = package_graph_fixture()?;
        let selected = resolve_packages(&ScopeOpts::default(), &graph)?;
        assert_eq!(names(&selected), vec!["//", "docs", "ui", "web"]);
        Ok(())
    }

    #[test]
    fn test_exact_filter() -> Result<()> {
        let (_dir, graph) = package_graph_fixture()?;
        let opts = ScopeOpts {
            filter_patterns: vec!["web".to_string()],
            include_dependencies: false,
        };
        let selected = resolve_packages(&opts, &graph)?;
        assert_eq!(names(&selected), vec!["web"]);
        Ok(())
    }

    #[test]
    fn test_wildcard_filter() -> Result<()> {
        let (_dir, graph) = package_graph_fixture()?;
        let opts = ScopeOpts {
            filter_patterns: vec!["d*".to_string()],
            include_dependencies: false,
        };
        let selected = resolve_packages(&opts, &graph)?;
        assert_eq!(names(&selected), vec!["docs"]);
        Ok(())
    }

    #[test]
    fn test_include_dependencies() -> Result<()> {
        let (_dir, graph) = package_graph_fixture()?;
        let opts = ScopeOpts {
            filter_patterns: vec!["web".to_string()],
            include_dependencies: true,
        };
        let selected = resolve_packages(&opts, &graph)?;
        assert_eq!(names(&selected), vec!["ui", "web"]);
        Ok(())
    }
}
