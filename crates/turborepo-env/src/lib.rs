#![deny(clippy::all)]
//! Environment variable handling for hashing and child process construction.
//!
//! Task definitions declare env vars by exact name or `*` wildcard. A `!`
//! prefix excludes matches, and exclusions always win over inclusions so that
//! a user exclusion can override an inferred inclusion.

use std::{
    collections::HashMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Failed to parse regex: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(HashMap<String, String>);

/// A sorted list of `NAME=value` strings, the form fed into task hashes.
pub type EnvironmentVariablePairs = Vec<String>;

impl From<HashMap<String, String>> for EnvironmentVariableMap {
    fn from(map: HashMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl EnvironmentVariableMap {
    /// Snapshot of the process environment at execution start.
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted `NAME=value` pairs for hashing.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }

    /// A map of variable name to the hash of its value. Run summaries record
    /// these instead of raw values so that secrets never land on disk.
    pub fn hashes(&self) -> HashMap<String, String> {
        self.iter()
            .map(|(k, v)| {
                let mut hasher = Sha256::new();
                hasher.update(v.as_bytes());
                (k.clone(), hex::encode(hasher.finalize()))
            })
            .collect()
    }

    /// Adds all entries from `other`, overwriting existing keys.
    pub fn union(&mut self, other: &EnvironmentVariableMap) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Removes all keys present in `other`.
    pub fn difference(&mut self, other: &EnvironmentVariableMap) {
        for key in other.0.keys() {
            self.0.remove(key);
        }
    }

    /// Returns the variables matching any of the wildcard patterns, with
    /// exclusions applied.
    pub fn from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<EnvironmentVariableMap, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }
        Ok(self.wildcard_maps(wildcard_patterns)?.resolve())
    }

    /// Returns inclusions and exclusions unresolved, so that the caller can
    /// give user exclusions primacy over separately inferred inclusions.
    pub fn wildcard_maps_unresolved(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<WildcardMaps, Error> {
        if wildcard_patterns.is_empty() {
            return Ok(WildcardMaps::default());
        }
        self.wildcard_maps(wildcard_patterns)
    }

    fn wildcard_maps(&self, wildcard_patterns: &[impl AsRef<str>]) -> Result<WildcardMaps, Error> {
        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();

        for pattern in wildcard_patterns {
            let pattern = pattern.as_ref();
            if let Some(rest) = pattern.strip_prefix('!') {
                exclude_patterns.push(wildcard_to_regex_pattern(rest));
            } else if let Some(rest) = pattern.strip_prefix("\\!") {
                // An escaped bang is a literal variable name starting with !
                include_patterns.push(wildcard_to_regex_pattern(&format!("!{rest}")));
            } else {
                include_patterns.push(wildcard_to_regex_pattern(pattern));
            }
        }

        let include_regex = Regex::new(&format!("^({})$", include_patterns.join("|")))?;
        let exclude_regex = Regex::new(&format!("^({})$", exclude_patterns.join("|")))?;

        let mut output = WildcardMaps::default();
        for (name, value) in &self.0 {
            if !include_patterns.is_empty() && include_regex.is_match(name) {
                output.inclusions.insert(name.clone(), value.clone());
            }
            if !exclude_patterns.is_empty() && exclude_regex.is_match(name) {
                output.exclusions.insert(name.clone(), value.clone());
            }
        }
        Ok(output)
    }
}

/// Inclusions and exclusions discovered from a set of wildcard patterns.
#[derive(Debug, Default)]
pub struct WildcardMaps {
    pub inclusions: EnvironmentVariableMap,
    pub exclusions: EnvironmentVariableMap,
}

impl WildcardMaps {
    pub fn resolve(self) -> EnvironmentVariableMap {
        let mut output = self.inclusions;
        output.difference(&self.exclusions);
        output
    }
}

/// Env vars split by how they came to be included.
#[derive(Debug, Serialize)]
pub struct BySource {
    pub explicit: EnvironmentVariableMap,
    pub matching: EnvironmentVariableMap,
}

/// The composite map used as a hash input plus the per-source breakdown used
/// by dry runs and run summaries.
#[derive(Debug, Serialize)]
pub struct DetailedMap {
    pub all: EnvironmentVariableMap,
    pub by_source: BySource,
}

/// Translates a `*` wildcard pattern into an anchored-regex body.
///
/// `\*` stands for a literal star. Runs of wildcards collapse into a single
/// `.*`; every other character is emitted regex-escaped. The caller wraps
/// the result in `^(...)$`.
fn wildcard_to_regex_pattern(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'*') => {
                chars.next();
                regex.push_str("\\*");
            }
            '*' => {
                // Escaped characters always end in an escaped literal, so a
                // trailing `.*` can only have come from a wildcard.
                if !regex.ends_with(".*") {
                    regex.push_str(".*");
                }
            }
            c => regex.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }

    regex
}
