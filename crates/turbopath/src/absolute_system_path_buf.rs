use std::{borrow::Borrow, fmt, ops::Deref, path::PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::{AbsoluteSystemPath, PathError};

/// An owned absolute path using system separators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct AbsoluteSystemPathBuf(Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let path = Utf8PathBuf::from(value.into());
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.into_string()));
        }
        Ok(Self(path))
    }

    pub(crate) fn new_unchecked(path: Utf8PathBuf) -> Self {
        Self(path)
    }

    /// Joins `unknown` onto `base` if it is relative, otherwise takes it
    /// as-is. Used for user-supplied configuration like `--cache-dir`.
    pub fn from_unknown(base: &AbsoluteSystemPath, unknown: impl AsRef<Utf8Path>) -> Self {
        let unknown = unknown.as_ref();
        if unknown.is_absolute() {
            Self(unknown.to_path_buf())
        } else {
            Self(base.as_str().into()).join_literal(unknown)
        }
    }

    fn join_literal(self, tail: &Utf8Path) -> Self {
        Self(self.0.join(tail))
    }

    pub fn cwd() -> Result<Self, PathError> {
        let cwd = std::env::current_dir()?;
        let cwd = Utf8PathBuf::try_from(cwd)
            .map_err(|err| PathError::InvalidUnicode(err.to_string()))?;
        Ok(Self(cwd))
    }

    pub fn as_path(&self) -> &AbsoluteSystemPath {
        AbsoluteSystemPath::new_unchecked(self.0.as_path())
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        self.as_path()
    }
}

impl Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self.as_path()
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self.as_path()
    }
}

impl TryFrom<&std::path::Path> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: &std::path::Path) -> Result<Self, Self::Error> {
        Ok(AbsoluteSystemPath::from_std_path(path)?.to_owned())
    }
}

impl TryFrom<PathBuf> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::try_from(path.as_path())
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    const ROOT: &str = "/repo";
    #[cfg(windows)]
    const ROOT: &str = "C:\\repo";

    #[test]
    fn test_from_unknown_relative() {
        let root = AbsoluteSystemPath::new(ROOT).unwrap();
        let resolved = AbsoluteSystemPathBuf::from_unknown(root, "node_modules/.cache/turbo");
        assert!(resolved.as_str().starts_with(ROOT));
    }

    #[test]
    fn test_from_unknown_absolute() {
        let root = AbsoluteSystemPath::new(ROOT).unwrap();
        #[cfg(unix)]
        let absolute = "/somewhere/else";
        #[cfg(windows)]
        let absolute = "C:\\somewhere\\else";
        let resolved = AbsoluteSystemPathBuf::from_unknown(root, absolute);
        assert_eq!(resolved.as_str(), absolute);
    }
}
