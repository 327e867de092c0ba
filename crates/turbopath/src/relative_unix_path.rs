use std::fmt;

use crate::{to_system_string, AnchoredSystemPathBuf, PathError, RelativeUnixPathBuf};

/// A borrowed relative path with forward slashes, regardless of platform.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RelativeUnixPath(str);

impl RelativeUnixPath {
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = value.as_ref();
        if path.starts_with('/') {
            return Err(PathError::NotRelative(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: &str) -> &Self {
        // SAFETY: repr(transparent) over str.
        unsafe { &*(path as *const str as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_owned(&self) -> RelativeUnixPathBuf {
        RelativeUnixPathBuf::new_unchecked(self.0.to_string())
    }

    pub fn to_anchored_system_path_buf(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::from_raw(to_system_string(&self.0))
            .expect("relative unix path is relative")
    }

    /// Joins another relative unix path, collapsing any leading `./`.
    pub fn join(&self, tail: &RelativeUnixPath) -> RelativeUnixPathBuf {
        if self.0.is_empty() {
            return tail.to_owned();
        }
        let mut joined = String::with_capacity(self.0.len() + tail.0.len() + 1);
        joined.push_str(&self.0);
        if !self.0.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(tail.0.trim_start_matches("./"));
        RelativeUnixPathBuf::new_unchecked(joined)
    }
}

impl fmt::Display for RelativeUnixPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
