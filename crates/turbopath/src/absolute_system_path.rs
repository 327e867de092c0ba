use std::{
    fmt,
    fs::{self, File, Metadata, OpenOptions},
    io,
    path::Path,
};

use camino::{Utf8Path, Utf8PathBuf};

use crate::{
    AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf, PathError, RelativeUnixPath,
};

/// A borrowed absolute path using system separators.
///
/// All filesystem access in the workspace goes through this type so that the
/// rest of the codebase never has to reason about the current directory.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AbsoluteSystemPath(Utf8Path);

impl AbsoluteSystemPath {
    /// Validates that the string is an absolute path.
    pub fn new<P: AsRef<str> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        let path = Utf8Path::from_path(path)
            .ok_or_else(|| PathError::InvalidUnicode(path.to_string_lossy().into_owned()))?;
        if path.is_relative() {
            return Err(PathError::NotAbsolute(path.to_string()));
        }
        Ok(Self::new_unchecked(path))
    }

    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // SAFETY: AbsoluteSystemPath is repr(transparent) over Utf8Path,
        // the same trick Path uses over OsStr.
        unsafe { &*(path as *const Utf8Path as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn to_owned(&self) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.to_path_buf())
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn ancestors(&self) -> impl Iterator<Item = &AbsoluteSystemPath> {
        self.0.ancestors().map(Self::new_unchecked)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension()
    }

    /// Joins a single path component. The component must not contain a
    /// separator, use `join_components` for multiple segments.
    pub fn join_component(&self, segment: &str) -> AbsoluteSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(segment))
    }

    pub fn join_components(&self, segments: &[&str]) -> AbsoluteSystemPathBuf {
        let mut path = self.0.to_path_buf();
        for segment in segments {
            debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
            path.push(segment);
        }
        AbsoluteSystemPathBuf::new_unchecked(path)
    }

    pub fn join_unix_path(&self, unix_path: &RelativeUnixPath) -> AbsoluteSystemPathBuf {
        let tail = unix_path.to_anchored_system_path_buf();
        self.resolve(&tail)
    }

    /// Produces the absolute location of an anchored path, given self as the
    /// anchor.
    pub fn resolve(&self, path: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(path.as_str()))
    }

    /// Expresses `path` relative to self. Errors if self is not a prefix of
    /// `path`.
    pub fn anchor(&self, path: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        let stripped = path
            .0
            .strip_prefix(&self.0)
            .map_err(|_| PathError::NotParent(self.to_string(), path.to_string()))?;
        Ok(AnchoredSystemPathBuf::new_unchecked(stripped.to_path_buf()))
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    pub fn create_dir_all(&self) -> Result<(), io::Error> {
        fs::create_dir_all(&self.0)
    }

    /// Creates all parent directories of self.
    pub fn ensure_dir(&self) -> Result<(), io::Error> {
        if let Some(parent) = self.0.parent() {
            fs::create_dir_all(parent)
        } else {
            Ok(())
        }
    }

    pub fn create_with_contents<B: AsRef<[u8]>>(&self, contents: B) -> Result<(), io::Error> {
        fs::write(&self.0, contents)
    }

    pub fn read(&self) -> Result<Vec<u8>, io::Error> {
        fs::read(&self.0)
    }

    pub fn read_to_string(&self) -> Result<String, io::Error> {
        fs::read_to_string(&self.0)
    }

    pub fn open(&self) -> Result<File, io::Error> {
        File::open(&self.0)
    }

    pub fn open_with_options(&self, options: OpenOptions) -> Result<File, io::Error> {
        options.open(&self.0)
    }

    pub fn metadata(&self) -> Result<Metadata, io::Error> {
        fs::metadata(&self.0)
    }

    pub fn symlink_metadata(&self) -> Result<Metadata, io::Error> {
        fs::symlink_metadata(&self.0)
    }

    pub fn read_link(&self) -> Result<Utf8PathBuf, PathError> {
        let target = fs::read_link(&self.0)?;
        Utf8PathBuf::try_from(target)
            .map_err(|err| PathError::InvalidUnicode(err.to_string()))
    }

    pub fn remove_file(&self) -> Result<(), io::Error> {
        fs::remove_file(&self.0)
    }

    pub fn remove_dir_all(&self) -> Result<(), io::Error> {
        fs::remove_dir_all(&self.0)
    }

    pub fn rename(&self, to: &AbsoluteSystemPath) -> Result<(), io::Error> {
        fs::rename(&self.0, &to.0)
    }

    pub fn symlink_to_file<P: AsRef<str>>(&self, to: P) -> Result<(), io::Error> {
        let target = to.as_ref();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, &self.0)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::symlink_file(target, &self.0)
        }
    }

    pub fn symlink_to_dir<P: AsRef<str>>(&self, to: P) -> Result<(), io::Error> {
        let target = to.as_ref();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, &self.0)
        }
        #[cfg(windows)]
        {
            std::os::windows::fs::symlink_dir(target, &self.0)
        }
    }

    #[cfg(unix)]
    pub fn set_mode(&self, mode: u32) -> Result<(), io::Error> {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(mode);
        fs::set_permissions(&self.0, permissions)
    }
}

impl fmt::Display for AbsoluteSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<Path> for AbsoluteSystemPath {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}
