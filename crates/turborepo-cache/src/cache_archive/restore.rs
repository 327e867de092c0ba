use std::{
    collections::HashSet,
    io::{ErrorKind, Read},
};

use tar::Entry;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};

use crate::CacheError;

/// Reads a cache archive and restores it beneath an anchor directory.
///
/// Restoration is sandboxed: entry paths may not be absolute, may not
/// traverse out of the anchor, and may not pass through a symlink. Entries of
/// unsupported types abort the restore, and the caller treats any error here
/// as a cache miss.
pub struct CacheReader<'a> {
    reader: Box<dyn Read + 'a>,
}

impl<'a> CacheReader<'a> {
    pub fn from_reader(reader: impl Read + 'a, is_compressed: bool) -> Result<Self, CacheError> {
        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(reader)?)
        } else {
            Box::new(reader)
        };
        Ok(CacheReader { reader })
    }

    pub fn open(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let file = path.open()?;
        let is_compressed = path.extension() == Some("zst");
        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(file)?)
        } else {
            Box::new(file)
        };
        Ok(CacheReader { reader })
    }

    pub fn restore(
        &mut self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut restored = Vec::new();
        anchor.create_dir_all()?;

        // Directories confirmed to be real (non-symlink) directories under
        // the anchor, so each prefix is lstat'd at most once.
        let mut verified_dirs: HashSet<String> = HashSet::new();
        // Symlink entries are restored after everything else so that a link
        // whose target appears later in the archive still resolves. Targets
        // are allowed to dangle; links are never followed during restore.
        let mut deferred_symlinks: Vec<(AnchoredSystemPathBuf, String)> = Vec::new();

        let mut archive = tar::Archive::new(&mut self.reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = AnchoredSystemPathBuf::from_system_path(&entry.path()?)?;

            match entry.header().entry_type() {
                tar::EntryType::Directory => {
                    ensure_safe_parents(anchor, &entry_path, &mut verified_dirs)?;
                    let target = anchor.resolve(&entry_path);
                    match target.symlink_metadata() {
                        Ok(md) if md.is_dir() => {}
                        Ok(md) if md.is_symlink() => {
                            return Err(CacheError::RestoreThroughSymlink(
                                entry_path.to_string(),
                            ))
                        }
                        Ok(_) => return Err(CacheError::MalformedTar),
                        Err(err) if err.kind() == ErrorKind::NotFound => {
                            std::fs::create_dir(target.as_std_path())?;
                        }
                        Err(err) => return Err(err.into()),
                    }
                    verified_dirs.insert(entry_path.as_str().to_string());
                    restored.push(entry_path);
                }
                tar::EntryType::Regular => {
                    ensure_safe_parents(anchor, &entry_path, &mut verified_dirs)?;
                    let target = anchor.resolve(&entry_path);
                    match target.symlink_metadata() {
                        Ok(md) if md.is_symlink() => {
                            return Err(CacheError::RestoreThroughSymlink(
                                entry_path.to_string(),
                            ))
                        }
                        _ => {}
                    }
                    let mut options = std::fs::OpenOptions::new();
                    options.write(true).create(true).truncate(true);
                    let mut file = target.open_with_options(options)?;
                    std::io::copy(&mut entry, &mut file)?;
                    #[cfg(unix)]
                    if let Ok(mode) = entry.header().mode() {
                        target.set_mode(mode & 0o777)?;
                    }
                    restored.push(entry_path);
                }
                tar::EntryType::Symlink => {
                    let link_name = entry
                        .header()
                        .link_name()?
                        .ok_or(CacheError::MalformedTar)?;
                    let link_name = link_name
                        .to_str()
                        .ok_or(CacheError::MalformedTar)?
                        .to_string();
                    deferred_symlinks.push((entry_path, link_name));
                }
                other => return Err(CacheError::RestoreUnsupportedFileType(other)),
            }
        }

        for (link_path, link_target) in deferred_symlinks {
            ensure_safe_parents(anchor, &link_path, &mut verified_dirs)?;
            let location = anchor.resolve(&link_path);
            // Replacing an existing entry with a link is fine; the link
            // itself is never written through.
            match location.symlink_metadata() {
                Ok(_) => location.remove_file()?,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            location.symlink_to_file(&link_target)?;
            restored.push(link_path);
        }

        Ok(restored)
    }
}

/// Verifies that every ancestor of `entry_path` beneath the anchor is a real
/// directory, creating missing levels. Errors if any level is a symlink or a
/// regular file.
fn ensure_safe_parents(
    anchor: &AbsoluteSystemPath,
    entry_path: &AnchoredSystemPath,
    verified_dirs: &mut HashSet<String>,
) -> Result<(), CacheError> {
    let Some(parent) = entry_path.parent() else {
        return Ok(());
    };
    if parent.as_str().is_empty() {
        return Ok(());
    }

    let mut current = String::new();
    for component in parent.components() {
        if current.is_empty() {
            current.push_str(component);
        } else {
            current.push(std::path::MAIN_SEPARATOR);
            current.push_str(component);
        }
        if verified_dirs.contains(&current) {
            continue;
        }
        let level = AnchoredSystemPath::new(&current)
            .expect("prefix of an anchored path is anchored");
        let absolute = anchor.resolve(level);
        match absolute.symlink_metadata() {
            Ok(md) if md.is_symlink() => {
                return Err(CacheError::RestoreThroughSymlink(current));
            }
            Ok(md) if md.is_dir() => {}
            Ok(_) => return Err(CacheError::MalformedTar),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                std::fs::create_dir(absolute.as_std_path())?;
            }
            Err(err) => return Err(err.into()),
        }
        verified_dirs.insert(current.clone());
    }
    Ok(())
}
