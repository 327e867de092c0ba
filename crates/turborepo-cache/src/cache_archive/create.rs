use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    sync::atomic::{AtomicU64, Ordering},
};

use tar::{EntryType, Header};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath};

use crate::CacheError;

/// Counter combined with the pid to keep temp file names unique across
/// concurrent tasks and concurrent turbo invocations.
static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path_for(final_path: &AbsoluteSystemPath) -> AbsoluteSystemPathBuf {
    let file_name = final_path.file_name().unwrap_or("cache");
    let unique = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_name = format!(".{}.{}.{}.tmp", file_name, std::process::id(), unique);
    final_path
        .parent()
        .expect("cache path has a parent directory")
        .join_component(&temp_name)
}

/// Writes a cache archive.
///
/// When created with [`CacheWriter::create`] the archive is written to a
/// sibling temp file and atomically renamed into place by
/// [`CacheWriter::finish`], so concurrent readers only ever observe complete
/// archives. Dropping the writer without finishing removes the temp file.
pub struct CacheWriter<'a> {
    builder: tar::Builder<Box<dyn Write + 'a>>,
    temp_path: Option<AbsoluteSystemPathBuf>,
    final_path: Option<AbsoluteSystemPathBuf>,
}

impl Drop for CacheWriter<'_> {
    fn drop(&mut self) {
        if let Some(temp_path) = self.temp_path.take() {
            let _ = temp_path.remove_file();
        }
    }
}

impl<'a> CacheWriter<'a> {
    /// Writes the archive into the given writer, compressed when
    /// `use_compression` is set. Used by the HTTP layer to build upload
    /// bodies in memory.
    pub fn from_writer(writer: impl Write + 'a, use_compression: bool) -> Result<Self, CacheError> {
        let writer: Box<dyn Write> = if use_compression {
            Box::new(zstd::Encoder::new(writer, 0)?.auto_finish())
        } else {
            Box::new(writer)
        };
        Ok(CacheWriter {
            builder: tar::Builder::new(writer),
            temp_path: None,
            final_path: None,
        })
    }

    /// Creates an archive at `path`. Compression is decided by the `.zst`
    /// extension.
    pub fn create(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let temp_path = temp_path_for(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let file = temp_path.open_with_options(options)?;
        // Flush to disk in 1mb chunks.
        let file_buffer = BufWriter::with_capacity(2usize.pow(20), file);

        let writer: Box<dyn Write> = if path.extension() == Some("zst") {
            Box::new(zstd::Encoder::new(file_buffer, 0)?.auto_finish())
        } else {
            Box::new(file_buffer)
        };

        Ok(CacheWriter {
            builder: tar::Builder::new(writer),
            temp_path: Some(temp_path),
            final_path: Some(path.to_owned()),
        })
    }

    pub fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPath,
        file_path: &AnchoredSystemPath,
    ) -> Result<(), CacheError> {
        let source_path = anchor.resolve(file_path);
        let file_info = source_path.symlink_metadata()?;

        // Archive paths are always unix, with a trailing slash on
        // directories.
        let mut archive_path = file_path.to_unix();
        archive_path.make_canonical_for_tar(file_info.is_dir());

        let mut header = Self::create_header(&file_info)?;

        if matches!(header.entry_type(), EntryType::Regular) && file_info.len() > 0 {
            let file = source_path.open()?;
            self.builder
                .append_data(&mut header, archive_path.as_str(), file)?;
        } else if matches!(header.entry_type(), EntryType::Symlink) {
            let target = source_path.read_link()?;
            self.builder
                .append_link(&mut header, archive_path.as_str(), target.as_std_path())?;
        } else {
            self.builder
                .append_data(&mut header, archive_path.as_str(), std::io::empty())?;
        }

        Ok(())
    }

    fn create_header(file_info: &std::fs::Metadata) -> Result<Header, CacheError> {
        let mut header = Header::new_gnu();

        if file_info.is_symlink() {
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
        } else if file_info.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
        } else if file_info.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(file_info.len());
            // Modes are clamped so that hashes stay portable across
            // platforms and umasks.
            header.set_mode(0o644);
        } else {
            return Err(CacheError::CreateUnsupportedFileType);
        }

        // Consistent creation metadata.
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(0);
            gnu.set_ctime(0);
        }

        Ok(header)
    }

    /// Finalizes the archive and, for file-backed writers, renames the temp
    /// file onto the final path.
    pub fn finish(mut self) -> Result<(), CacheError> {
        self.builder.finish()?;

        if let (Some(temp_path), Some(final_path)) = (self.temp_path.take(), self.final_path.take())
        {
            temp_path.rename(&final_path)?;
        }

        Ok(())
    }
}
