//! Zip snapshots of the save directory or save file
//!
//! Entries are stored under the save's own name (`world/...` for a
//! directory, `world.wld` for a file) so extracting into the save's parent
//! directory recreates it in place.

use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Snapshot/restore codec for backups
pub trait ArchiveCodec: Send + Sync {
    /// Write `source` (a directory when `source_is_dir`, else a file) to `dest`
    fn snapshot(&self, source: &Path, source_is_dir: bool, dest: &Path) -> Result<(), ArchiveError>;

    /// Extract `archive` into `dest_dir`
    fn restore(&self, archive: &Path, dest_dir: &Path) -> Result<(), ArchiveError>;
}

/// Deflate-compressed zip archives
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipCodec;

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

impl ArchiveCodec for ZipCodec {
    fn snapshot(&self, source: &Path, source_is_dir: bool, dest: &Path) -> Result<(), ArchiveError> {
        let matches = if source_is_dir {
            source.is_dir()
        } else {
            source.is_file()
        };
        if !matches {
            return Err(ArchiveError::BadSource(source.to_path_buf()));
        }
        let base = source
            .file_name()
            .ok_or_else(|| ArchiveError::BadSource(source.to_path_buf()))?
            .to_string_lossy()
            .into_owned();

        let mut zip = ZipWriter::new(File::create(dest)?);
        if source_is_dir {
            zip.add_directory(format!("{}/", base), file_options())?;
            add_dir_entries(&mut zip, source, &base)?;
        } else {
            add_file(&mut zip, source, base)?;
        }
        zip.finish()?;

        log::debug!("Archived {} to {}", source.display(), dest.display());
        Ok(())
    }

    fn restore(&self, archive: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
        let mut zip = ZipArchive::new(File::open(archive)?)?;
        fs::create_dir_all(dest_dir)?;
        zip.extract(dest_dir)?;

        log::debug!(
            "Extracted {} entries from {} into {}",
            zip.len(),
            archive.display(),
            dest_dir.display()
        );
        Ok(())
    }
}

fn add_file<W: Write + Seek>(zip: &mut ZipWriter<W>, path: &Path, name: String) -> Result<(), ArchiveError> {
    let mut file = File::open(path)?;
    let mode = file.metadata()?.permissions().mode();
    zip.start_file(name, file_options().unix_permissions(mode))?;
    io::copy(&mut file, zip)?;
    Ok(())
}

fn add_dir_entries<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    dir: &Path,
    prefix: &str,
) -> Result<(), ArchiveError> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = format!("{}/{}", prefix, entry.file_name().to_string_lossy());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            zip.add_directory(format!("{}/", name), file_options())?;
            add_dir_entries(zip, &path, &name)?;
        } else if file_type.is_file() {
            add_file(zip, &path, name)?;
        } else {
            log::warn!("Skipping {} (not a regular file or directory)", path.display());
        }
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive source {0} does not exist or has changed type")]
    BadSource(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}
