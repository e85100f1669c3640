//! Zip archives of instance data directories.

use std::fs::File;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use ignore::WalkBuilder;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::instance::InstanceId;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("directory walk failed: {0}")]
    Walk(#[from] ignore::Error),

    #[error("archive not finished within {0}s")]
    Timeout(u64),

    #[error("archive task interrupted: {0}")]
    Interrupted(String),
}

/// Download name for a backup taken at `now`, safe on every filesystem.
pub fn file_name(id: &InstanceId, now: DateTime<Utc>) -> String {
    let stamp = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{}-backup-{}.zip", id, stamp)
}

/// Write `source` recursively into a zip under the single top-level directory
/// `root`. Returns the archive size in bytes.
///
/// Entries are added in file-name order. Symlinks and special files are
/// skipped. Entries that vanish between listing and reading are skipped with a
/// warning, since the instance may be running.
pub fn write_archive<W: Write + Seek>(
    source: &Path,
    root: &str,
    level: i64,
    writer: W,
) -> Result<u64, ArchiveError> {
    if !std::fs::metadata(source)?.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a directory", source.display()),
        )
        .into());
    }

    let options = if level == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(level))
    };

    let mut zip = ZipWriter::new(writer);
    zip.add_directory(format!("{}/", root), options)?;

    let mut builder = WalkBuilder::new(source);
    builder
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b));

    for result in builder.build() {
        let entry = match result {
            Ok(entry) => entry,
            Err(e) if vanished(&e) => {
                warn!(error = %e, "entry vanished during backup, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if entry.depth() == 0 {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let name = std::iter::once(std::borrow::Cow::Borrowed(root))
            .chain(relative.components().map(|c| c.as_os_str().to_string_lossy()))
            .collect::<Vec<_>>()
            .join("/");

        match entry.file_type() {
            Some(ft) if ft.is_dir() => {
                zip.add_directory(format!("{}/", name), options)?;
            }
            Some(ft) if ft.is_file() => {
                let mut file = match File::open(entry.path()) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %entry.path().display(), "file vanished during backup, skipping");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                let len = file.metadata()?.len();
                zip.start_file(name, options.large_file(len >= u32::MAX as u64))?;
                std::io::copy(&mut file, &mut zip)?;
            }
            _ => debug!(path = %entry.path().display(), "skipping non-regular entry"),
        }
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    Ok(writer.stream_position()?)
}

fn vanished(err: &ignore::Error) -> bool {
    err.io_error()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
}

/// A staged archive on disk. The file is removed when this is dropped, whether
/// the download finished, failed, or was abandoned by the client.
#[derive(Debug)]
pub struct TempArchive {
    path: PathBuf,
}

impl TempArchive {
    /// Create an empty staging file in `dir`, returning the handle to write to.
    pub fn create(dir: &Path, prefix: &str) -> Result<(File, Self), ArchiveError> {
        let (file, path) = tempfile::Builder::new()
            .prefix(&format!("{}-backup-", prefix))
            .suffix(".zip")
            .tempfile_in(dir)?
            .keep()
            .map_err(|e| ArchiveError::Io(e.error))?;
        Ok((file, Self { path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn open(&self) -> Result<tokio::fs::File, ArchiveError> {
        Ok(tokio::fs::File::open(self.path()).await?)
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed staged archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove staged archive"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use chrono::TimeZone;

    use super::*;
    use crate::instance::Naming;

    fn populate(dir: &Path) {
        std::fs::write(dir.join("a.txt"), "alpha").unwrap();
        std::fs::create_dir_all(dir.join("b")).unwrap();
        std::fs::write(dir.join("b/c.txt"), "charlie").unwrap();
    }

    fn read_entry(zip: &mut zip::ZipArchive<Cursor<Vec<u8>>>, name: &str) -> String {
        let mut out = String::new();
        zip.by_name(name).unwrap().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn archive_nests_everything_under_root() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let mut buf = Cursor::new(Vec::new());
        let size = write_archive(dir.path(), "8001", 9, &mut buf).unwrap();
        assert_eq!(size, buf.get_ref().len() as u64);

        let mut zip = zip::ZipArchive::new(Cursor::new(buf.into_inner())).unwrap();
        assert_eq!(read_entry(&mut zip, "8001/a.txt"), "alpha");
        assert_eq!(read_entry(&mut zip, "8001/b/c.txt"), "charlie");
        assert!(zip.file_names().all(|n| n.starts_with("8001/")));
    }

    #[test]
    fn stored_archive_when_level_zero() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path());

        let mut buf = Cursor::new(Vec::new());
        write_archive(dir.path(), "8001", 0, &mut buf).unwrap();
        let mut zip = zip::ZipArchive::new(Cursor::new(buf.into_inner())).unwrap();
        assert_eq!(
            zip.by_name("8001/a.txt").unwrap().compression(),
            CompressionMethod::Stored
        );
    }

    #[test]
    fn empty_directory_yields_root_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Cursor::new(Vec::new());
        write_archive(dir.path(), "8001", 9, &mut buf).unwrap();
        let zip = zip::ZipArchive::new(Cursor::new(buf.into_inner())).unwrap();
        assert_eq!(zip.len(), 1);
        assert!(zip.file_names().any(|n| n == "8001/"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "nope").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();

        let mut buf = Cursor::new(Vec::new());
        write_archive(dir.path(), "8001", 9, &mut buf).unwrap();
        let zip = zip::ZipArchive::new(Cursor::new(buf.into_inner())).unwrap();
        assert!(!zip.file_names().any(|n| n.contains("escape")));
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = Cursor::new(Vec::new());
        let err = write_archive(&dir.path().join("gone"), "8001", 9, &mut buf).unwrap_err();
        assert!(matches!(err, ArchiveError::Io(_)));
    }

    #[test]
    fn file_name_is_filesystem_safe() {
        let id = Naming::new("st-instance").id_for(8001);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();
        assert_eq!(
            file_name(&id, now),
            "st-instance-8001-backup-2024-05-01T12-30-45-000Z.zip"
        );
    }

    #[test]
    fn temp_archive_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, archive) = TempArchive::create(dir.path(), "st-instance-8001").unwrap();
        file.write_all(b"zip").unwrap();
        drop(file);

        let path = archive.path().to_path_buf();
        assert!(path.exists());
        assert!(path.starts_with(dir.path()));
        drop(archive);
        assert!(!path.exists());
    }

    #[test]
    fn temp_archive_drop_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (_file, archive) = TempArchive::create(dir.path(), "st-instance-8001").unwrap();
        std::fs::remove_file(archive.path()).unwrap();
        drop(archive);
    }
}
