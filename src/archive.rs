//! Moving processed files out of the watched folder.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Move `path` into `archive_dir`, renaming on collision.
///
/// `report.pdf` becomes `report_1.pdf`, `report_2.pdf`, … when the archive
/// already holds that name. Returns the final destination.
pub fn archive_file(path: &Path, archive_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(archive_dir)
        .with_context(|| format!("creating archive dir {}", archive_dir.display()))?;

    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    let destination = free_destination(archive_dir, Path::new(file_name));

    match fs::rename(path, &destination) {
        Ok(()) => {}
        Err(e) if is_cross_device(&e) => {
            debug!(path = %path.display(), "rename crossed devices; copying");
            fs::copy(path, &destination)
                .with_context(|| format!("copying {} to {}", path.display(), destination.display()))?;
            fs::remove_file(path)
                .with_context(|| format!("removing {} after copy", path.display()))?;
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("moving {} to {}", path.display(), destination.display())
            })
        }
    }

    Ok(destination)
}

fn free_destination(dir: &Path, name: &Path) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = name.extension().map(|e| e.to_string_lossy().to_string());

    (1u32..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, n, ext)),
            None => dir.join(format!("{}_{}", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn is_cross_device(err: &io::Error) -> bool {
    #[cfg(unix)]
    const CROSS_DEVICE: i32 = 18; // EXDEV
    #[cfg(windows)]
    const CROSS_DEVICE: i32 = 17; // ERROR_NOT_SAME_DEVICE
    #[cfg(not(any(unix, windows)))]
    const CROSS_DEVICE: i32 = -1;
    err.raw_os_error() == Some(CROSS_DEVICE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn moves_into_archive() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("in").join("notes.md");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, "# Notes").unwrap();

        let archive = tmp.path().join("archive");
        let dest = archive_file(&src, &archive).unwrap();

        assert_eq!(dest, archive.join("notes.md"));
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(dest).unwrap(), "# Notes");
    }

    #[test]
    fn collisions_get_numbered_suffixes() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("archive");
        fs::create_dir_all(&archive).unwrap();
        fs::write(archive.join("report.pdf"), "old").unwrap();
        fs::write(archive.join("report_1.pdf"), "older").unwrap();

        let src = tmp.path().join("report.pdf");
        fs::write(&src, "new").unwrap();
        let dest = archive_file(&src, &archive).unwrap();
        assert_eq!(dest, archive.join("report_2.pdf"));

        let bare = tmp.path().join("Makefile");
        fs::write(&bare, "all:").unwrap();
        fs::write(archive.join("Makefile"), "x").unwrap();
        assert_eq!(archive_file(&bare, &archive).unwrap(), archive.join("Makefile_1"));
    }

    #[test]
    fn missing_source_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(archive_file(&tmp.path().join("gone.txt"), &tmp.path().join("a")).is_err());
    }
}
