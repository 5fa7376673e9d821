//! Zip archive construction and extraction.
//!
//! The synchronous functions do the work; the async wrappers move it onto
//! the blocking pool.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{AppError, Result};

/// Zip `source` into `dest`, skipping every path equal to or nested under an
/// entry of `excludes`.
///
/// Excludes that do not exist are ignored. An existing file at `dest` is
/// replaced. Returns the number of entries written.
pub fn zip_directory(source: &Path, dest: &Path, excludes: &[PathBuf]) -> Result<usize> {
    let root = source.canonicalize().map_err(|e| {
        AppError::Archive(format!(
            "Unable to read source directory {}: {}",
            source.display(),
            e
        ))
    })?;
    let excludes: Vec<PathBuf> = excludes
        .iter()
        .filter_map(|p| p.canonicalize().ok())
        .collect();

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest).map_err(|e| {
        AppError::Archive(format!("Unable to create archive {}: {}", dest.display(), e))
    })?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let walker = WalkDir::new(&root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !excludes.iter().any(|ex| entry.path().starts_with(ex)));

    let mut entries = 0;
    for entry in walker {
        let entry = entry.map_err(|e| AppError::Archive(format!("Failed to walk source: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(&root)
            .map_err(|e| AppError::Archive(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let file_type = entry.file_type();
        if file_type.is_dir() {
            zip.add_directory(name, options)?;
        } else if file_type.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            add_file(&mut zip, name, entry.path(), size, options)?;
        } else if file_type.is_symlink() {
            // File links are stored as the file they point to; directory
            // links are not followed.
            match std::fs::metadata(entry.path()) {
                Ok(target) if target.is_file() => {
                    add_file(&mut zip, name, entry.path(), target.len(), options)?;
                }
                Ok(_) => {
                    tracing::warn!(path = %entry.path().display(), "Skipping symlink to a directory");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Skipping dangling symlink");
                    continue;
                }
            }
        } else {
            tracing::warn!(path = %entry.path().display(), "Skipping non-regular file");
            continue;
        }
        entries += 1;
    }

    zip.finish()?;
    Ok(entries)
}

fn add_file<W: std::io::Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    name: String,
    path: &Path,
    size: u64,
    options: SimpleFileOptions,
) -> Result<()> {
    zip.start_file(name, options.large_file(size >= u32::MAX as u64))?;
    let mut input = BufReader::new(File::open(path)?);
    std::io::copy(&mut input, zip)?;
    Ok(())
}

/// Expand `archive` into `dest`, creating `dest` if needed.
///
/// Entries that would escape `dest` are skipped.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive).map_err(|e| {
        AppError::Archive(format!("Unable to open archive {}: {}", archive.display(), e))
    })?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .map_err(|e| AppError::Archive(format!("Unable to open archive {}: {}", archive.display(), e)))?;

    std::fs::create_dir_all(dest)?;

    let mut entries = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let outpath = match entry.enclosed_name() {
            Some(path) => dest.join(path),
            None => continue,
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&outpath)?;
            std::io::copy(&mut entry, &mut out)?;
        }
        entries += 1;
    }

    Ok(entries)
}

pub async fn zip_directory_async(
    source: PathBuf,
    dest: PathBuf,
    excludes: Vec<PathBuf>,
) -> Result<usize> {
    tokio::task::spawn_blocking(move || zip_directory(&source, &dest, &excludes)).await?
}

pub async fn extract_zip_async(archive: PathBuf, dest: PathBuf) -> Result<usize> {
    tokio::task::spawn_blocking(move || extract_zip(&archive, &dest)).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn entry_names(archive: &Path) -> BTreeSet<String> {
        let mut zip = ZipArchive::new(File::open(archive).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().trim_end_matches('/').to_string())
            .collect()
    }

    fn fixture_tree(root: &Path) {
        std::fs::create_dir_all(root.join("public/avatars")).unwrap();
        std::fs::create_dir_all(root.join("backups/old")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::write(root.join("public/avatars/a.png"), b"png").unwrap();
        std::fs::write(root.join("invoice.pdf"), b"pdf").unwrap();
        std::fs::write(root.join("backups/old/x.zip"), b"zip").unwrap();
    }

    #[test]
    fn test_exclusion_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app");
        fixture_tree(&src);
        let dest = tmp.path().join("storage.zip");

        zip_directory(&src, &dest, &[src.join("backups")]).unwrap();

        let names = entry_names(&dest);
        assert!(names.iter().all(|n| !n.starts_with("backups")));
        let expected: BTreeSet<String> = [
            "empty",
            "invoice.pdf",
            "public",
            "public/avatars",
            "public/avatars/a.png",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_missing_exclude_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app");
        fixture_tree(&src);
        let dest = tmp.path().join("out.zip");
        let count = zip_directory(&src, &dest, &[tmp.path().join("nope")]).unwrap();
        assert_eq!(count, entry_names(&dest).len());
        assert!(entry_names(&dest).contains("backups/old/x.zip"));
    }

    #[test]
    fn test_extract_restores_tree_including_empty_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app");
        fixture_tree(&src);
        let archive = tmp.path().join("storage.zip");
        zip_directory(&src, &archive, &[]).unwrap();

        let out = tmp.path().join("restored/nested");
        extract_zip(&archive, &out).unwrap();
        assert_eq!(std::fs::read(out.join("public/avatars/a.png")).unwrap(), b"png");
        assert_eq!(std::fs::read(out.join("invoice.pdf")).unwrap(), b"pdf");
        assert!(out.join("empty").is_dir());
    }

    #[test]
    fn test_overwrites_existing_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app");
        fixture_tree(&src);
        let dest = tmp.path().join("storage.zip");
        std::fs::write(&dest, b"stale contents, not a zip").unwrap();
        zip_directory(&src, &dest, &[]).unwrap();
        assert!(entry_names(&dest).contains("invoice.pdf"));
    }

    #[test]
    fn test_extract_garbage_is_archive_error() {
        let tmp = tempfile::tempdir().unwrap();
        let bogus = tmp.path().join("bogus.zip");
        std::fs::write(&bogus, b"definitely not a zip").unwrap();
        let err = extract_zip(&bogus, &tmp.path().join("out")).unwrap_err();
        assert!(matches!(err, AppError::Archive(_)));
    }

    #[test]
    fn test_missing_source_is_archive_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = zip_directory(&tmp.path().join("absent"), &tmp.path().join("a.zip"), &[])
            .unwrap_err();
        assert!(matches!(err, AppError::Archive(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_symlink_is_archived_as_its_target() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app");
        fixture_tree(&src);
        let outside = tmp.path().join("shared.css");
        std::fs::write(&outside, b"body {}").unwrap();
        std::os::unix::fs::symlink(&outside, src.join("theme.css")).unwrap();
        std::os::unix::fs::symlink(src.join("public"), src.join("public-link")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone"), src.join("dangling")).unwrap();

        let archive = tmp.path().join("storage.zip");
        zip_directory(&src, &archive, &[]).unwrap();
        let names = entry_names(&archive);
        assert!(names.contains("theme.css"));
        assert!(!names.contains("public-link"));
        assert!(!names.contains("dangling"));

        let out = tmp.path().join("restored");
        extract_zip(&archive, &out).unwrap();
        assert_eq!(std::fs::read(out.join("theme.css")).unwrap(), b"body {}");
        assert!(!std::fs::symlink_metadata(out.join("theme.css")).unwrap().is_symlink());
    }

    #[tokio::test]
    async fn test_async_wrappers() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app");
        fixture_tree(&src);
        let archive = tmp.path().join("a.zip");
        zip_directory_async(src.clone(), archive.clone(), vec![])
            .await
            .unwrap();
        let n = extract_zip_async(archive, tmp.path().join("x")).await.unwrap();
        assert!(n >= 6);
    }
}
