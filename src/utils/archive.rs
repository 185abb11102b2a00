// Upload archive handling: safe file names and ZIP extraction

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::core::errors::{ArchiveError, ArchiveResult};

/// Caps applied while expanding an uploaded archive
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

/// Reduce an uploaded file name to a safe ASCII basename.
///
/// Path separators collapse to `_`, anything outside `[A-Za-z0-9._-]` is dropped,
/// and leading dots/underscores are stripped so the result can't be hidden or
/// escape its directory.
pub fn secure_filename(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' => ' ',
            c => c,
        })
        .collect();

    let joined = normalized.split_whitespace().collect::<Vec<_>>().join("_");
    let filtered: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    let trimmed = filtered.trim_start_matches(['.', '_']).to_string();
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed
    }
}

/// Whether the bytes open as a ZIP archive
pub fn is_zip(bytes: &[u8]) -> bool {
    ZipArchive::new(Cursor::new(bytes)).is_ok()
}

fn is_skipped(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part.starts_with('.') || part == "__MACOSX"
        }
        _ => false,
    })
}

/// Extract the regular files of a ZIP archive under `dest`.
///
/// Entries whose names would land outside `dest` are skipped. Directory
/// entries, `__MACOSX/` resource forks and dotfiles are ignored. Returns the
/// written paths in archive order.
pub fn extract_zip(bytes: &[u8], dest: &Path, limits: ExtractLimits) -> ArchiveResult<Vec<PathBuf>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
        debug!("Upload did not open as a ZIP archive: {}", e);
        ArchiveError::NotAZip
    })?;

    if archive.len() > limits.max_entries {
        return Err(ArchiveError::TooManyEntries {
            count: archive.len(),
            limit: limits.max_entries,
        });
    }

    fs::create_dir_all(dest).map_err(|e| ArchiveError::Io {
        path: dest.display().to_string(),
        source: e,
    })?;

    let mut written = Vec::new();
    let mut total_bytes: u64 = 0;

    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry: {}", entry.name());
            continue;
        };
        if is_skipped(&relative) {
            debug!("Skipping hidden archive entry: {}", relative.display());
            continue;
        }

        let out_path = dest.join(&relative);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        // Declared sizes can lie; bound the actual read instead
        let remaining = limits.max_total_bytes.saturating_sub(total_bytes);
        let mut data = Vec::new();
        entry
            .take(remaining + 1)
            .read_to_end(&mut data)
            .map_err(|e| ArchiveError::Io {
                path: relative.display().to_string(),
                source: e,
            })?;
        if data.len() as u64 > remaining {
            return Err(ArchiveError::TooLarge {
                limit_bytes: limits.max_total_bytes,
            });
        }
        total_bytes += data.len() as u64;

        fs::write(&out_path, &data).map_err(|e| ArchiveError::Io {
            path: out_path.display().to_string(),
            source: e,
        })?;
        written.push(out_path);
    }

    if written.is_empty() {
        return Err(ArchiveError::Empty);
    }

    debug!(
        "Extracted {} files ({} bytes) into {}",
        written.len(),
        total_bytes,
        dest.display()
    );
    Ok(written)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::{SimpleFileOptions, ZipWriter};

    pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap().into_inner()
    }

    const LIMITS: ExtractLimits = ExtractLimits {
        max_entries: 100,
        max_total_bytes: 1024 * 1024,
    };

    #[test]
    fn test_secure_filename() {
        assert_eq!(secure_filename("My Photos.zip"), "My_Photos.zip");
        assert_eq!(secure_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("東京タワー.jpg"), "jpg");
        assert_eq!(secure_filename(".hidden"), "hidden");
        assert_eq!(secure_filename("///"), "upload");
    }

    #[test]
    fn test_is_zip() {
        assert!(is_zip(&build_zip(&[("a.txt", b"a")])));
        assert!(!is_zip(b"PK but not really"));
    }

    #[test]
    fn test_extract_keeps_order_and_skips_noise() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[
            ("photos/", b""),
            ("photos/b.jpg", b"bbb"),
            ("photos/a.jpg", b"aa"),
            ("__MACOSX/photos/._a.jpg", b"junk"),
            ("photos/.DS_Store", b"junk"),
        ]);

        let files = extract_zip(&bytes, dir.path(), LIMITS).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["b.jpg", "a.jpg"]);
        assert_eq!(fs::read(&files[1]).unwrap(), b"aa");
    }

    #[test]
    fn test_extract_never_escapes_destination() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("job");
        let bytes = build_zip(&[("../evil.jpg", b"x"), ("ok.jpg", b"y")]);

        let files = extract_zip(&bytes, &dest, LIMITS).unwrap();
        assert_eq!(files, vec![dest.join("ok.jpg")]);
        assert!(!root.path().join("evil.jpg").exists());
    }

    #[test]
    fn test_extract_enforces_limits() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[("a.jpg", &[0u8; 64]), ("b.jpg", &[0u8; 64])]);

        let too_many = ExtractLimits { max_entries: 1, ..LIMITS };
        assert!(matches!(
            extract_zip(&bytes, dir.path(), too_many),
            Err(ArchiveError::TooManyEntries { count: 2, limit: 1 })
        ));

        let too_big = ExtractLimits { max_total_bytes: 100, ..LIMITS };
        assert!(matches!(
            extract_zip(&bytes, dir.path(), too_big),
            Err(ArchiveError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_extract_rejects_non_zip_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract_zip(b"plain text", dir.path(), LIMITS),
            Err(ArchiveError::NotAZip)
        ));

        let only_dirs = build_zip(&[("empty/", b"")]);
        assert!(matches!(
            extract_zip(&only_dirs, dir.path(), LIMITS),
            Err(ArchiveError::Empty)
        ));
    }
}
