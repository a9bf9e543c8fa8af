use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::CatalogError;

/// Regular files below a directory, plus the entries that could not be used.
#[derive(Debug, Default)]
pub struct Walk {
    pub files: Vec<Utf8PathBuf>,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Debug, Clone)]
pub struct SkippedEntry {
    /// Lossy rendering of the path, which need not be UTF-8.
    pub path: String,
    pub reason: String,
}

/// Walks `root` in file-name order. Only an unreadable `root` is an error;
/// unreadable subdirectories and non UTF-8 names are collected in `skipped`.
pub fn walk_files(root: &Utf8Path) -> Result<Walk, CatalogError> {
    let mut walk = Walk::default();
    for entry in WalkDir::new(root.as_std_path()).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(CatalogError::Filesystem(format!("read dir {root}: {err}")));
            }
            Err(err) => {
                let path = err
                    .path()
                    .map(|path| path.to_string_lossy().into_owned())
                    .unwrap_or_else(|| root.to_string());
                warn!(path = %path, error = %err, "skipping unreadable entry");
                walk.skipped.push(SkippedEntry {
                    path,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match Utf8PathBuf::from_path_buf(entry.into_path()) {
            Ok(path) => walk.files.push(path),
            Err(path) => {
                let path = path.to_string_lossy().into_owned();
                warn!(path = %path, "skipping non UTF-8 file name");
                walk.skipped.push(SkippedEntry {
                    path,
                    reason: "file name is not valid UTF-8".to_string(),
                });
            }
        }
    }
    Ok(walk)
}

/// Moves `source` to `dest`, creating parent directories. Falls back to an
/// atomic copy followed by removal when a rename is not possible, e.g. across
/// file systems.
pub fn move_file(source: &Utf8Path, dest: &Utf8Path) -> Result<(), CatalogError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CatalogError::Filesystem(format!("create {parent}: {err}")))?;
    }
    match fs::rename(source.as_std_path(), dest.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(CatalogError::Filesystem(
            format!("move {source} -> {dest}: {err}"),
        )),
        Err(_) => {
            copy_file_atomic(source, dest)?;
            fs::remove_file(source.as_std_path())
                .map_err(|err| CatalogError::Filesystem(format!("remove {source}: {err}")))
        }
    }
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), CatalogError> {
    let parent = dest
        .parent()
        .ok_or_else(|| CatalogError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix("runcat-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    fs::copy(source.as_std_path(), temp.path())
        .map_err(|err| CatalogError::Filesystem(format!("copy {source}: {err}")))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| CatalogError::Filesystem(err.to_string()))?;
    Ok(())
}

/// The identifier part of an artifact name: `PMC13900.tar.gz` → `PMC13900`.
pub fn artifact_stem(path: &Utf8Path) -> Option<&str> {
    let name = path.file_name()?;
    let stem = name.split('.').next().unwrap_or(name);
    (!stem.is_empty()).then_some(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_strips_all_extensions() {
        assert_eq!(
            artifact_stem(Utf8Path::new("in/PMC13900.tar.gz")),
            Some("PMC13900")
        );
        assert_eq!(artifact_stem(Utf8Path::new("in/.hidden")), None);
    }

    #[test]
    fn move_creates_parent_directories() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let source = root.join("PMC1.nxml");
        fs::write(source.as_std_path(), b"<article/>").unwrap();

        let dest = root.join("library/ab/cd/PMC1.nxml");
        move_file(&source, &dest).unwrap();

        assert!(!source.exists());
        assert_eq!(fs::read(dest.as_std_path()).unwrap(), b"<article/>");
        assert_eq!(walk_files(&root).unwrap().files, vec![dest]);
    }

    #[test]
    fn walk_fails_only_for_a_missing_root() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        assert!(walk_files(&root.join("absent")).is_err());

        fs::create_dir_all(root.join("b").as_std_path()).unwrap();
        fs::write(root.join("b/PMC2.nxml").as_std_path(), b"").unwrap();
        fs::write(root.join("a.txt").as_std_path(), b"").unwrap();
        let walk = walk_files(&root).unwrap();
        assert_eq!(walk.files, vec![root.join("a.txt"), root.join("b/PMC2.nxml")]);
        assert!(walk.skipped.is_empty());
    }
}
