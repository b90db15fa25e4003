//! Local root scan
//!
//! Lists every regular file under a storage root as a distributed path. The
//! result is what a storage server announces when it registers.

use std::path::{Path as LocalPath, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};
use crate::path::Path;

/// Every regular file below `root`, as paths relative to it, sorted.
pub async fn list_files(root: &LocalPath) -> Result<Vec<Path>> {
    let meta = tokio::fs::metadata(root).await?;
    if !meta.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut files = Vec::new();
    let mut pending: Vec<(PathBuf, Path)> = vec![(root.to_path_buf(), Path::root())];
    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(entry = %entry.path().display(), "Skipping non UTF-8 file name");
                continue;
            };
            let path = match prefix.child(name) {
                Ok(path) => path,
                Err(e) => {
                    warn!(entry = %entry.path().display(), "Skipping unrepresentable name: {}", e);
                    continue;
                }
            };

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), path));
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_lists_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("top"), b"1").unwrap();
        std::fs::write(dir.path().join("a/b/deep"), b"2").unwrap();
        std::fs::write(dir.path().join("a/mid"), b"3").unwrap();

        let files = list_files(dir.path()).await.unwrap();
        let rendered: Vec<String> = files.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, vec!["/a/b/deep", "/a/mid", "/top"]);
    }

    #[tokio::test]
    async fn test_skips_reserved_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad:name"), b"x").unwrap();
        std::fs::write(dir.path().join("good"), b"x").unwrap();

        let files = list_files(dir.path()).await.unwrap();
        assert_eq!(files, vec![Path::new("/good").unwrap()]);
    }

    #[tokio::test]
    async fn test_root_must_be_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert_matches!(list_files(&file).await, Err(Error::InvalidArgument(_)));
    }
}
