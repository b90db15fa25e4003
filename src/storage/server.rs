//! Storage server
//!
//! Serves the [`Storage`] and [`Command`] contracts over one local root and
//! registers with the naming service at startup.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use super::contracts::{command_table, storage_table, Command, CommandStub, Storage, StorageStub};
use super::scan;
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::naming::Registration;
use crate::path::Path;
use crate::rpc::Skeleton;

// =============================================================================
// Local Store
// =============================================================================

/// Files of one storage server, kept under a local directory.
#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
    copy_chunk_size: u32,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, copy_chunk_size: u32) -> Self {
        Self {
            root: root.into(),
            copy_chunk_size: copy_chunk_size.max(1),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn local(&self, path: &Path) -> PathBuf {
        path.to_local(&self.root)
    }

    /// Metadata of whatever sits at `path`, or `None` when nothing does. A
    /// file standing where a parent directory should be counts as nothing.
    async fn lookup(&self, path: &Path) -> Result<Option<std::fs::Metadata>> {
        match fs::metadata(self.local(path)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Size of an existing regular file, or `NotFound`.
    async fn file_len(&self, file: &Path) -> Result<u64> {
        match self.lookup(file).await? {
            Some(meta) if meta.is_dir() => {
                Err(Error::NotFound(format!("{} is a directory", file)))
            }
            Some(meta) => Ok(meta.len()),
            None => Err(Error::NotFound(format!("{} does not exist", file))),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.lookup(path).await?.is_some())
    }

    async fn is_local_dir(&self, path: &Path) -> Result<bool> {
        Ok(self.lookup(path).await?.is_some_and(|m| m.is_dir()))
    }

    /// Remove a file announced as redundant, then prune parent directories
    /// that became empty, stopping at the root.
    pub async fn discard(&self, file: &Path) -> Result<()> {
        if let Err(e) = fs::remove_file(self.local(file)).await {
            warn!(%file, "Failed to remove redundant file: {}", e);
        }

        let mut dir = file.parent()?;
        while !dir.is_root() {
            let local = self.local(&dir);
            let mut entries = match fs::read_dir(&local).await {
                Ok(entries) => entries,
                Err(_) => break,
            };
            if entries.next_entry().await?.is_some() {
                break;
            }
            fs::remove_dir(&local).await?;
            debug!(%dir, "Pruned empty directory");
            dir = dir.parent()?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStore {
    async fn size(&self, file: &Path) -> Result<u64> {
        self.file_len(file).await
    }

    async fn read(&self, file: &Path, offset: u64, length: u32) -> Result<Bytes> {
        let size = self.file_len(file).await?;
        let end = offset.checked_add(u64::from(length));
        if end.map_or(true, |end| end > size) {
            return Err(Error::Range(format!(
                "read of {} bytes at {} exceeds {} ({} bytes)",
                length, offset, file, size
            )));
        }
        if length == 0 {
            return Ok(Bytes::new());
        }

        let mut handle = fs::File::open(self.local(file)).await?;
        handle.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        handle.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, file: &Path, offset: u64, data: Bytes) -> Result<()> {
        self.file_len(file).await?;
        if data.is_empty() {
            return Ok(());
        }

        let mut handle = OpenOptions::new().write(true).open(self.local(file)).await?;
        handle.seek(SeekFrom::Start(offset)).await?;
        handle.write_all(&data).await?;
        handle.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Command for LocalStore {
    #[instrument(skip(self))]
    async fn create(&self, file: &Path) -> Result<bool> {
        if file.is_root() || self.exists(file).await? {
            return Ok(false);
        }

        // A file sitting where a parent directory must go is cleared first.
        let parent = file.parent()?;
        let mut ancestor = Path::root();
        for name in parent.components() {
            ancestor = ancestor.child(name)?;
            match fs::metadata(self.local(&ancestor)).await {
                Ok(meta) if !meta.is_dir() => {
                    debug!(%ancestor, "Clearing file in place of a directory");
                    fs::remove_file(self.local(&ancestor)).await?;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        fs::create_dir_all(self.local(&parent)).await?;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.local(file))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, path: &Path) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let local = self.local(path);
        let meta = match fs::symlink_metadata(&local).await {
            Ok(meta) => meta,
            Err(_) => return Ok(false),
        };

        let removed = if meta.is_dir() {
            fs::remove_dir_all(&local).await
        } else {
            fs::remove_file(&local).await
        };
        match removed {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(%path, "Delete failed: {}", e);
                Ok(false)
            }
        }
    }

    #[instrument(skip(self))]
    async fn copy(&self, file: &Path, server: StorageStub) -> Result<bool> {
        // Whatever is there, directory included, gives way to the new copy.
        if self.exists(file).await? {
            self.delete(file).await?;
        }
        if self.is_local_dir(file).await? {
            return Err(Error::NotFound(format!("{} is a directory", file)));
        }
        self.create(file).await?;

        let size = server.size(file).await?;
        let mut offset = 0u64;
        while offset < size {
            let chunk = (size - offset).min(u64::from(self.copy_chunk_size)) as u32;
            let data = server.read(file, offset, chunk).await?;
            self.write(file, offset, data).await?;
            offset += u64::from(chunk);
        }
        info!(%file, bytes = size, "Copied replica");
        Ok(true)
    }
}

/// Lookup failures that mean "nothing there": a missing entry, or a regular
/// file where a directory on the way should be.
fn is_missing(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

// =============================================================================
// Server
// =============================================================================

/// Storage server: both contracts over one [`LocalStore`].
pub struct StorageServer {
    config: StorageConfig,
    store: Arc<LocalStore>,
    storage: Skeleton<LocalStore>,
    command: Skeleton<LocalStore>,
}

impl StorageServer {
    pub fn new(config: StorageConfig) -> Self {
        let store = Arc::new(LocalStore::new(config.root.clone(), config.copy_chunk_size));
        let bind = std::net::SocketAddr::new(config.bind_ip, 0);
        Self {
            storage: Skeleton::new(storage_table(), store.clone(), bind),
            command: Skeleton::new(command_table(), store.clone(), bind),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Data-plane stub as published to the naming service.
    pub fn storage_stub(&self) -> Result<StorageStub> {
        StorageStub::from_skeleton_at(&self.storage, &self.config.advertise_host)
    }

    /// Control-plane stub as published to the naming service.
    pub fn command_stub(&self) -> Result<CommandStub> {
        CommandStub::from_skeleton_at(&self.command, &self.config.advertise_host)
    }

    /// Start both contracts, register with the naming service, and discard
    /// local files the naming service already knows from another server.
    pub async fn start<R>(&self, naming: &R) -> Result<()>
    where
        R: Registration + ?Sized,
    {
        self.config.validate()?;
        self.storage.start().await?;
        self.command.start().await?;

        let storage = self.storage_stub()?;
        let command = self.command_stub()?;
        let files = scan::list_files(&self.config.root).await?;
        info!(%storage, %command, files = files.len(), "Registering with naming service");

        let redundant = naming.register(storage, command, files).await?;
        for file in &redundant {
            self.store.discard(file).await?;
        }
        if !redundant.is_empty() {
            info!(count = redundant.len(), "Discarded redundant local files");
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.command.stop().await;
        self.storage.stop().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn p(s: &str) -> Path {
        Path::new(s).unwrap()
    }

    fn store() -> (TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path(), 4);
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_size() {
        let (_dir, store) = store();
        assert!(store.create(&p("/a/b/file")).await.unwrap());
        assert!(!store.create(&p("/a/b/file")).await.unwrap());
        assert!(!store.create(&Path::root()).await.unwrap());
        assert_eq!(store.size(&p("/a/b/file")).await.unwrap(), 0);
        assert_matches!(store.size(&p("/a/b")).await, Err(Error::NotFound(_)));
        assert_matches!(store.size(&p("/missing")).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_clears_file_in_parent_slot() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("a"), b"in the way").unwrap();

        assert!(store.create(&p("/a/b/c")).await.unwrap());
        assert!(dir.path().join("a").is_dir());
        assert!(dir.path().join("a/b/c").is_file());
    }

    #[tokio::test]
    async fn test_lookup_through_a_file_is_not_found() {
        let (dir, store) = store();
        std::fs::write(dir.path().join("a"), b"plain file").unwrap();
        let f = p("/a/b");

        assert_matches!(store.size(&f).await, Err(Error::NotFound(_)));
        assert_matches!(store.read(&f, 0, 0).await, Err(Error::NotFound(_)));
        assert_matches!(
            store.write(&f, 0, Bytes::from_static(b"x")).await,
            Err(Error::NotFound(_))
        );
        assert!(store.create(&f).await.unwrap());
        assert_eq!(store.size(&f).await.unwrap(), 0);
    }

    async fn serve(store: LocalStore) -> (Skeleton<LocalStore>, StorageStub) {
        let skeleton = Skeleton::new(
            storage_table(),
            Arc::new(store),
            "127.0.0.1:0".parse().unwrap(),
        );
        skeleton.start().await.unwrap();
        let stub = StorageStub::from_skeleton(&skeleton).unwrap();
        (skeleton, stub)
    }

    #[tokio::test]
    async fn test_copy_in_chunks() {
        let (_src_dir, source) = store();
        let f = p("/x/data");
        source.create(&f).await.unwrap();
        source.write(&f, 0, Bytes::from_static(b"0123456789")).await.unwrap();
        let (skeleton, stub) = serve(source).await;

        let (dir, target) = store();
        std::fs::create_dir_all(dir.path().join("x")).unwrap();
        std::fs::write(dir.path().join("x/data"), b"stale and longer than source").unwrap();

        assert!(target.copy(&f, stub).await.unwrap());
        assert_eq!(std::fs::read(dir.path().join("x/data")).unwrap(), b"0123456789");
        skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_copy_replaces_a_local_directory() {
        let (_src_dir, source) = store();
        let f = p("/d");
        source.create(&f).await.unwrap();
        source.write(&f, 0, Bytes::from_static(b"abc")).await.unwrap();
        let (skeleton, stub) = serve(source).await;

        let (dir, target) = store();
        std::fs::create_dir_all(dir.path().join("d/inner")).unwrap();
        std::fs::write(dir.path().join("d/inner/old"), b"old").unwrap();

        assert!(target.copy(&f, stub).await.unwrap());
        assert!(dir.path().join("d").is_file());
        assert_eq!(std::fs::read(dir.path().join("d")).unwrap(), b"abc");
        skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_dir, store) = store();
        let f = p("/data");
        store.create(&f).await.unwrap();

        store.write(&f, 0, Bytes::from_static(b"hello world")).await.unwrap();
        store.write(&f, 6, Bytes::from_static(b"there")).await.unwrap();
        assert_eq!(store.size(&f).await.unwrap(), 11);
        assert_eq!(store.read(&f, 0, 11).await.unwrap().as_ref(), b"hello there");
        assert_eq!(store.read(&f, 6, 5).await.unwrap().as_ref(), b"there");

        // Writing past the end extends the file.
        store.write(&f, 13, Bytes::from_static(b"!")).await.unwrap();
        assert_eq!(store.size(&f).await.unwrap(), 14);
        assert_eq!(store.read(&f, 11, 3).await.unwrap().as_ref(), b"\0\0!");
    }

    #[tokio::test]
    async fn test_read_bounds() {
        let (_dir, store) = store();
        let f = p("/data");
        store.create(&f).await.unwrap();
        store.write(&f, 0, Bytes::from_static(b"abc")).await.unwrap();

        assert!(store.read(&f, 3, 0).await.unwrap().is_empty());
        assert_matches!(store.read(&f, 2, 2).await, Err(Error::Range(_)));
        assert_matches!(store.read(&f, u64::MAX, 1).await, Err(Error::Range(_)));
        assert_matches!(store.read(&p("/nope"), 0, 0).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_write_empty_and_missing() {
        let (_dir, store) = store();
        let f = p("/data");
        store.create(&f).await.unwrap();
        store.write(&f, 100, Bytes::new()).await.unwrap();
        assert_eq!(store.size(&f).await.unwrap(), 0);
        assert_matches!(
            store.write(&p("/nope"), 0, Bytes::from_static(b"x")).await,
            Err(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_delete() {
        let (dir, store) = store();
        store.create(&p("/d/x")).await.unwrap();
        store.create(&p("/d/sub/y")).await.unwrap();

        assert!(!store.delete(&Path::root()).await.unwrap());
        assert!(!store.delete(&p("/missing")).await.unwrap());
        assert!(store.delete(&p("/d/x")).await.unwrap());
        assert!(store.delete(&p("/d")).await.unwrap());
        assert!(!dir.path().join("d").exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_discard_prunes_empty_parents() {
        let (dir, store) = store();
        store.create(&p("/a/b/c/f")).await.unwrap();
        store.create(&p("/a/keep")).await.unwrap();

        store.discard(&p("/a/b/c/f")).await.unwrap();
        assert!(!dir.path().join("a/b").exists());
        assert!(dir.path().join("a/keep").exists());
        assert!(dir.path().exists());
    }
}
