//! Naming service
//!
//! Owns the directory tree and the registry of storage servers, and decides
//! where files live:
//!
//! ```text
//!   client ──lock(/a/b/f, shared)──► root(S) ─► a(S) ─► b(S) ─► f(S)
//!                                                               │
//!                                          reads > threshold ───┘
//!                                          copy to next server
//! ```
//!
//! Tree and registry share one mutex that is never held across a remote call.
//! After a call returns, the node it concerned is looked up again; node ids
//! are never reused, so a node removed in the meantime is simply gone.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

use super::contracts::{Registration, Service};
use super::lock::{LockManager, LockMode};
use super::tree::{NodeId, NodeKind, Replica, Tree};
use crate::config::REPLICATION_THRESHOLD;
use crate::error::{Error, Result};
use crate::metrics;
use crate::path::Path;
use crate::storage::{Command, CommandStub, StorageStub};

#[derive(Debug, Default)]
struct NamingState {
    tree: Tree,
    /// Registered servers in registration order
    registry: Vec<Replica>,
}

impl NamingState {
    /// Lock of an existing directory, or `NotFound`.
    fn directory_lock(&self, path: &Path) -> Result<Arc<LockManager>> {
        let node = self.tree.node(self.tree.resolve(path)?)?;
        if !node.is_directory() {
            return Err(Error::NotFound(format!("{} is not a directory", path)));
        }
        Ok(node.lock())
    }

    /// Locks from the root down to `path`, in that order.
    fn lock_chain(&self, path: &Path) -> Result<Vec<Arc<LockManager>>> {
        let mut current = self.tree.root();
        let mut chain = vec![self.tree.node(current)?.lock()];
        for name in path.components() {
            current = self
                .tree
                .child(current, name)
                .ok_or_else(|| Error::NotFound(format!("{} does not exist", path)))?;
            chain.push(self.tree.node(current)?.lock());
        }
        Ok(chain)
    }

    fn pick_server(&self) -> Result<Replica> {
        self.registry
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| Error::IllegalState("no storage servers are registered".to_string()))
    }

    /// Add `file` to the tree for `replica`, creating intermediate
    /// directories. Returns false when the path is already taken, either by
    /// an existing node at the leaf or by a file on the way down.
    fn merge(&mut self, file: &Path, replica: Replica) -> Result<bool> {
        let names: Vec<&str> = file.components().collect();
        let Some((leaf, dirs)) = names.split_last() else {
            return Ok(false);
        };

        let mut current = self.tree.root();
        for name in dirs {
            current = match self.tree.child(current, name) {
                Some(id) if self.tree.node(id)?.is_directory() => id,
                Some(_) => return Ok(false),
                None => self.tree.insert_directory(current, name)?,
            };
        }
        if self.tree.child(current, leaf).is_some() {
            return Ok(false);
        }
        self.tree.insert_file(current, leaf, replica)?;
        Ok(true)
    }
}

/// What a lock on a file has to do before it may be granted.
enum Upkeep {
    None,
    Invalidate(Vec<Replica>),
    Replicate { source: StorageStub, target: Replica },
}

/// Snapshot of what `delete` has to tell storage servers.
enum Removal {
    File(Vec<CommandStub>),
    Directory(Vec<CommandStub>),
}

/// Metadata server for the whole file system.
#[derive(Debug)]
pub struct NamingService {
    state: Mutex<NamingState>,
    replication_threshold: u64,
}

impl Default for NamingService {
    fn default() -> Self {
        Self::new(REPLICATION_THRESHOLD)
    }
}

impl NamingService {
    /// An empty tree that replicates a file once it has been read-locked
    /// more than `replication_threshold` times.
    pub fn new(replication_threshold: u64) -> Self {
        Self {
            state: Mutex::new(NamingState::default()),
            replication_threshold,
        }
    }

    /// Number of registered storage servers.
    pub fn server_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    /// Current replicas of a file, primary first.
    pub fn replicas(&self, file: &Path) -> Result<Vec<Replica>> {
        let state = self.state.lock();
        let id = state.tree.resolve(file)?;
        Ok(state.tree.file(id)?.replicas.clone())
    }

    /// Shared lock requests on a file since its replica set last changed.
    pub fn read_count(&self, file: &Path) -> Result<u64> {
        let state = self.state.lock();
        let id = state.tree.resolve(file)?;
        Ok(state.tree.file(id)?.reads)
    }

    /// Decide, under the state mutex, what a lock on file `id` requires.
    fn plan_upkeep(&self, id: NodeId, mode: LockMode) -> Result<Upkeep> {
        let mut state = self.state.lock();
        let NamingState { tree, registry } = &mut *state;
        let entry = tree.file_mut(id)?;

        match mode {
            LockMode::Exclusive => {
                let stale = entry.replicas.split_off(1);
                entry.reads = 0;
                if stale.is_empty() {
                    Ok(Upkeep::None)
                } else {
                    Ok(Upkeep::Invalidate(stale))
                }
            }
            LockMode::Shared => {
                entry.reads += 1;
                if entry.reads <= self.replication_threshold
                    || entry.replicas.len() >= registry.len()
                {
                    return Ok(Upkeep::None);
                }
                match registry.iter().find(|r| !entry.holds(&r.command)) {
                    Some(target) => Ok(Upkeep::Replicate {
                        source: entry.primary().storage,
                        target: *target,
                    }),
                    None => Ok(Upkeep::None),
                }
            }
        }
    }

    async fn invalidate(&self, file: &Path, stale: Vec<Replica>) {
        metrics::record_invalidations(stale.len());
        for replica in stale {
            match replica.command.delete(file).await {
                Ok(true) => debug!(%file, server = %replica.command, "Invalidated replica"),
                Ok(false) => warn!(%file, server = %replica.command, "Replica was not deleted"),
                Err(e) => warn!(%file, server = %replica.command, "Replica delete failed: {}", e),
            }
        }
    }

    async fn replicate(&self, id: NodeId, file: &Path, source: StorageStub, target: Replica) {
        match target.command.copy(file, source).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%file, server = %target.command, "Replication refused");
                return;
            }
            Err(e) => {
                warn!(%file, server = %target.command, "Replication failed: {}", e);
                return;
            }
        }

        let mut state = self.state.lock();
        match state.tree.file_mut(id) {
            Ok(entry) => {
                if !entry.holds(&target.command) {
                    entry.replicas.push(target);
                }
                entry.reads = 0;
                metrics::record_replication();
                info!(%file, server = %target.command, replicas = entry.replicas.len(), "Replicated file");
            }
            Err(_) => debug!(%file, "File removed during replication"),
        }
    }
}

#[async_trait]
impl Service for NamingService {
    async fn is_directory(&self, path: &Path) -> Result<bool> {
        let state = self.state.lock();
        let id = state.tree.resolve(path)?;
        Ok(state.tree.node(id)?.is_directory())
    }

    async fn list(&self, directory: &Path) -> Result<Vec<String>> {
        let state = self.state.lock();
        let id = state.tree.resolve(directory)?;
        state.tree.list(id)
    }

    #[instrument(skip(self))]
    async fn create_file(&self, file: &Path) -> Result<bool> {
        if file.is_root() {
            return Ok(false);
        }
        let name = file.last()?;
        let server = {
            let state = self.state.lock();
            let parent = state.tree.resolve_parent(file)?;
            if state.tree.child(parent, name).is_some() {
                return Ok(false);
            }
            state.pick_server()?
        };

        if !server.command.create(file).await? {
            warn!(server = %server.command, "Storage server already held the file");
        }

        let mut state = self.state.lock();
        let parent = state.tree.resolve_parent(file)?;
        if state.tree.child(parent, name).is_some() {
            debug!("File was created concurrently");
            return Ok(false);
        }
        state.tree.insert_file(parent, name, server)?;
        info!(server = %server.command, "Created file");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn create_directory(&self, directory: &Path) -> Result<bool> {
        if directory.is_root() {
            return Ok(false);
        }
        let name = directory.last()?;
        let mut state = self.state.lock();
        let parent = state.tree.resolve_parent(directory)?;
        if state.tree.child(parent, name).is_some() {
            return Ok(false);
        }
        state.tree.insert_directory(parent, name)?;
        debug!("Created directory");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn delete(&self, path: &Path) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        let (id, removal) = {
            let state = self.state.lock();
            let id = state.tree.resolve(path)?;
            let removal = match state.tree.node(id)?.kind() {
                NodeKind::File(entry) => {
                    Removal::File(entry.replicas.iter().map(|r| r.command).collect())
                }
                NodeKind::Directory(_) => Removal::Directory(state.tree.commands_below(id)?),
            };
            (id, removal)
        };

        match removal {
            Removal::File(commands) => {
                for command in commands {
                    if !command.delete(path).await? {
                        warn!(server = %command, "Storage server refused delete");
                        return Ok(false);
                    }
                }
            }
            Removal::Directory(commands) => {
                for command in commands {
                    match command.delete(path).await {
                        Ok(true) => {}
                        Ok(false) => warn!(server = %command, "Storage server refused delete"),
                        Err(e) => warn!(server = %command, "Delete failed: {}", e),
                    }
                }
            }
        }

        let mut state = self.state.lock();
        if state.tree.contains(id) {
            state.tree.remove(id)?;
        }
        info!("Deleted");
        Ok(true)
    }

    async fn get_storage(&self, file: &Path) -> Result<StorageStub> {
        let state = self.state.lock();
        let id = state.tree.resolve(file)?;
        Ok(state.tree.file(id)?.primary().storage)
    }

    #[instrument(skip(self))]
    async fn lock(&self, path: &Path, exclusive: bool) -> Result<()> {
        let mode = LockMode::from_exclusive(exclusive);
        let root = self.state.lock().directory_lock(&Path::root())?;
        if path.is_root() {
            root.acquire(mode).await;
            return Ok(());
        }
        root.acquire_shared().await;

        let names: Vec<&str> = path.components().collect();
        for depth in 1..names.len() {
            let prefix = Path::from_components(names[..depth].iter().copied())?;
            let dir = self.state.lock().directory_lock(&prefix)?;
            dir.acquire_shared().await;
        }

        let (id, node_lock, is_file) = {
            let state = self.state.lock();
            let id = state.tree.resolve(path)?;
            let node = state.tree.node(id)?;
            (id, node.lock(), !node.is_directory())
        };

        if is_file {
            match self.plan_upkeep(id, mode)? {
                Upkeep::None => {}
                Upkeep::Invalidate(stale) => self.invalidate(path, stale).await,
                Upkeep::Replicate { source, target } => {
                    self.replicate(id, path, source, target).await
                }
            }
        }

        node_lock.acquire(mode).await;
        debug!(%mode, "Lock granted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unlock(&self, path: &Path, exclusive: bool) -> Result<()> {
        let mode = LockMode::from_exclusive(exclusive);
        let chain = self
            .state
            .lock()
            .lock_chain(path)
            .map_err(|e| Error::InvalidArgument(format!("cannot unlock {}: {}", path, e)))?;

        if let Some((target, ancestors)) = chain.split_last() {
            for ancestor in ancestors {
                ancestor.release_shared()?;
            }
            target.release(mode)?;
        }
        debug!(%mode, "Lock released");
        Ok(())
    }
}

#[async_trait]
impl Registration for NamingService {
    #[instrument(skip_all, fields(storage = %storage, command = %command, files = files.len()))]
    async fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        files: Vec<Path>,
    ) -> Result<Vec<Path>> {
        let mut state = self.state.lock();
        if state
            .registry
            .iter()
            .any(|r| r.storage == storage || r.command == command)
        {
            return Err(Error::IllegalState(format!(
                "storage server {} is already registered",
                storage
            )));
        }

        let replica = Replica::new(storage, command);
        state.registry.push(replica);
        metrics::record_registration();

        let mut redundant = Vec::new();
        for file in files {
            if file.is_root() {
                continue;
            }
            if !state.merge(&file, replica)? {
                redundant.push(file);
            }
        }
        info!(
            servers = state.registry.len(),
            redundant = redundant.len(),
            "Registered storage server"
        );
        Ok(redundant)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::lock::LockState;
    use crate::rpc::Skeleton;
    use crate::storage::command_table;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn p(s: &str) -> Path {
        Path::new(s).unwrap()
    }

    fn server(port: u16) -> (StorageStub, CommandStub) {
        (
            StorageStub::new(format!("127.0.0.1:{}", port).parse().unwrap()),
            CommandStub::new(format!("127.0.0.1:{}", port + 1).parse().unwrap()),
        )
    }

    async fn with_files(files: &[&str]) -> NamingService {
        let naming = NamingService::default();
        let (storage, command) = server(7000);
        let redundant = naming
            .register(storage, command, files.iter().map(|f| p(f)).collect())
            .await
            .unwrap();
        assert!(redundant.is_empty());
        naming
    }

    #[tokio::test]
    async fn test_root_is_an_empty_directory() {
        let naming = NamingService::default();
        assert!(naming.is_directory(&Path::root()).await.unwrap());
        assert!(naming.list(&Path::root()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registration_builds_the_tree() {
        let naming = with_files(&["/a/b/c", "/a/d", "/e"]).await;
        assert_eq!(naming.list(&Path::root()).await.unwrap(), vec!["a", "e"]);
        assert_eq!(naming.list(&p("/a")).await.unwrap(), vec!["b", "d"]);
        assert!(naming.is_directory(&p("/a/b")).await.unwrap());
        assert!(!naming.is_directory(&p("/a/b/c")).await.unwrap());
        assert_eq!(
            naming.get_storage(&p("/e")).await.unwrap(),
            server(7000).0
        );
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let naming = with_files(&["/f"]).await;
        assert_matches!(naming.is_directory(&p("/missing")).await, Err(Error::NotFound(_)));
        assert_matches!(naming.list(&p("/f")).await, Err(Error::NotFound(_)));
        assert_matches!(naming.list(&p("/f/x")).await, Err(Error::NotFound(_)));
        assert_matches!(naming.get_storage(&Path::root()).await, Err(Error::NotFound(_)));
        assert_matches!(naming.get_storage(&p("/g")).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_second_server_gets_duplicates_back() {
        let naming = with_files(&["/a/x", "/b"]).await;
        let (storage, command) = server(7100);
        let redundant = naming
            .register(storage, command, vec![p("/a/x"), p("/b/y"), p("/c")])
            .await
            .unwrap();
        assert_eq!(redundant, vec![p("/a/x"), p("/b/y")]);
        assert_eq!(naming.replicas(&p("/a/x")).unwrap(), vec![Replica::new(server(7000).0, server(7000).1)]);
        assert_eq!(naming.get_storage(&p("/c")).await.unwrap(), storage);
        assert_eq!(naming.server_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let naming = with_files(&[]).await;
        let (storage, command) = server(7000);
        assert_matches!(
            naming.register(storage, server(7200).1, vec![]).await,
            Err(Error::IllegalState(_))
        );
        assert_matches!(
            naming.register(server(7200).0, command, vec![]).await,
            Err(Error::IllegalState(_))
        );
        assert_eq!(naming.server_count(), 1);
    }

    #[tokio::test]
    async fn test_create_directory() {
        let naming = NamingService::default();
        assert!(!naming.create_directory(&Path::root()).await.unwrap());
        assert!(naming.create_directory(&p("/a")).await.unwrap());
        assert!(!naming.create_directory(&p("/a")).await.unwrap());
        assert!(naming.create_directory(&p("/a/b")).await.unwrap());
        assert_matches!(naming.create_directory(&p("/x/y")).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_file_checks_before_calling_out() {
        let naming = NamingService::default();
        assert!(!naming.create_file(&Path::root()).await.unwrap());
        assert_matches!(naming.create_file(&p("/f")).await, Err(Error::IllegalState(_)));
        assert_matches!(naming.create_file(&p("/d/f")).await, Err(Error::NotFound(_)));

        let naming = with_files(&["/f"]).await;
        assert!(!naming.create_file(&p("/f")).await.unwrap());
        assert_matches!(naming.create_file(&p("/f/g")).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_root_is_refused() {
        let naming = with_files(&["/f"]).await;
        assert!(!naming.delete(&Path::root()).await.unwrap());
        assert_matches!(naming.delete(&p("/nope")).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_directory_delete_needs_no_servers() {
        let naming = NamingService::default();
        naming.create_directory(&p("/a")).await.unwrap();
        naming.create_directory(&p("/a/b")).await.unwrap();
        assert!(naming.delete(&p("/a")).await.unwrap());
        assert_matches!(naming.list(&p("/a")).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_shared_locks_count_reads() {
        let naming = with_files(&["/d/f"]).await;
        for _ in 0..3 {
            naming.lock(&p("/d/f"), false).await.unwrap();
        }
        assert_eq!(naming.read_count(&p("/d/f")).unwrap(), 3);

        // A single server means nowhere to replicate to.
        for _ in 0..30 {
            naming.lock(&p("/d/f"), false).await.unwrap();
        }
        assert_eq!(naming.replicas(&p("/d/f")).unwrap().len(), 1);

        for _ in 0..33 {
            naming.unlock(&p("/d/f"), false).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_exclusive_lock_resets_reads() {
        let naming = with_files(&["/f"]).await;
        naming.lock(&p("/f"), false).await.unwrap();
        naming.unlock(&p("/f"), false).await.unwrap();
        assert_eq!(naming.read_count(&p("/f")).unwrap(), 1);

        naming.lock(&p("/f"), true).await.unwrap();
        assert_eq!(naming.read_count(&p("/f")).unwrap(), 0);
        assert_eq!(naming.replicas(&p("/f")).unwrap().len(), 1);
        naming.unlock(&p("/f"), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_lock_blocks_readers_below_it() {
        let naming = Arc::new(with_files(&["/a/f"]).await);
        naming.lock(&p("/a"), true).await.unwrap();

        let reader = {
            let naming = naming.clone();
            tokio::spawn(async move { naming.lock(&p("/a/f"), false).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        naming.unlock(&p("/a"), true).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        naming.unlock(&p("/a/f"), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_root_lock_modes() {
        let naming = NamingService::default();
        naming.lock(&Path::root(), true).await.unwrap();
        assert_matches!(
            naming.unlock(&Path::root(), false).await,
            Err(Error::IllegalState(_))
        );
        naming.unlock(&Path::root(), true).await.unwrap();
    }

    fn lock_state(naming: &NamingService, path: &str) -> LockState {
        let state = naming.state.lock();
        let id = state.tree.resolve(&p(path)).unwrap();
        state.tree.node(id).unwrap().lock().state()
    }

    #[tokio::test]
    async fn test_lock_missing_path() {
        let naming = with_files(&["/d/f"]).await;
        assert_matches!(naming.lock(&p("/g"), false).await, Err(Error::NotFound(_)));
        assert_eq!(lock_state(&naming, "/").head_readers, 1);

        assert_matches!(naming.lock(&p("/d/f/g"), false).await, Err(Error::NotFound(_)));
        assert_matches!(naming.lock(&p("/d/missing"), true).await, Err(Error::NotFound(_)));

        // Ancestors taken before the failure stay held.
        let root = lock_state(&naming, "/");
        assert_eq!(root.head, Some(LockMode::Shared));
        assert_eq!(root.head_readers, 3);
        assert_eq!(lock_state(&naming, "/d").head_readers, 2);
        assert_eq!(lock_state(&naming, "/d/f").queued, 0);
    }

    /// Command endpoint that refuses every delete and records the attempts.
    #[derive(Default)]
    struct RefusingCommand {
        deletes: Mutex<Vec<Path>>,
    }

    #[async_trait]
    impl Command for RefusingCommand {
        async fn create(&self, _: &Path) -> Result<bool> {
            Ok(true)
        }
        async fn delete(&self, path: &Path) -> Result<bool> {
            self.deletes.lock().push(path.clone());
            Ok(false)
        }
        async fn copy(&self, _: &Path, _: StorageStub) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_refused_file_delete_keeps_the_file() {
        let command = Arc::new(RefusingCommand::default());
        let skeleton = Skeleton::new(
            command_table(),
            command.clone(),
            "127.0.0.1:0".parse().unwrap(),
        );
        skeleton.start().await.unwrap();

        let naming = NamingService::default();
        naming
            .register(
                server(7000).0,
                CommandStub::from_skeleton(&skeleton).unwrap(),
                vec![p("/d/f")],
            )
            .await
            .unwrap();

        assert!(!naming.delete(&p("/d/f")).await.unwrap());
        assert_eq!(*command.deletes.lock(), vec![p("/d/f")]);
        assert_eq!(naming.replicas(&p("/d/f")).unwrap().len(), 1);
        assert_eq!(naming.list(&p("/d")).await.unwrap(), vec!["f"]);

        // Refusals during a directory delete are not fatal.
        assert!(naming.delete(&p("/d")).await.unwrap());
        assert_matches!(naming.list(&p("/d")).await, Err(Error::NotFound(_)));

        skeleton.stop().await;
    }

    #[tokio::test]
    async fn test_unlock_unknown_path_releases_nothing() {
        let naming = with_files(&["/f"]).await;
        naming.lock(&p("/f"), false).await.unwrap();
        assert_matches!(
            naming.unlock(&p("/missing"), false).await,
            Err(Error::InvalidArgument(_))
        );
        naming.unlock(&p("/f"), false).await.unwrap();
        assert_matches!(
            naming.unlock(&p("/f"), false).await,
            Err(Error::IllegalState(_))
        );
    }
}
