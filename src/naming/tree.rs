//! Naming tree
//!
//! In-memory directory tree kept as an arena. Nodes refer to their parent and
//! children by [`NodeId`]; identifiers are never reused, so an id held across
//! a remote call either still names the same node or no longer resolves.
//! Every node owns its [`LockManager`], which lives exactly as long as the
//! node does.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::path::Path;
use crate::storage::{CommandStub, StorageStub};

use super::lock::LockManager;

/// Stable identifier of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// One storage server's copy of a file: the data endpoint clients read from
/// and the command endpoint the naming service drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Replica {
    pub storage: StorageStub,
    pub command: CommandStub,
}

impl Replica {
    pub fn new(storage: StorageStub, command: CommandStub) -> Self {
        Self { storage, command }
    }
}

/// File metadata held by the naming service.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Never empty while the node is in the tree
    pub replicas: Vec<Replica>,
    /// Shared lock requests since the last replica change
    pub reads: u64,
}

impl FileEntry {
    fn new(replica: Replica) -> Self {
        Self {
            replicas: vec![replica],
            reads: 0,
        }
    }

    pub fn holds(&self, command: &CommandStub) -> bool {
        self.replicas.iter().any(|r| &r.command == command)
    }

    /// Endpoint handed to clients for data I/O.
    pub fn primary(&self) -> &Replica {
        &self.replicas[0]
    }
}

#[derive(Debug)]
pub enum NodeKind {
    Directory(BTreeMap<String, NodeId>),
    File(FileEntry),
}

#[derive(Debug)]
pub struct Node {
    parent: Option<NodeId>,
    name: String,
    kind: NodeKind,
    lock: Arc<LockManager>,
}

impl Node {
    fn new(parent: Option<NodeId>, name: &str, kind: NodeKind) -> Self {
        Self {
            parent,
            name: name.to_string(),
            kind,
            lock: Arc::new(LockManager::new()),
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn lock(&self) -> Arc<LockManager> {
        self.lock.clone()
    }
}

/// Arena of directory and file nodes rooted at a single directory.
#[derive(Debug)]
pub struct Tree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_id: u64,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// A tree holding only the root directory.
    pub fn new() -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(root, Node::new(None, "", NodeKind::Directory(BTreeMap::new())));
        Self {
            nodes,
            root,
            next_id: 1,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("node {:?} no longer exists", id)))
    }

    pub fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        match &self.nodes.get(&dir)?.kind {
            NodeKind::Directory(children) => children.get(name).copied(),
            NodeKind::File(_) => None,
        }
    }

    /// Resolve `path` to its node. A missing component, or a file met before
    /// the last component, is `NotFound`.
    pub fn resolve(&self, path: &Path) -> Result<NodeId> {
        let mut current = self.root;
        for name in path.components() {
            if !self.node(current)?.is_directory() {
                return Err(not_found(path));
            }
            current = self.child(current, name).ok_or_else(|| not_found(path))?;
        }
        Ok(current)
    }

    /// Resolve the directory that holds (or would hold) `path`.
    pub fn resolve_parent(&self, path: &Path) -> Result<NodeId> {
        let parent = self.resolve(&path.parent()?)?;
        if !self.node(parent)?.is_directory() {
            return Err(not_found(path));
        }
        Ok(parent)
    }

    /// Names of a directory's children, in order.
    pub fn list(&self, dir: NodeId) -> Result<Vec<String>> {
        match &self.node(dir)?.kind {
            NodeKind::Directory(children) => Ok(children.keys().cloned().collect()),
            NodeKind::File(_) => Err(Error::NotFound(format!(
                "{} is not a directory",
                self.path_of(dir)?
            ))),
        }
    }

    pub fn file(&self, id: NodeId) -> Result<&FileEntry> {
        match &self.node(id)?.kind {
            NodeKind::File(entry) => Ok(entry),
            NodeKind::Directory(_) => Err(Error::NotFound(format!(
                "{} is a directory",
                self.path_of(id)?
            ))),
        }
    }

    pub fn file_mut(&mut self, id: NodeId) -> Result<&mut FileEntry> {
        let path = self.path_of(id)?;
        match self.nodes.get_mut(&id).map(|n| &mut n.kind) {
            Some(NodeKind::File(entry)) => Ok(entry),
            Some(NodeKind::Directory(_)) => {
                Err(Error::NotFound(format!("{} is a directory", path)))
            }
            None => Err(not_found(&path)),
        }
    }

    pub fn insert_directory(&mut self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.insert(parent, name, NodeKind::Directory(BTreeMap::new()))
    }

    pub fn insert_file(&mut self, parent: NodeId, name: &str, replica: Replica) -> Result<NodeId> {
        self.insert(parent, name, NodeKind::File(FileEntry::new(replica)))
    }

    fn insert(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        let id = NodeId(self.next_id);
        let children = match self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            Some(NodeKind::Directory(children)) => children,
            Some(NodeKind::File(_)) => {
                return Err(Error::IllegalState(format!("cannot insert {} under a file", name)))
            }
            None => return Err(Error::NotFound(format!("parent of {} was removed", name))),
        };
        if children.contains_key(name) {
            return Err(Error::IllegalState(format!("{} already exists", name)));
        }
        children.insert(name.to_string(), id);
        self.next_id += 1;
        self.nodes.insert(id, Node::new(Some(parent), name, kind));
        Ok(id)
    }

    /// Detach `id` from its parent and drop it with all its descendants.
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        let parent = self
            .node(id)?
            .parent
            .ok_or_else(|| Error::InvalidArgument("the root cannot be removed".to_string()))?;
        let name = self.node(id)?.name.clone();
        if let Some(NodeKind::Directory(children)) = self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            children.remove(&name);
        }

        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(node) = self.nodes.remove(&next) {
                if let NodeKind::Directory(children) = node.kind {
                    pending.extend(children.into_values());
                }
            }
        }
        Ok(())
    }

    /// Distinct command endpoints holding any file at or below `id`, in
    /// discovery order.
    pub fn commands_below(&self, id: NodeId) -> Result<Vec<CommandStub>> {
        let mut found: Vec<CommandStub> = Vec::new();
        let mut pending = vec![self.node(id)?];
        while let Some(node) = pending.pop() {
            match &node.kind {
                NodeKind::File(entry) => {
                    for replica in &entry.replicas {
                        if !found.contains(&replica.command) {
                            found.push(replica.command);
                        }
                    }
                }
                NodeKind::Directory(children) => {
                    for child in children.values().rev() {
                        pending.push(self.node(*child)?);
                    }
                }
            }
        }
        Ok(found)
    }

    /// Rebuild the path of a node from its parent links.
    pub fn path_of(&self, id: NodeId) -> Result<Path> {
        let mut names = Vec::new();
        let mut current = self.node(id)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = self.node(parent)?;
        }
        names.reverse();
        Path::from_components(names)
    }
}

fn not_found(path: &Path) -> Error {
    Error::NotFound(format!("{} does not exist", path))
}

// =============================================================================
// Tests
// =============================================================================
