//! Naming service contracts
//!
//! [`Service`] is what clients call; [`Registration`] is what storage servers
//! call once at startup. Both are served at well-known ports.

use async_trait::async_trait;
use futures::FutureExt;

use crate::config::{REGISTRATION_PORT, SERVICE_PORT};
use crate::error::Result;
use crate::path::Path;
use crate::rpc::stub::remote_stub;
use crate::rpc::wire::{decode_arg, encode};
use crate::rpc::DispatchTable;
use crate::storage::{CommandStub, StorageStub};

/// Client-facing naming contract.
#[async_trait]
pub trait Service: Send + Sync {
    /// True if `path` names a directory. `NotFound` if it does not resolve.
    async fn is_directory(&self, path: &Path) -> Result<bool>;

    /// Names of the entries of a directory. `NotFound` if `directory` does
    /// not resolve or is a file.
    async fn list(&self, directory: &Path) -> Result<Vec<String>>;

    /// Create an empty file on one storage server. Returns false if the name
    /// is taken. `NotFound` if the parent directory does not exist.
    async fn create_file(&self, file: &Path) -> Result<bool>;

    /// Create a directory. Returns false for the root or if the name is
    /// taken. `NotFound` if the parent directory does not exist.
    async fn create_directory(&self, directory: &Path) -> Result<bool>;

    /// Delete a file or a directory tree from the tree and from every storage
    /// server holding it.
    async fn delete(&self, path: &Path) -> Result<bool>;

    /// Data-plane endpoint of a server holding `file`.
    async fn get_storage(&self, file: &Path) -> Result<StorageStub>;

    /// Lock `path` for reading (`exclusive == false`) or writing, locking
    /// every ancestor for reading first. Blocks until granted.
    async fn lock(&self, path: &Path, exclusive: bool) -> Result<()>;

    /// Release a lock taken with [`Service::lock`] with the same arguments.
    async fn unlock(&self, path: &Path, exclusive: bool) -> Result<()>;
}

/// Storage-server registration contract.
#[async_trait]
pub trait Registration: Send + Sync {
    /// Register a storage server and the files it holds. Returns the
    /// announced files that are already stored elsewhere; the caller should
    /// delete its copies.
    async fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        files: Vec<Path>,
    ) -> Result<Vec<Path>>;
}

// =============================================================================
// Dispatch
// =============================================================================

/// Operation table for a [`Service`] implementation.
pub fn service_table<H>() -> DispatchTable<H>
where
    H: Service + 'static,
{
    DispatchTable::<H>::new(ServiceStub::INTERFACE)
        .route("is_directory", &["Path"], |h, args| {
            async move {
                let path: Path = decode_arg(&args, 0)?;
                encode(&h.is_directory(&path).await?)
            }
            .boxed()
        })
        .route("list", &["Path"], |h, args| {
            async move {
                let directory: Path = decode_arg(&args, 0)?;
                encode(&h.list(&directory).await?)
            }
            .boxed()
        })
        .route("create_file", &["Path"], |h, args| {
            async move {
                let file: Path = decode_arg(&args, 0)?;
                encode(&h.create_file(&file).await?)
            }
            .boxed()
        })
        .route("create_directory", &["Path"], |h, args| {
            async move {
                let directory: Path = decode_arg(&args, 0)?;
                encode(&h.create_directory(&directory).await?)
            }
            .boxed()
        })
        .route("delete", &["Path"], |h, args| {
            async move {
                let path: Path = decode_arg(&args, 0)?;
                encode(&h.delete(&path).await?)
            }
            .boxed()
        })
        .route("get_storage", &["Path"], |h, args| {
            async move {
                let file: Path = decode_arg(&args, 0)?;
                encode(&h.get_storage(&file).await?)
            }
            .boxed()
        })
        .route("lock", &["Path", "bool"], |h, args| {
            async move {
                let path: Path = decode_arg(&args, 0)?;
                let exclusive: bool = decode_arg(&args, 1)?;
                encode(&h.lock(&path, exclusive).await?)
            }
            .boxed()
        })
        .route("unlock", &["Path", "bool"], |h, args| {
            async move {
                let path: Path = decode_arg(&args, 0)?;
                let exclusive: bool = decode_arg(&args, 1)?;
                encode(&h.unlock(&path, exclusive).await?)
            }
            .boxed()
        })
}

/// Operation table for a [`Registration`] implementation.
pub fn registration_table<H>() -> DispatchTable<H>
where
    H: Registration + 'static,
{
    DispatchTable::<H>::new(RegistrationStub::INTERFACE).route(
        "register",
        &["StorageStub", "CommandStub", "Vec<Path>"],
        |h, args| {
            async move {
                let storage: StorageStub = decode_arg(&args, 0)?;
                let command: CommandStub = decode_arg(&args, 1)?;
                let files: Vec<Path> = decode_arg(&args, 2)?;
                encode(&h.register(storage, command, files).await?)
            }
            .boxed()
        },
    )
}

// =============================================================================
// Stubs
// =============================================================================

remote_stub!(
    /// Client handle to the naming service.
    ServiceStub,
    "naming.Service"
);

remote_stub!(
    /// Storage-server handle to the naming service's registration contract.
    RegistrationStub,
    "naming.Registration"
);

impl ServiceStub {
    /// Stub for the naming service on `hostname` at the well-known port.
    pub fn well_known(hostname: &str) -> Result<Self> {
        Self::connect(hostname, SERVICE_PORT)
    }
}

impl RegistrationStub {
    /// Stub for the registration contract on `hostname` at the well-known
    /// port.
    pub fn well_known(hostname: &str) -> Result<Self> {
        Self::connect(hostname, REGISTRATION_PORT)
    }
}

#[async_trait]
impl Service for ServiceStub {
    async fn is_directory(&self, path: &Path) -> Result<bool> {
        self.call("is_directory", &["Path"], vec![encode(path)?]).await
    }

    async fn list(&self, directory: &Path) -> Result<Vec<String>> {
        self.call("list", &["Path"], vec![encode(directory)?]).await
    }

    async fn create_file(&self, file: &Path) -> Result<bool> {
        self.call("create_file", &["Path"], vec![encode(file)?]).await
    }

    async fn create_directory(&self, directory: &Path) -> Result<bool> {
        self.call("create_directory", &["Path"], vec![encode(directory)?])
            .await
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        self.call("delete", &["Path"], vec![encode(path)?]).await
    }

    async fn get_storage(&self, file: &Path) -> Result<StorageStub> {
        self.call("get_storage", &["Path"], vec![encode(file)?]).await
    }

    async fn lock(&self, path: &Path, exclusive: bool) -> Result<()> {
        self.call("lock", &["Path", "bool"], vec![encode(path)?, encode(&exclusive)?])
            .await
    }

    async fn unlock(&self, path: &Path, exclusive: bool) -> Result<()> {
        self.call("unlock", &["Path", "bool"], vec![encode(path)?, encode(&exclusive)?])
            .await
    }
}

#[async_trait]
impl Registration for RegistrationStub {
    async fn register(
        &self,
        storage: StorageStub,
        command: CommandStub,
        files: Vec<Path>,
    ) -> Result<Vec<Path>> {
        self.call(
            "register",
            &["StorageStub", "CommandStub", "Vec<Path>"],
            vec![encode(&storage)?, encode(&command)?, encode(&files)?],
        )
        .await
    }
}
