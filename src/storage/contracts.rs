//! Storage server contracts
//!
//! [`Storage`] is the data plane clients use directly; [`Command`] is the
//! control plane the naming service drives to create, delete and replicate
//! files. Both are served by every storage server on separate ports.

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;

use crate::error::Result;
use crate::path::Path;
use crate::rpc::stub::remote_stub;
use crate::rpc::wire::{decode_arg, encode};
use crate::rpc::DispatchTable;

/// Data-plane contract.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Length of a file in bytes.
    ///
    /// Fails with `NotFound` if the file is missing or is a directory.
    async fn size(&self, file: &Path) -> Result<u64>;

    /// Read `length` bytes starting at `offset`.
    ///
    /// Fails with `NotFound` if the file is missing or is a directory, and
    /// with `Range` if the range extends past the end of the file.
    async fn read(&self, file: &Path, offset: u64, length: u32) -> Result<Bytes>;

    /// Write `data` at `offset`, extending the file if needed.
    ///
    /// Fails with `NotFound` if the file is missing or is a directory.
    async fn write(&self, file: &Path, offset: u64, data: Bytes) -> Result<()>;
}

/// Control-plane contract.
#[async_trait]
pub trait Command: Send + Sync {
    /// Create an empty file, creating parent directories as needed. Returns
    /// false for the root or when something already exists at `file`.
    async fn create(&self, file: &Path) -> Result<bool>;

    /// Delete a file or a directory tree. Returns false for the root, for a
    /// missing path, or when any removal fails.
    async fn delete(&self, path: &Path) -> Result<bool>;

    /// Replace the local copy of `file` with the contents held by `server`.
    async fn copy(&self, file: &Path, server: StorageStub) -> Result<bool>;
}

// =============================================================================
// Dispatch
// =============================================================================

/// Operation table for a [`Storage`] implementation.
pub fn storage_table<H>() -> DispatchTable<H>
where
    H: Storage + 'static,
{
    DispatchTable::<H>::new(StorageStub::INTERFACE)
        .route("size", &["Path"], |h, args| {
            async move {
                let file: Path = decode_arg(&args, 0)?;
                encode(&h.size(&file).await?)
            }
            .boxed()
        })
        .route("read", &["Path", "u64", "u32"], |h, args| {
            async move {
                let file: Path = decode_arg(&args, 0)?;
                let offset: u64 = decode_arg(&args, 1)?;
                let length: u32 = decode_arg(&args, 2)?;
                encode(&h.read(&file, offset, length).await?)
            }
            .boxed()
        })
        .route("write", &["Path", "u64", "Bytes"], |h, args| {
            async move {
                let file: Path = decode_arg(&args, 0)?;
                let offset: u64 = decode_arg(&args, 1)?;
                let data: Bytes = decode_arg(&args, 2)?;
                encode(&h.write(&file, offset, data).await?)
            }
            .boxed()
        })
}

/// Operation table for a [`Command`] implementation.
pub fn command_table<H>() -> DispatchTable<H>
where
    H: Command + 'static,
{
    DispatchTable::<H>::new(CommandStub::INTERFACE)
        .route("create", &["Path"], |h, args| {
            async move {
                let file: Path = decode_arg(&args, 0)?;
                encode(&h.create(&file).await?)
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
        .route("copy", &["Path", "StorageStub"], |h, args| {
            async move {
                let file: Path = decode_arg(&args, 0)?;
                let server: StorageStub = decode_arg(&args, 1)?;
                encode(&h.copy(&file, server).await?)
            }
            .boxed()
        })
}

// =============================================================================
// Stubs
// =============================================================================

remote_stub!(
    /// Client-side handle to a storage server's data plane.
    StorageStub,
    "storage.Storage"
);

remote_stub!(
    /// Naming-side handle to a storage server's control plane.
    CommandStub,
    "storage.Command"
);

#[async_trait]
impl Storage for StorageStub {
    async fn size(&self, file: &Path) -> Result<u64> {
        self.call("size", &["Path"], vec![encode(file)?]).await
    }

    async fn read(&self, file: &Path, offset: u64, length: u32) -> Result<Bytes> {
        self.call(
            "read",
            &["Path", "u64", "u32"],
            vec![encode(file)?, encode(&offset)?, encode(&length)?],
        )
        .await
    }

    async fn write(&self, file: &Path, offset: u64, data: Bytes) -> Result<()> {
        self.call(
            "write",
            &["Path", "u64", "Bytes"],
            vec![encode(file)?, encode(&offset)?, encode(&data)?],
        )
        .await
    }
}

#[async_trait]
impl Command for CommandStub {
    async fn create(&self, file: &Path) -> Result<bool> {
        self.call("create", &["Path"], vec![encode(file)?]).await
    }

    async fn delete(&self, path: &Path) -> Result<bool> {
        self.call("delete", &["Path"], vec![encode(path)?]).await
    }

    async fn copy(&self, file: &Path, server: StorageStub) -> Result<bool> {
        self.call("copy", &["Path", "StorageStub"], vec![encode(file)?, encode(&server)?])
            .await
    }
}
