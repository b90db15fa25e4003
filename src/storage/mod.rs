//! Storage Server
//!
//! Holds file data on a local directory and exposes it through two
//! contracts:
//!
//! - **Storage** - `size`, `read`, `write`; used by clients for direct I/O
//! - **Command** - `create`, `delete`, `copy`; used by the naming service to
//!   keep replicas consistent
//!
//! At startup a server scans its root, registers the file list with the
//! naming service, and removes local copies the naming service reports as
//! redundant.

mod contracts;
pub mod scan;
mod server;

pub use contracts::{command_table, storage_table, Command, CommandStub, Storage, StorageStub};
pub use server::{LocalStore, StorageServer};
