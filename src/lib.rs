//! treefs - Distributed File Store
//!
//! One naming service keeps the directory tree, the locks and the placement
//! of every file; any number of storage servers keep the bytes. Clients ask
//! the naming service where a file lives and then talk to that storage server
//! directly.
//!
//! # Architecture
//!
//! ```text
//!   Client ──Service──► NamingServer ◄──Registration── StorageServer
//!     │                      │                              ▲
//!     │                      └──────────Command─────────────┤
//!     └──────────────────────Storage────────────────────────┘
//! ```
//!
//! Every arrow is a remote contract carried by the [`rpc`] layer: one TCP
//! connection per call, bincode on the wire.
//!
//! # Modules
//!
//! - [`path`] - Distributed file system paths
//! - [`rpc`] - Stubs, skeletons and dispatch tables
//! - [`naming`] - Tree, locking, replication and registration
//! - [`storage`] - Local file storage served to clients and the naming service
//! - [`config`] - Server settings
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus counters

pub mod config;
pub mod error;
pub mod metrics;
pub mod naming;
pub mod path;
pub mod rpc;
pub mod storage;

// Re-export commonly used types
pub use config::{NamingConfig, StorageConfig};
pub use error::{Error, Result};
pub use naming::{NamingServer, NamingService, Registration, RegistrationStub, Service, ServiceStub};
pub use path::Path;
pub use storage::{Command, CommandStub, LocalStore, Storage, StorageServer, StorageStub};
