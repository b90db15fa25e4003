//! Naming Service
//!
//! Metadata side of the file system:
//!
//! - **Tree** - directories and files, each node with its own lock
//! - **Locking** - readers/writer locks taken root-to-target
//! - **Replication** - frequently read files are copied to more servers;
//!   an exclusive lock cuts a file back to one copy
//! - **Registration** - storage servers announce the files they hold
//!
//! ```text
//!        clients                      storage servers
//!           │                               │
//!     Service (6000)              Registration (6001)
//!           └────────► NamingService ◄───────┘
//!                           │
//!                   Command (create/delete/copy)
//!                           ▼
//!                    storage servers
//! ```

mod contracts;
pub mod lock;
mod server;
mod service;
pub mod tree;

pub use contracts::{
    registration_table, service_table, Registration, RegistrationStub, Service, ServiceStub,
};
pub use lock::{LockManager, LockMode};
pub use server::NamingServer;
pub use service::NamingService;
pub use tree::Replica;
