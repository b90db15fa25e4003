//! Server configuration
//!
//! Library-level settings for both server roles. The binary fills these from
//! command-line flags and environment variables; tests use the defaults with
//! loopback addresses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Well-known port of the naming service's client contract.
pub const SERVICE_PORT: u16 = 6000;

/// Well-known port of the naming service's registration contract.
pub const REGISTRATION_PORT: u16 = 6001;

/// Shared lock requests on a file after which it is replicated.
pub const REPLICATION_THRESHOLD: u64 = 20;

/// Largest chunk moved per read during a replica copy (1 MiB).
pub const DEFAULT_COPY_CHUNK_SIZE: u32 = 1024 * 1024;

// =============================================================================
// Naming Service
// =============================================================================

/// Configuration for the naming server
#[derive(Debug, Clone)]
pub struct NamingConfig {
    /// Address of the client-facing service contract
    pub service_addr: SocketAddr,

    /// Address of the storage registration contract
    pub registration_addr: SocketAddr,

    /// Read count that triggers replication of a file
    pub replication_threshold: u64,
}

impl Default for NamingConfig {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            service_addr: SocketAddr::new(any, SERVICE_PORT),
            registration_addr: SocketAddr::new(any, REGISTRATION_PORT),
            replication_threshold: REPLICATION_THRESHOLD,
        }
    }
}

impl NamingConfig {
    /// Both contracts on `ip`, on system-assigned ports.
    pub fn ephemeral(ip: IpAddr) -> Self {
        Self {
            service_addr: SocketAddr::new(ip, 0),
            registration_addr: SocketAddr::new(ip, 0),
            ..Default::default()
        }
    }
}

// =============================================================================
// Storage Server
// =============================================================================

/// Configuration for a storage server
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Local directory holding this server's files
    pub root: PathBuf,

    /// Interface both contracts bind to; ports are system-assigned
    pub bind_ip: IpAddr,

    /// Hostname published to the naming service for this server
    pub advertise_host: String,

    /// Largest chunk moved per read during a replica copy
    pub copy_chunk_size: u32,
}

impl StorageConfig {
    /// Loopback configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertise_host: "127.0.0.1".to_string(),
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
        }
    }

    /// Check the settings before the server starts.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(Error::Config(format!(
                "storage root {} is not a directory",
                self.root.display()
            )));
        }
        if self.copy_chunk_size == 0 {
            return Err(Error::Config("copy chunk size must be positive".to_string()));
        }
        if self.advertise_host.is_empty() {
            return Err(Error::Config("advertised hostname is empty".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
