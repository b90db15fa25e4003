//! Client stubs
//!
//! A stub is a plain value holding the address of a skeleton. Each remote
//! method opens a fresh connection, sends one request and waits for one
//! reply. Identity (equality, hashing, display) is local and never touches
//! the network.

use std::net::{SocketAddr, ToSocketAddrs};

use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tracing::trace;

use super::skeleton::Skeleton;
use super::wire::{self, RpcRequest, RpcResponse};
use crate::error::{Error, Result};

/// Perform one remote call against `addr`.
pub async fn invoke<R>(
    addr: SocketAddr,
    interface: &str,
    operation: &str,
    signature: &[&str],
    args: Vec<Vec<u8>>,
) -> Result<R>
where
    R: DeserializeOwned,
{
    trace!(%addr, interface, operation, "Remote call");
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::Rpc(format!("connect to {} failed: {}", addr, e)))?;

    let request = RpcRequest {
        interface: interface.to_string(),
        operation: operation.to_string(),
        signature: signature.iter().map(|s| s.to_string()).collect(),
        args,
    };
    wire::write_message(&mut stream, &request).await?;

    match wire::read_message::<_, RpcResponse>(&mut stream).await? {
        RpcResponse::Return(bytes) => wire::decode(&bytes),
        RpcResponse::Raise(err) => Err(err),
        RpcResponse::Failure(message) => Err(Error::Rpc(message)),
    }
}

/// Address of a started skeleton.
pub fn skeleton_address<H>(skeleton: &Skeleton<H>) -> Result<SocketAddr>
where
    H: Send + Sync + 'static,
{
    skeleton.address().ok_or_else(|| {
        Error::IllegalState(format!(
            "{} skeleton has not been started",
            skeleton.interface()
        ))
    })
}

/// Address of a started skeleton as reachable under `hostname`.
pub fn advertised_address<H>(skeleton: &Skeleton<H>, hostname: &str) -> Result<SocketAddr>
where
    H: Send + Sync + 'static,
{
    let port = skeleton_address(skeleton)?.port();
    resolve(hostname, port)
}

/// Resolve `hostname:port` to the first matching socket address.
pub fn resolve(hostname: &str, port: u16) -> Result<SocketAddr> {
    (hostname, port)
        .to_socket_addrs()
        .map_err(|e| Error::AddressResolution(format!("{}:{} ({})", hostname, port, e)))?
        .next()
        .ok_or_else(|| Error::AddressResolution(format!("{}:{}", hostname, port)))
}

/// Declare a stub type for a contract: an address-only value with local
/// identity and the standard constructors.
macro_rules! remote_stub {
    ($(#[$meta:meta])* $name:ident, $interface:expr) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name {
            addr: std::net::SocketAddr,
        }

        impl $name {
            /// Contract name carried in every request.
            pub const INTERFACE: &'static str = $interface;

            /// Stub for a skeleton listening on `addr`.
            pub fn new(addr: std::net::SocketAddr) -> Self {
                Self { addr }
            }

            /// Stub for a started skeleton.
            pub fn from_skeleton<H>(
                skeleton: &$crate::rpc::Skeleton<H>,
            ) -> $crate::error::Result<Self>
            where
                H: Send + Sync + 'static,
            {
                Ok(Self::new($crate::rpc::stub::skeleton_address(skeleton)?))
            }

            /// Stub for a started skeleton, reachable under `hostname`.
            pub fn from_skeleton_at<H>(
                skeleton: &$crate::rpc::Skeleton<H>,
                hostname: &str,
            ) -> $crate::error::Result<Self>
            where
                H: Send + Sync + 'static,
            {
                Ok(Self::new($crate::rpc::stub::advertised_address(
                    skeleton, hostname,
                )?))
            }

            /// Stub for `hostname:port`.
            pub fn connect(hostname: &str, port: u16) -> $crate::error::Result<Self> {
                Ok(Self::new($crate::rpc::stub::resolve(hostname, port)?))
            }

            pub fn address(&self) -> std::net::SocketAddr {
                self.addr
            }

            async fn call<R>(
                &self,
                operation: &str,
                signature: &[&str],
                args: Vec<Vec<u8>>,
            ) -> $crate::error::Result<R>
            where
                R: serde::de::DeserializeOwned,
            {
                $crate::rpc::stub::invoke(self.addr, Self::INTERFACE, operation, signature, args)
                    .await
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}@{}", Self::INTERFACE, self.addr)
            }
        }
    };
}

pub(crate) use remote_stub;

// =============================================================================
// Tests
// =============================================================================
