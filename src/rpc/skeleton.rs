//! Skeleton - server endpoint
//!
//! Binds an address, accepts connections until stopped, and services each
//! connection on its own task: read one request, dispatch it, write one
//! response, close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::DispatchTable;
use super::wire::{self, RpcRequest, RpcResponse};
use crate::error::{Error, Result};

/// Pause after a failed accept so a persistent error, such as running out of
/// file descriptors, does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Running {
    shutdown: CancellationToken,
    accept_loop: JoinHandle<()>,
}

/// Server endpoint for one contract implemented by `H`.
pub struct Skeleton<H> {
    handler: Arc<H>,
    table: Arc<DispatchTable<H>>,
    bind_addr: SocketAddr,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    running: Mutex<Option<Running>>,
}

impl<H> Skeleton<H>
where
    H: Send + Sync + 'static,
{
    /// Create a skeleton that will listen on `bind_addr` once started. Port 0
    /// asks the system for a free port.
    pub fn new(table: DispatchTable<H>, handler: Arc<H>, bind_addr: SocketAddr) -> Self {
        Self {
            handler,
            table: Arc::new(table),
            bind_addr,
            local_addr: parking_lot::Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    pub fn interface(&self) -> &'static str {
        self.table.interface()
    }

    /// Address the skeleton is (or was last) listening on.
    pub fn address(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bind the listening socket and start accepting calls.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::IllegalState(format!(
                "{} skeleton is already running",
                self.interface()
            )));
        }

        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            Error::Rpc(format!("failed to bind {}: {}", self.bind_addr, e))
        })?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        let shutdown = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            self.table.clone(),
            self.handler.clone(),
            shutdown.clone(),
        ));

        info!(interface = self.interface(), %addr, "Skeleton listening");
        *running = Some(Running {
            shutdown,
            accept_loop,
        });
        Ok(addr)
    }

    /// Close the listening socket. Calls already being serviced run to
    /// completion.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.shutdown.cancel();
        if let Err(e) = running.accept_loop.await {
            warn!(interface = self.interface(), "Accept loop ended abnormally: {}", e);
        }
        info!(interface = self.interface(), "Skeleton stopped");
    }
}

async fn accept_loop<H>(
    listener: TcpListener,
    table: Arc<DispatchTable<H>>,
    handler: Arc<H>,
    shutdown: CancellationToken,
) where
    H: Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let table = table.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service(stream, table, handler).await {
                            debug!(%peer, "Failed to service call: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!(interface = table.interface(), "Accept error: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            },
        }
    }
}

async fn service<H>(
    mut stream: TcpStream,
    table: Arc<DispatchTable<H>>,
    handler: Arc<H>,
) -> Result<()>
where
    H: Send + Sync + 'static,
{
    let response = match wire::read_message::<_, RpcRequest>(&mut stream).await {
        Ok(request) => table.dispatch(handler, request).await,
        Err(e) => RpcResponse::Failure(e.to_string()),
    };
    wire::write_message(&mut stream, &response).await
}
