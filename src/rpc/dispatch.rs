//! Dispatch tables
//!
//! Each remote contract provides a table that maps an operation identifier
//! (`name(type,type,...)`) to a typed handler function. The skeleton looks the
//! incoming call up here instead of resolving methods at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use super::wire::{route_key, RpcRequest, RpcResponse};
use crate::error::Result;
use crate::metrics;

/// Future returned by a handler: the encoded return value, or an application
/// error to raise at the caller.
pub type HandlerFuture = BoxFuture<'static, Result<Vec<u8>>>;

/// Typed handler for one operation of a contract implemented by `H`.
pub type Handler<H> = Box<dyn Fn(Arc<H>, Vec<Vec<u8>>) -> HandlerFuture + Send + Sync>;

/// Operation table for one contract.
pub struct DispatchTable<H> {
    interface: &'static str,
    routes: HashMap<String, Handler<H>>,
}

impl<H> DispatchTable<H>
where
    H: Send + Sync + 'static,
{
    /// Create an empty table for the named contract.
    pub fn new(interface: &'static str) -> Self {
        Self {
            interface,
            routes: HashMap::new(),
        }
    }

    /// Register the handler for `operation` with the given argument types.
    pub fn route<F>(mut self, operation: &str, signature: &[&str], handler: F) -> Self
    where
        F: Fn(Arc<H>, Vec<Vec<u8>>) -> HandlerFuture + Send + Sync + 'static,
    {
        self.routes
            .insert(route_key(operation, signature), Box::new(handler));
        self
    }

    pub fn interface(&self) -> &'static str {
        self.interface
    }

    /// Number of registered operations
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, operation: &str, signature: &[&str]) -> bool {
        self.routes.contains_key(&route_key(operation, signature))
    }

    /// Run one call against `handler` and produce the reply.
    pub async fn dispatch(&self, handler: Arc<H>, request: RpcRequest) -> RpcResponse {
        if request.interface != self.interface {
            metrics::record_call(self.interface, metrics::Outcome::Failed);
            return RpcResponse::Failure(format!(
                "endpoint serves {}, not {}",
                self.interface, request.interface
            ));
        }

        let route = request.route();
        let Some(op) = self.routes.get(&route) else {
            metrics::record_call(self.interface, metrics::Outcome::Failed);
            return RpcResponse::Failure(format!(
                "{} has no operation {}",
                self.interface, route
            ));
        };

        debug!(interface = self.interface, %route, "Dispatching call");
        match op(handler, request.args).await {
            Ok(value) => {
                metrics::record_call(self.interface, metrics::Outcome::Returned);
                RpcResponse::Return(value)
            }
            Err(err) => {
                metrics::record_call(self.interface, metrics::Outcome::Raised);
                RpcResponse::Raise(err)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
