//! Remote Call Transport
//!
//! Connection-per-call request/response layer shared by every remote
//! contract in the system.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   connect, RpcRequest, half-close   ┌──────────────────┐
//! │  XxxStub     │ ──────────────────────────────────▶ │  Skeleton<H>     │
//! │  (address)   │                                     │  accept loop     │
//! │              │ ◀────────────────────────────────── │  task per conn   │
//! └──────────────┘        RpcResponse, close           │  DispatchTable<H>│
//!                                                      └──────────────────┘
//! ```
//!
//! - [`wire`] - request/response envelopes and the bincode stream codec
//! - [`dispatch`] - per-contract operation tables of typed handlers
//! - [`skeleton`] - server endpoint lifecycle and per-connection service
//! - [`stub`] - client call path and the stub declaration macro
//!
//! Every remote operation may fail with [`Error::Rpc`](crate::Error::Rpc)
//! when the transport itself fails; errors raised by a handler are carried
//! back and returned unchanged.

pub mod dispatch;
pub mod skeleton;
pub mod stub;
pub mod wire;

pub use dispatch::{DispatchTable, Handler, HandlerFuture};
pub use skeleton::Skeleton;
pub use wire::{RpcRequest, RpcResponse};
