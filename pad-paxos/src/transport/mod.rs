//! How consensus RPCs reach other peers.
//!
//! ```text
//! ┌──────────┐  Transport::call   ┌──────────────┐  RpcHandler::handle  ┌──────────┐
//! │ Proposer │ ─────────────────► │ TcpTransport │ ───── TCP ─────────► │ Paxos    │
//! │ (peer i) │                    │ LocalNetwork │ ──── in-proc ──────► │ (peer j) │
//! └──────────┘                    └──────────────┘                      └──────────┘
//! ```
//!
//! A call that cannot be completed resolves to `None`: the peer simply
//! contributes no vote. Nothing is retried at this layer.

pub mod local;
pub mod tcp;

use futures_util::future::BoxFuture;

use crate::protocol::{Request, Response};
use crate::types::PeerId;

pub use local::{LocalEndpoint, LocalNetwork};
pub use tcp::{RpcServer, TcpTransport};

/// Server side of the RPC layer. Handlers never block on I/O.
pub trait RpcHandler<V>: Send + Sync {
    fn handle(&self, request: Request<V>) -> Response<V>;
}

/// Client side of the RPC layer.
pub trait Transport<V>: Send + Sync {
    /// Send `request` to `peer`. `None` if the peer could not be reached or
    /// the reply was lost.
    fn call(&self, peer: PeerId, request: Request<V>) -> BoxFuture<'static, Option<Response<V>>>;
}
