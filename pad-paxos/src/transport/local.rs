//! In-process network for clusters that live in one runtime.
//!
//! Supports the failure modes the protocol has to survive:
//! - isolation: every call to or from an isolated peer is unreachable
//! - unreliable mode: a request may be dropped before it is handled, or
//!   handled with the reply dropped
//!
//! Handlers are held weakly so a dropped peer behaves like a dead one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use rand::Rng;

use super::{RpcHandler, Transport};
use crate::protocol::{Request, Response};
use crate::types::{PaxosValue, PeerId};

/// Probability that an unreliable request is dropped unhandled.
const DROP_REQUEST: f64 = 0.1;
/// Probability that an unreliable request is handled but its reply dropped.
const DROP_REPLY: f64 = 0.1;

struct NetworkInner<V> {
    handlers: RwLock<Vec<Option<Weak<dyn RpcHandler<V>>>>>,
    isolated: RwLock<HashSet<PeerId>>,
    unreliable: RwLock<bool>,
    calls: AtomicU64,
}

/// Shared routing table for an in-process cluster.
pub struct LocalNetwork<V> {
    inner: Arc<NetworkInner<V>>,
}

impl<V> Clone for LocalNetwork<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: PaxosValue> LocalNetwork<V> {
    pub fn new(peers: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                handlers: RwLock::new(vec![None; peers]),
                isolated: RwLock::new(HashSet::new()),
                unreliable: RwLock::new(false),
                calls: AtomicU64::new(0),
            }),
        }
    }

    /// Route calls for `peer` to `handler`.
    pub fn register<H: RpcHandler<V> + 'static>(&self, peer: PeerId, handler: &Arc<H>) {
        let weak: Weak<H> = Arc::downgrade(handler);
        let weak: Weak<dyn RpcHandler<V>> = weak;
        let mut handlers = self.inner.handlers.write();
        if peer >= handlers.len() {
            handlers.resize(peer + 1, None);
        }
        handlers[peer] = Some(weak);
    }

    /// Remove `peer` from the network for good.
    pub fn unregister(&self, peer: PeerId) {
        if let Some(slot) = self.inner.handlers.write().get_mut(peer) {
            *slot = None;
        }
    }

    /// Transport for calls originating at `from`.
    pub fn endpoint(&self, from: PeerId) -> Arc<LocalEndpoint<V>> {
        Arc::new(LocalEndpoint {
            from,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn isolate(&self, peer: PeerId) {
        self.inner.isolated.write().insert(peer);
    }

    pub fn heal(&self, peer: PeerId) {
        self.inner.isolated.write().remove(&peer);
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        *self.inner.unreliable.write() = unreliable;
    }

    /// Number of calls attempted so far (delivered or not).
    pub fn calls(&self) -> u64 {
        self.inner.calls.load(Ordering::Relaxed)
    }
}

/// One peer's view of a [`LocalNetwork`].
pub struct LocalEndpoint<V> {
    from: PeerId,
    inner: Arc<NetworkInner<V>>,
}

impl<V: PaxosValue> LocalEndpoint<V> {
    fn deliver(inner: &NetworkInner<V>, from: PeerId, to: PeerId, request: Request<V>) -> Option<Response<V>> {
        {
            let isolated = inner.isolated.read();
            if isolated.contains(&from) || isolated.contains(&to) {
                return None;
            }
        }
        let unreliable = *inner.unreliable.read();
        if unreliable && rand::thread_rng().gen_bool(DROP_REQUEST) {
            return None;
        }
        let handler = inner.handlers.read().get(to).cloned().flatten()?.upgrade()?;
        let response = handler.handle(request);
        if unreliable && rand::thread_rng().gen_bool(DROP_REPLY) {
            return None;
        }
        Some(response)
    }
}

impl<V: PaxosValue> Transport<V> for LocalEndpoint<V> {
    fn call(&self, peer: PeerId, request: Request<V>) -> BoxFuture<'static, Option<Response<V>>> {
        let inner = Arc::clone(&self.inner);
        let from = self.from;
        inner.calls.fetch_add(1, Ordering::Relaxed);
        async move {
            tokio::task::yield_now().await;
            Self::deliver(&inner, from, peer, request)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        hits: AtomicUsize,
    }

    impl RpcHandler<u32> for Counter {
        fn handle(&self, _request: Request<u32>) -> Response<u32> {
            let n = self.hits.fetch_add(1, Ordering::SeqCst);
            Response::Min(n as u64)
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            hits: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let net: LocalNetwork<u32> = LocalNetwork::new(2);
        let h = counter();
        net.register(1, &h);
        let ep = net.endpoint(0);
        assert!(matches!(ep.call(1, Request::MinQuery).await, Some(Response::Min(0))));
        assert!(matches!(ep.call(1, Request::MinQuery).await, Some(Response::Min(1))));
        assert_eq!(net.calls(), 2);
    }

    #[tokio::test]
    async fn test_isolation_blocks_both_directions() {
        let net: LocalNetwork<u32> = LocalNetwork::new(2);
        let h0 = counter();
        let h1 = counter();
        net.register(0, &h0);
        net.register(1, &h1);

        net.isolate(1);
        assert!(net.endpoint(0).call(1, Request::MinQuery).await.is_none());
        assert!(net.endpoint(1).call(0, Request::MinQuery).await.is_none());
        assert_eq!(h0.hits.load(Ordering::SeqCst), 0);

        net.heal(1);
        assert!(net.endpoint(0).call(1, Request::MinQuery).await.is_some());
    }

    #[tokio::test]
    async fn test_dropped_handler_is_unreachable() {
        let net: LocalNetwork<u32> = LocalNetwork::new(2);
        {
            let h = counter();
            net.register(1, &h);
        }
        assert!(net.endpoint(0).call(1, Request::MinQuery).await.is_none());
    }

    #[tokio::test]
    async fn test_unreliable_drops_some_calls() {
        let net: LocalNetwork<u32> = LocalNetwork::new(2);
        let h = counter();
        net.register(1, &h);
        net.set_unreliable(true);
        let ep = net.endpoint(0);
        let mut delivered = 0;
        for _ in 0..500 {
            if ep.call(1, Request::MinQuery).await.is_some() {
                delivered += 1;
            }
        }
        assert!(delivered < 500);
        assert!(delivered > 250);
    }
}
