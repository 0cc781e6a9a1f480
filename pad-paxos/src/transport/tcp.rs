//! TCP transport: one short-lived connection per call, length-prefixed
//! bincode frames both ways.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{RpcHandler, Transport};
use crate::protocol::{read_frame, write_frame, ProtocolError, Request, Response};
use crate::types::{PaxosValue, PeerId};

/// Dials peers by address.
pub struct TcpTransport<V> {
    peers: Arc<Vec<String>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> TcpTransport<V> {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers: Arc::new(peers),
            _value: PhantomData,
        }
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<&str> {
        self.peers.get(peer).map(String::as_str)
    }
}

impl<V: PaxosValue> TcpTransport<V> {
    async fn exchange(addr: &str, request: &Request<V>) -> Result<Response<V>, ProtocolError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, request).await?;
        read_frame(&mut stream)
            .await?
            .ok_or(ProtocolError::ConnectionClosed)
    }
}

impl<V: PaxosValue> Transport<V> for TcpTransport<V> {
    fn call(&self, peer: PeerId, request: Request<V>) -> BoxFuture<'static, Option<Response<V>>> {
        let addr = self.peers.get(peer).cloned();
        async move {
            let addr = addr?;
            match Self::exchange(&addr, &request).await {
                Ok(response) => Some(response),
                Err(e) => {
                    debug!("RPC to {addr} failed: {e}");
                    None
                }
            }
        }
        .boxed()
    }
}

/// Accept loop serving consensus RPCs for one peer.
pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    pub async fn bind(addr: &str) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` flips to true. Each connection gets its own task.
    pub async fn serve<V: PaxosValue>(
        self,
        handler: Arc<dyn RpcHandler<V>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Consensus RPC listening on {addr}");
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler).await {
                                debug!("RPC connection {peer_addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {e}"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Consensus RPC listener stopped");
    }
}

async fn serve_connection<V: PaxosValue>(
    mut stream: TcpStream,
    handler: Arc<dyn RpcHandler<V>>,
) -> Result<(), ProtocolError> {
    stream.set_nodelay(true)?;
    while let Some(request) = read_frame::<_, Request<V>>(&mut stream).await? {
        let response = handler.handle(request);
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}
