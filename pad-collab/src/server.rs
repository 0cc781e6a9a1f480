//! Pad server: one replica of the collaborative document service.
//!
//! Architecture:
//! ```text
//!   put_commit ──► Replica::propose(Put) ──► Paxos ◄──► other peers
//!                        │                      │      (TcpTransport / RpcServer)
//!   get_commit ◄── DocumentEngine ◄── Replica::run (decided slots, in order)
//!   initial_state        │
//!                        └──► PersistenceWorker ──► DocumentStore (RocksDB)
//! ```
//!
//! Startup sequence:
//! 1. bind the consensus listener
//! 2. open the store, restore persisted documents and the log checkpoint
//! 3. ask the cluster for its Min(); resume after the checkpoint, or catch up
//!    through a sync reply if the cluster released slots this peer never applied
//! 4. start the log driver, propose this peer's Sync
//! 5. wait until every peer has a Sync applied at or after ours
//! 6. start the persistence worker
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 9

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{info, warn};
use pad_core::{Commit, DocumentEngine, DocumentError, DocumentSnapshot, EngineStats};
use pad_paxos::{
    LocalNetwork, Paxos, PaxosStats, PeerId, ProtocolError, RpcHandler, RpcServer, Seq,
    TcpTransport,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, ServerConfig};
use crate::op::Operation;
use crate::replica::{Replica, ReplicaError, ReplicaStats};
use crate::storage::{
    DocumentStore, PersistenceStats, PersistenceWorker, StateSource, StoreConfig, StoreError,
};

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub paxos: PaxosStats,
    pub replica: ReplicaStats,
    pub engine: EngineStats,
    pub persistence: Option<PersistenceStats>,
}

/// A running replica.
pub struct PadServer {
    me: PeerId,
    paxos: Arc<Paxos<Operation>>,
    replica: Arc<Replica>,
    engine: Arc<DocumentEngine>,
    persistence: Option<Arc<PersistenceWorker>>,
    rpc_addr: Option<SocketAddr>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PadServer {
    /// Start a peer that talks to the others over TCP.
    pub async fn start(config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        let listener = RpcServer::bind(config.listen_addr()?).await?;
        let rpc_addr = listener.local_addr().ok();

        let transport: Arc<TcpTransport<Operation>> =
            Arc::new(TcpTransport::new(config.peers.clone()));
        let paxos = Paxos::new(config.me, config.peers.len(), transport, config.paxos.clone());
        let handler: Arc<dyn RpcHandler<Operation>> = paxos.clone();
        let rpc = tokio::spawn(listener.serve(handler, paxos.shutdown_signal()));

        Self::boot(config, paxos, vec![rpc], rpc_addr).await
    }

    /// Start a peer attached to an in-process network.
    pub async fn start_local(
        config: ServerConfig,
        network: LocalNetwork<Operation>,
    ) -> Result<Arc<Self>, ServerError> {
        config.validate()?;
        let paxos = Paxos::new(
            config.me,
            config.peers.len(),
            network.endpoint(config.me),
            config.paxos.clone(),
        );
        network.register(config.me, &paxos);
        Self::boot(config, paxos, Vec::new(), None).await
    }

    async fn boot(
        config: ServerConfig,
        paxos: Arc<Paxos<Operation>>,
        mut tasks: Vec<JoinHandle<()>>,
        rpc_addr: Option<SocketAddr>,
    ) -> Result<Arc<Self>, ServerError> {
        let me = config.me;
        let peers = config.peers.len();
        let engine = Arc::new(DocumentEngine::default());
        let replica = Replica::new(Arc::clone(&paxos), Arc::clone(&engine), config.replica.clone());

        let (persistence, checkpoint) = match &config.data_dir {
            Some(dir) => {
                let store = Arc::new(DocumentStore::open(StoreConfig::at(dir))?);
                let source: Arc<dyn StateSource> = replica.clone();
                let worker = PersistenceWorker::new(source, store, config.persist_interval);
                let checkpoint = worker.restore()?;
                (Some(worker), checkpoint)
            }
            None => (None, None),
        };

        let floor = paxos.query_min().await;
        replica.resume(checkpoint, floor, config.sync_timeout).await;
        tasks.push(tokio::spawn(Arc::clone(&replica).run()));

        let seq = replica.propose(replica.announcement()).await?;
        info!("peer {me}: sync proposed at slot {seq}, waiting for {peers} peers");
        match tokio::time::timeout(config.sync_timeout, replica.wait_synced(seq, peers)).await {
            Ok(synced) => synced?,
            Err(_) => {
                warn!(
                    "peer {me}: heard from {} of {peers} peers after {:?}, serving anyway",
                    replica.synced().values().filter(|s| **s >= seq).count(),
                    config.sync_timeout
                );
                replica.end_catch_up();
            }
        }

        if let Some(worker) = &persistence {
            tasks.push(tokio::spawn(Arc::clone(worker).run(paxos.shutdown_signal())));
        }

        info!("peer {me}: serving {} documents", engine.len());
        Ok(Arc::new(Self {
            me,
            paxos,
            replica,
            engine,
            persistence,
            rpc_addr,
            tasks: Mutex::new(tasks),
        }))
    }

    // ─── Client API ───────────────────────────────────────────────────

    /// Sequence `commit` into `doc`'s history. Resolves once it has been
    /// applied on this peer; returns the log slot it landed in.
    pub async fn put_commit(&self, doc: &str, commit: Commit) -> Result<Seq, ServerError> {
        let seq = self.replica.propose(Operation::put(doc, commit)).await?;
        self.replica.wait_applied(seq).await?;
        Ok(seq)
    }

    /// Commit `version` of `doc`, waiting until it exists.
    pub async fn get_commit(&self, doc: &str, version: usize) -> Result<Commit, ServerError> {
        Ok(self.engine.read(doc, version).await?)
    }

    /// `(head, text)` of `doc`.
    pub fn initial_state(&self, doc: &str) -> (usize, String) {
        self.engine.get_state(doc)
    }

    /// Read-only images of every document.
    pub fn documents(&self) -> BTreeMap<String, DocumentSnapshot> {
        self.engine.snapshot()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Stop every background task; the persistence worker flushes once more.
    pub async fn shutdown(&self) {
        info!("peer {}: shutting down", self.me);
        self.paxos.kill();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("peer {}: background task ended abnormally: {e}", self.me);
            }
        }
    }

    pub fn me(&self) -> PeerId {
        self.me
    }

    /// Bound consensus address (TCP peers only).
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_addr
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    pub fn engine(&self) -> &Arc<DocumentEngine> {
        &self.engine
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            paxos: self.paxos.stats(),
            replica: self.replica.stats(),
            engine: self.engine.stats(),
            persistence: self.persistence.as_ref().map(|w| w.stats()),
        }
    }
}
