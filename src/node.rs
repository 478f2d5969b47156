//! Node assembly: production backends over the stores, the router-backed
//! sender, and the service loop.
//!
//! Each chain owns a serializing lock (held by the router around every
//! engine call); the backends here run under it. Network sends and the
//! timeout table live outside the chain lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::{Bootstrapper, Config as BootstrapConfig, Sender, TxBackend, VertexBackend};
use crate::codec::CodecError;
use crate::config::NodeConfig;
use crate::hash256_parts;
use crate::ids::{Aliaser, Id, ShortId};
use crate::queue::JobQueue;
use crate::router::{ChainRouter, Message, Op};
use crate::shared_memory::{Element, SharedMemory, SharedMemoryError};
use crate::tx::fx::FxRegistry;
use crate::tx::verify::{semantic_verify, TxError, UtxoView, VerifyCtx};
use crate::tx::{Tx, TxCodec};
use crate::utxo::{Utxo, UtxoDb};
use crate::validators::ValidatorSet;
use crate::vertex::store::{StoreError, VertexStore};
use crate::vertex::{Status, Vertex, VertexError};

/// Errors from node assembly.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("database error: {0}")]
    Db(String),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

/// Production [`VertexBackend`] over the chain's [`VertexStore`].
///
/// The chain's accepted frontier lives under the [`Id::EMPTY`] edge key.
pub struct VertexState {
    store: Arc<VertexStore>,
    codec: Arc<TxCodec>,
}

impl VertexState {
    pub fn new(store: Arc<VertexStore>, codec: Arc<TxCodec>) -> Self {
        VertexState { store, codec }
    }
}

impl VertexBackend for VertexState {
    fn parse_and_cache(&mut self, bytes: &[u8]) -> Result<Vertex, VertexError> {
        let vertex = Vertex::parse(&self.codec, bytes)?;
        self.store
            .set_vertex(&vertex.id(), Some(&vertex))
            .map_err(|e| VertexError::Io(e.to_string()))?;
        Ok(vertex)
    }

    fn vertex(&self, id: &Id) -> Result<Option<Vertex>, StoreError> {
        Ok(self.store.vertex(id)?.map(|v| (*v).clone()))
    }

    fn status(&self, id: &Id) -> Result<Status, StoreError> {
        self.store.status(id)
    }

    fn set_status(&mut self, id: &Id, status: Status) -> Result<(), StoreError> {
        self.store.set_status(id, status)
    }

    fn edge(&self) -> Result<Vec<Id>, StoreError> {
        self.store.edge(&Id::EMPTY)
    }

    fn set_edge(&mut self, frontier: Vec<Id>) -> Result<(), StoreError> {
        self.store.set_edge(&Id::EMPTY, frontier)
    }
}

/// Read imported UTXOs out of the chain's shared-memory keyspace.
struct SharedMemoryView<'a> {
    shared: &'a SharedMemory,
    dest_chain: Id,
    codec: &'a TxCodec,
}

impl UtxoView for SharedMemoryView<'_> {
    fn utxo(&self, input_id: &Id) -> Result<Option<Utxo>, TxError> {
        let elements = self
            .shared
            .get(&self.dest_chain, &[input_id.as_bytes().to_vec()])
            .map_err(|e| TxError::Io(e.to_string()))?;
        match elements.into_iter().next().flatten() {
            Some(element) => Ok(Some(Utxo::decode(self.codec, &element.value)?)),
            None => Ok(None),
        }
    }
}

/// Production [`TxBackend`]: semantic verification against the UTXO set and
/// shared memory, with atomic commits.
pub struct TxState {
    chain_id: Id,
    store: Arc<VertexStore>,
    utxos: UtxoDb,
    state_tree: sled::Tree,
    shared: Arc<SharedMemory>,
    codec: Arc<TxCodec>,
    fxs: Arc<FxRegistry>,
    ctx: VerifyCtx,
}

impl TxState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: Id,
        store: Arc<VertexStore>,
        utxos: UtxoDb,
        state_tree: sled::Tree,
        shared: Arc<SharedMemory>,
        codec: Arc<TxCodec>,
        fxs: Arc<FxRegistry>,
        ctx: VerifyCtx,
    ) -> Self {
        TxState {
            chain_id,
            store,
            utxos,
            state_tree,
            shared,
            codec,
            fxs,
            ctx,
        }
    }

    fn export_elements(&self, utxos: &[Utxo]) -> Result<Vec<Element>, TxError> {
        utxos
            .iter()
            .map(|utxo| {
                Ok(Element {
                    key: utxo.input_id().as_bytes().to_vec(),
                    value: utxo.encode(&self.codec)?,
                    traits: utxo
                        .out
                        .owners()
                        .addrs
                        .iter()
                        .map(|addr| addr.as_bytes().to_vec())
                        .collect(),
                })
            })
            .collect()
    }
}

impl TxBackend for TxState {
    fn parse_tx(&self, bytes: &[u8]) -> Result<Tx, CodecError> {
        self.codec.parse_tx(bytes)
    }

    fn tx_status(&self, id: &Id) -> Result<Status, StoreError> {
        self.store.status(id)
    }

    fn accept_tx(&mut self, tx: &Tx) -> Result<(), TxError> {
        let shared_view = SharedMemoryView {
            shared: &self.shared,
            dest_chain: self.chain_id,
            codec: &self.codec,
        };
        let effects = semantic_verify(
            &self.codec,
            &self.fxs,
            tx,
            &self.utxos,
            Some(&shared_view),
            &self.ctx,
        )?;

        if effects.imported.is_empty() {
            self.utxos.commit(&effects.delta)?;
        } else {
            // Consuming the imported elements and writing our own state is
            // one transaction: an element is consumable at most once.
            let batch = self.utxos.stage(&effects.delta)?;
            let keys: Vec<Vec<u8>> = effects
                .imported
                .iter()
                .map(|id| id.as_bytes().to_vec())
                .collect();
            self.shared
                .consume_with(&self.chain_id, &keys, &self.state_tree, &batch)
                .map_err(|err| match err {
                    SharedMemoryError::MissingElement(key) => {
                        TxError::MissingUtxo(Id::from_slice(&hex::decode(&key).unwrap_or_default())
                            .unwrap_or(Id::EMPTY))
                    }
                    other => TxError::Io(other.to_string()),
                })?;
        }

        if let Some(dest_chain) = effects.dest_chain {
            if !effects.exported.is_empty() {
                let elements = self.export_elements(&effects.exported)?;
                self.shared
                    .put(&dest_chain, &elements)
                    .map_err(|e| TxError::Io(e.to_string()))?;
            }
        }

        self.store
            .set_status(&tx.id(), Status::Accepted)
            .map_err(|e| TxError::Io(e.to_string()))?;
        Ok(())
    }

    fn reject_tx(&mut self, id: &Id) -> Result<(), StoreError> {
        self.store.set_status(id, Status::Rejected)
    }
}

/// [`Sender`] minting request IDs, registering timeouts, and pushing wire
/// messages onto the outbound channel.
pub struct RouterSender {
    chain_id: Id,
    router: Arc<ChainRouter>,
    outbound: mpsc::UnboundedSender<(ShortId, Message)>,
    next_request_id: u32,
}

impl RouterSender {
    pub fn new(
        chain_id: Id,
        router: Arc<ChainRouter>,
        outbound: mpsc::UnboundedSender<(ShortId, Message)>,
    ) -> Self {
        RouterSender {
            chain_id,
            router,
            outbound,
            next_request_id: 0,
        }
    }

    fn request(&mut self, peer: ShortId, op: Op) -> (u32, u64) {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let now = Instant::now();
        let deadline = self
            .router
            .register_request(peer, self.chain_id, request_id, op, now);
        (request_id, (deadline - now).as_millis() as u64)
    }

    fn ship(&self, peer: ShortId, msg: Message) {
        if self.outbound.send((peer, msg)).is_err() {
            warn!(chain = %self.chain_id, %peer, "outbound channel closed, dropping message");
        }
    }
}

impl Sender for RouterSender {
    fn send_get_accepted_frontier(&mut self, peer: ShortId) -> u32 {
        let (request_id, deadline_ms) = self.request(peer, Op::GetAcceptedFrontier);
        self.ship(
            peer,
            Message::GetAcceptedFrontier {
                chain_id: self.chain_id,
                request_id,
                deadline_ms,
            },
        );
        request_id
    }

    fn send_accepted_frontier(&mut self, peer: ShortId, request_id: u32, frontier: Vec<Id>) {
        self.ship(
            peer,
            Message::AcceptedFrontier {
                chain_id: self.chain_id,
                request_id,
                container_ids: frontier,
            },
        );
    }

    fn send_get_accepted(&mut self, peer: ShortId, candidates: Vec<Id>) -> u32 {
        let (request_id, deadline_ms) = self.request(peer, Op::GetAccepted);
        self.ship(
            peer,
            Message::GetAccepted {
                chain_id: self.chain_id,
                request_id,
                deadline_ms,
                container_ids: candidates,
            },
        );
        request_id
    }

    fn send_accepted(&mut self, peer: ShortId, request_id: u32, accepted: Vec<Id>) {
        self.ship(
            peer,
            Message::Accepted {
                chain_id: self.chain_id,
                request_id,
                container_ids: accepted,
            },
        );
    }

    fn send_get_ancestors(&mut self, peer: ShortId, vtx_id: Id) -> u32 {
        let (request_id, deadline_ms) = self.request(peer, Op::GetAncestors);
        self.ship(
            peer,
            Message::GetAncestors {
                chain_id: self.chain_id,
                request_id,
                deadline_ms,
                container_id: vtx_id,
            },
        );
        request_id
    }

    fn send_multi_put(&mut self, peer: ShortId, request_id: u32, containers: Vec<Vec<u8>>) {
        self.ship(
            peer,
            Message::MultiPut {
                chain_id: self.chain_id,
                request_id,
                containers,
            },
        );
    }

    fn send_get(&mut self, peer: ShortId, vtx_id: Id) -> u32 {
        let (request_id, deadline_ms) = self.request(peer, Op::Get);
        self.ship(
            peer,
            Message::Get {
                chain_id: self.chain_id,
                request_id,
                deadline_ms,
                container_id: vtx_id,
            },
        );
        request_id
    }

    fn send_put(&mut self, peer: ShortId, request_id: u32, vtx_id: Id, container: Vec<u8>) {
        self.ship(
            peer,
            Message::Put {
                chain_id: self.chain_id,
                request_id,
                container_id: vtx_id,
                container,
            },
        );
    }
}

/// A running node: router, chains, and the service loop.
pub struct Node {
    router: Arc<ChainRouter>,
    outbound: mpsc::UnboundedReceiver<(ShortId, Message)>,
    cancel: CancellationToken,
    bootstrapped: Arc<AtomicBool>,
    pub aliaser: Aliaser,
    pub primary_chain: Id,
}

impl Node {
    /// Assemble a node from configuration: open storage, build the primary
    /// exchange chain, and register it with the router.
    pub fn open(config: &NodeConfig, data_dir: &std::path::Path) -> Result<Node, NodeError> {
        let db = sled::open(data_dir.join("state")).map_err(|e| NodeError::Db(e.to_string()))?;
        Self::assemble(config, db)
    }

    /// Assemble against a temporary database (tests and dry runs).
    pub fn open_temporary(config: &NodeConfig) -> Result<Node, NodeError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| NodeError::Db(e.to_string()))?;
        Self::assemble(config, db)
    }

    fn assemble(config: &NodeConfig, db: sled::Db) -> Result<Node, NodeError> {
        let network_id = config.network.network_id;
        let chain_id = Id(hash256_parts(&[
            b"starling.chain.exchange",
            &network_id.to_be_bytes(),
        ]));
        let fee_asset = Id(hash256_parts(&[
            b"starling.asset.primary",
            &network_id.to_be_bytes(),
        ]));

        let mut aliaser = Aliaser::new();
        aliaser.alias(chain_id, "X");

        let codec = Arc::new(TxCodec::new());
        let fxs = Arc::new(FxRegistry::standard());
        // Shared memory lives in the same database as chain state so the
        // import commit can span both keyspaces in one transaction.
        let shared = Arc::new(SharedMemory::new(db.clone()));

        let state_tree = db
            .open_tree(format!("chain-{}", hex::encode(chain_id.as_bytes())))
            .map_err(|e| NodeError::Db(e.to_string()))?;
        let store = Arc::new(VertexStore::new(state_tree.clone(), Arc::clone(&codec)));
        let utxos = UtxoDb::new(state_tree.clone(), Arc::clone(&codec));

        // Initial stakers double as bootstrap beacons, all at min stake.
        let beacons = ValidatorSet::new();
        for staker in config.genesis.parsed_staker_ids() {
            beacons.add_weight(staker, config.network.min_stake, 0, u64::MAX);
        }
        let beacons = beacons.snapshot();

        let verify_ctx = VerifyCtx {
            network_id,
            chain_id,
            fee_asset,
            tx_fee: config.network.tx_fee,
            min_stake: config.network.min_stake,
            current_time: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };

        let vtx_queue_tree = db
            .open_tree(format!("vtx-jobs-{}", hex::encode(chain_id.as_bytes())))
            .map_err(|e| NodeError::Db(e.to_string()))?;
        let tx_queue_tree = db
            .open_tree(format!("tx-jobs-{}", hex::encode(chain_id.as_bytes())))
            .map_err(|e| NodeError::Db(e.to_string()))?;
        let store_for_resolve = Arc::clone(&store);
        let codec_for_resolve = Arc::clone(&codec);
        let resolve = move |record: &crate::queue::JobRecord| {
            // Deps whose status is already Accepted have landed.
            let mut missing = std::collections::HashSet::new();
            if record.kind == crate::bootstrap::JOB_KIND_TX {
                if let Ok(tx) = codec_for_resolve.parse_tx(&record.payload) {
                    for dep in tx.unsigned.dependencies() {
                        if store_for_resolve.status(&dep).unwrap_or(Status::Unknown)
                            != Status::Accepted
                        {
                            missing.insert(dep);
                        }
                    }
                }
            } else if let Ok(Some(vertex)) = store_for_resolve.vertex(&record.id) {
                for parent in vertex.parents() {
                    if parent.is_empty() {
                        continue;
                    }
                    if store_for_resolve.status(parent).unwrap_or(Status::Unknown)
                        != Status::Accepted
                    {
                        missing.insert(*parent);
                    }
                }
                for tx in vertex.txs() {
                    if store_for_resolve.status(&tx.id()).unwrap_or(Status::Unknown)
                        != Status::Accepted
                    {
                        missing.insert(tx.id());
                    }
                }
            }
            missing
        };
        let vtx_blocked = JobQueue::open(vtx_queue_tree, &resolve)?;
        let tx_blocked = JobQueue::open(tx_queue_tree, &resolve)?;

        let router = Arc::new(ChainRouter::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let sender = RouterSender::new(chain_id, Arc::clone(&router), outbound_tx);

        let bootstrapped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&bootstrapped);
        let on_finished = Box::new(move || {
            flag.store(true, Ordering::SeqCst);
            info!("chain bootstrapped; ready for the live voter");
        });

        let bootstrapper = Bootstrapper::new(
            BootstrapConfig {
                chain_id,
                beacons,
                alpha: config.bootstrap.alpha,
                sample_size: config.bootstrap.sample_size as usize,
                sender: Box::new(sender),
                store: Box::new(VertexState::new(Arc::clone(&store), Arc::clone(&codec))),
                vm: Box::new(TxState::new(
                    chain_id,
                    Arc::clone(&store),
                    utxos,
                    state_tree,
                    Arc::clone(&shared),
                    Arc::clone(&codec),
                    fxs,
                    verify_ctx,
                )),
                vtx_blocked,
                tx_blocked,
            },
            on_finished,
        );
        router.add_chain(chain_id, Box::new(bootstrapper));

        Ok(Node {
            router,
            outbound: outbound_rx,
            cancel: CancellationToken::new(),
            bootstrapped,
            aliaser,
            primary_chain: chain_id,
        })
    }

    pub fn router(&self) -> Arc<ChainRouter> {
        Arc::clone(&self.router)
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Deliver a wire message received from `peer`.
    pub fn handle_inbound(&self, peer: ShortId, bytes: &[u8]) {
        match Message::decode(bytes) {
            Ok(msg) => self.router.handle(peer, msg, Instant::now()),
            Err(err) => warn!(%peer, %err, "dropping undecodable message"),
        }
    }

    /// Run the service loop: pump timeouts and drain outbound messages
    /// until cancelled. The transport that carries outbound messages to
    /// peers is an external collaborator; this loop hands them off.
    pub async fn run(mut self, mut deliver: impl FnMut(ShortId, Message) + Send) {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutting down router");
                    self.router.shutdown();
                    return;
                }
                _ = ticker.tick() => {
                    self.router.tick(Instant::now());
                }
                out = self.outbound.recv() => {
                    match out {
                        Some((peer, msg)) => deliver(peer, msg),
                        None => {
                            self.router.shutdown();
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_assembles_with_defaults() {
        let config = NodeConfig::default();
        let node = Node::open_temporary(&config).unwrap();
        assert!(!node.is_bootstrapped());
        assert_eq!(node.aliaser.primary_alias(&node.primary_chain), "X");
    }

    #[test]
    fn chain_id_depends_on_network() {
        let mut a = NodeConfig::default();
        a.network.network_id = 1;
        let mut b = NodeConfig::default();
        b.network.network_id = 2;
        let node_a = Node::open_temporary(&a).unwrap();
        let node_b = Node::open_temporary(&b).unwrap();
        assert_ne!(node_a.primary_chain, node_b.primary_chain);
    }
}
