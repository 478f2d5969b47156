//! The bootstrap engine.
//!
//! Starting from nothing but a set of trusted beacons, the engine runs a
//! three-phase protocol per chain: discover the accepted frontier (sample
//! beacons, collect their frontiers, then put the union to a weighted vote),
//! fetch every missing ancestor transitively with `GetAncestors`/`MultiPut`,
//! and accept the fetched vertices in a topologically valid order through
//! two persistent dependency queues (one for transactions, one for
//! vertices).
//!
//! Peers are untrusted: the first container of a `MultiPut` must be the
//! requested vertex, later containers are opportunistic prefills matched by
//! hash, unparseable containers drop the remainder of the response, and
//! failed requests rotate to another peer with a bounded retry count.
//! Bootstrap completes when nothing is needed and nothing is outstanding;
//! `on_finished` fires exactly once, and never after a halt.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::CodecError;
use crate::constants::{MAX_FETCH_RETRIES, MAX_MULTIPUT_BYTES, MAX_MULTIPUT_CONTAINERS};
use crate::ids::{Id, ShortId};
use crate::queue::{JobQueue, JobRecord, QueueError};
use crate::router::{Engine, EngineResult};
use crate::tx::verify::{Disposition, TxError};
use crate::tx::Tx;
use crate::validators::Snapshot;
use crate::vertex::store::StoreError;
use crate::vertex::{Status, Vertex, VertexError};

/// Job kind tags used in the blocked queues.
pub const JOB_KIND_VERTEX: u8 = 0;
pub const JOB_KIND_TX: u8 = 1;

/// Temporary tx failures are retried this many times per drain before the
/// transaction is left Processing for the live engine.
const MAX_TX_RETRIES: u32 = 8;

/// Errors from the engine. Store and queue failures are fatal for the
/// chain; everything recoverable is handled internally.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("job payload corrupt: {0}")]
    Codec(#[from] CodecError),
    #[error("vertex {0} vanished from the store")]
    MissingVertex(Id),
}

/// Outbound message surface the engine drives. Implementations mint the
/// monotonically increasing request ID for each request they send and
/// register it with the router's timeout table.
pub trait Sender: Send {
    fn send_get_accepted_frontier(&mut self, peer: ShortId) -> u32;
    fn send_accepted_frontier(&mut self, peer: ShortId, request_id: u32, frontier: Vec<Id>);
    fn send_get_accepted(&mut self, peer: ShortId, candidates: Vec<Id>) -> u32;
    fn send_accepted(&mut self, peer: ShortId, request_id: u32, accepted: Vec<Id>);
    fn send_get_ancestors(&mut self, peer: ShortId, vtx_id: Id) -> u32;
    fn send_multi_put(&mut self, peer: ShortId, request_id: u32, containers: Vec<Vec<u8>>);
    fn send_get(&mut self, peer: ShortId, vtx_id: Id) -> u32;
    fn send_put(&mut self, peer: ShortId, request_id: u32, vtx_id: Id, container: Vec<u8>);
}

/// The engine's view of vertex state. `parse_and_cache` persists the bytes
/// without touching status; promotion to Processing is the engine's call.
pub trait VertexBackend: Send {
    fn parse_and_cache(&mut self, bytes: &[u8]) -> Result<Vertex, VertexError>;
    fn vertex(&self, id: &Id) -> Result<Option<Vertex>, StoreError>;
    fn status(&self, id: &Id) -> Result<Status, StoreError>;
    fn set_status(&mut self, id: &Id, status: Status) -> Result<(), StoreError>;
    /// The chain's accepted frontier.
    fn edge(&self) -> Result<Vec<Id>, StoreError>;
    fn set_edge(&mut self, frontier: Vec<Id>) -> Result<(), StoreError>;
}

/// The engine's view of transaction state. `accept_tx` runs semantic
/// verification and commits the transaction's effects atomically.
pub trait TxBackend: Send {
    fn parse_tx(&self, bytes: &[u8]) -> Result<Tx, CodecError>;
    fn tx_status(&self, id: &Id) -> Result<Status, StoreError>;
    fn accept_tx(&mut self, tx: &Tx) -> Result<(), TxError>;
    fn reject_tx(&mut self, id: &Id) -> Result<(), StoreError>;
}

/// Engine configuration and collaborators.
pub struct Config {
    pub chain_id: Id,
    pub beacons: Arc<Snapshot>,
    /// Weight threshold a frontier candidate needs to be accepted.
    pub alpha: u64,
    /// Beacons sampled for frontier discovery.
    pub sample_size: usize,
    pub sender: Box<dyn Sender>,
    pub store: Box<dyn VertexBackend>,
    pub vm: Box<dyn TxBackend>,
    pub vtx_blocked: JobQueue,
    pub tx_blocked: JobQueue,
}

/// Engine lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    FrontierDisc,
    FrontierVote,
    Fetching,
    Draining,
    Done,
}

pub struct Bootstrapper {
    chain_id: Id,
    beacons: Arc<Snapshot>,
    alpha: u64,
    sample_size: usize,
    sender: Box<dyn Sender>,
    store: Box<dyn VertexBackend>,
    vm: Box<dyn TxBackend>,
    vtx_blocked: JobQueue,
    tx_blocked: JobQueue,

    phase: Phase,
    halted: bool,
    on_finished: Option<Box<dyn FnOnce() + Send>>,

    /// Beacons sampled for discovery; the vote goes to the same set.
    frontier_beacons: Vec<ShortId>,
    pending_frontier: HashSet<ShortId>,
    frontier_candidates: HashSet<Id>,
    pending_votes: HashSet<ShortId>,
    accepted_votes: HashMap<Id, u64>,

    /// (peer, request id) → vertex we asked that peer for.
    outstanding: HashMap<(ShortId, u32), Id>,
    /// Vertices with a request in flight.
    fetching: HashSet<Id>,
    /// Vertices required but not yet held.
    needed: HashSet<Id>,
    /// Vertices promoted and queued this run.
    queued: HashSet<Id>,
    retries: HashMap<Id, u32>,
    tx_retries: HashMap<Id, u32>,
    fetch_cursor: usize,
    num_fetched: u64,
}

impl Bootstrapper {
    pub fn new(config: Config, on_finished: Box<dyn FnOnce() + Send>) -> Self {
        Bootstrapper {
            chain_id: config.chain_id,
            beacons: config.beacons,
            alpha: config.alpha,
            sample_size: config.sample_size,
            sender: config.sender,
            store: config.store,
            vm: config.vm,
            vtx_blocked: config.vtx_blocked,
            tx_blocked: config.tx_blocked,
            phase: Phase::Init,
            halted: false,
            on_finished: Some(on_finished),
            frontier_beacons: Vec::new(),
            pending_frontier: HashSet::new(),
            frontier_candidates: HashSet::new(),
            pending_votes: HashSet::new(),
            accepted_votes: HashMap::new(),
            outstanding: HashMap::new(),
            fetching: HashSet::new(),
            needed: HashSet::new(),
            queued: HashSet::new(),
            retries: HashMap::new(),
            tx_retries: HashMap::new(),
            fetch_cursor: 0,
            num_fetched: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }

    /// This chain's accepted frontier.
    pub fn current_accepted_frontier(&self) -> Result<Vec<Id>, BootstrapError> {
        Ok(self.store.edge()?)
    }

    /// The subset of `ids` this node has accepted.
    pub fn filter_accepted(&self, ids: &[Id]) -> Result<Vec<Id>, BootstrapError> {
        let mut accepted = Vec::new();
        for id in ids {
            if self.store.status(id)? == Status::Accepted {
                accepted.push(*id);
            }
        }
        Ok(accepted)
    }

    /// Begin frontier discovery: sample beacons by weight and ask each for
    /// its accepted frontier.
    pub fn startup(&mut self) -> Result<(), BootstrapError> {
        let sampled = self
            .beacons
            .sample(&mut rand::thread_rng(), self.sample_size)
            .unwrap_or_default();
        if sampled.is_empty() {
            info!(chain = %self.chain_id, "no beacons; accepting the local frontier as-is");
            return self.force_accepted(Vec::new());
        }
        self.phase = Phase::FrontierDisc;
        self.frontier_beacons = sampled.clone();
        for peer in sampled {
            self.pending_frontier.insert(peer);
            self.sender.send_get_accepted_frontier(peer);
        }
        Ok(())
    }

    fn frontier_step(&mut self) -> Result<(), BootstrapError> {
        if !self.pending_frontier.is_empty() {
            return Ok(());
        }
        self.phase = Phase::FrontierVote;
        let candidates: Vec<Id> = self.frontier_candidates.iter().copied().collect();
        debug!(
            chain = %self.chain_id,
            candidates = candidates.len(),
            "frontier discovery complete, polling accepted set"
        );
        for peer in self.frontier_beacons.clone() {
            self.pending_votes.insert(peer);
            self.sender.send_get_accepted(peer, candidates.clone());
        }
        if self.pending_votes.is_empty() {
            return self.finalize_vote();
        }
        Ok(())
    }

    fn vote_step(&mut self) -> Result<(), BootstrapError> {
        if self.pending_votes.is_empty() {
            return self.finalize_vote();
        }
        Ok(())
    }

    fn finalize_vote(&mut self) -> Result<(), BootstrapError> {
        let accepted: Vec<Id> = self
            .accepted_votes
            .iter()
            .filter(|(_, weight)| **weight >= self.alpha)
            .map(|(id, _)| *id)
            .collect();
        info!(
            chain = %self.chain_id,
            accepted = accepted.len(),
            candidates = self.accepted_votes.len(),
            "accepted frontier computed"
        );
        self.force_accepted(accepted)
    }

    /// Treat `ids` as the accepted frontier and start fetching ancestors.
    pub fn force_accepted(&mut self, ids: Vec<Id>) -> Result<(), BootstrapError> {
        self.phase = Phase::Fetching;
        for id in ids {
            let status = self.store.status(&id)?;
            if status.decided() {
                continue;
            }
            if self.store.vertex(&id)?.is_some() {
                self.process(&HashMap::new(), vec![id])?;
            } else {
                self.fetch(id)?;
            }
        }
        self.maybe_finish()
    }

    fn next_peer(&mut self) -> Option<ShortId> {
        let validators = self.beacons.validators();
        if validators.is_empty() {
            return None;
        }
        let peer = validators[self.fetch_cursor % validators.len()].node_id;
        self.fetch_cursor += 1;
        Some(peer)
    }

    /// Request `id`'s ancestor chain from the next peer in rotation.
    fn fetch(&mut self, id: Id) -> Result<(), BootstrapError> {
        if self.fetching.contains(&id) {
            return Ok(());
        }
        if self.store.status(&id)?.fetched() {
            return Ok(());
        }
        self.needed.insert(id);
        let Some(peer) = self.next_peer() else {
            warn!(chain = %self.chain_id, %id, "no peers available to fetch vertex");
            return Ok(());
        };
        self.fetching.insert(id);
        let request_id = self.sender.send_get_ancestors(peer, id);
        self.outstanding.insert((peer, request_id), id);
        Ok(())
    }

    /// Re-request `id` from a different peer after a failure or byzantine
    /// response. Past the retry bound the vertex's status resets to Unknown
    /// and the count starts over.
    fn refetch(&mut self, id: Id) -> Result<(), BootstrapError> {
        let tries = self.retries.entry(id).or_insert(0);
        *tries += 1;
        if *tries >= MAX_FETCH_RETRIES {
            warn!(chain = %self.chain_id, %id, "retry bound hit, resetting vertex to Unknown");
            self.store.set_status(&id, Status::Unknown)?;
            self.retries.insert(id, 0);
        }
        self.fetching.remove(&id);
        self.fetch(id)
    }

    /// Promote newly held vertices: mark Processing, queue their jobs, and
    /// chase unseen parents. `avail` holds vertices parsed from the current
    /// response; anything else is looked up in the store.
    fn process(
        &mut self,
        avail: &HashMap<Id, Vertex>,
        seeds: Vec<Id>,
    ) -> Result<(), BootstrapError> {
        let mut stack = seeds;
        for id in avail.keys() {
            if self.needed.contains(id) {
                stack.push(*id);
            }
        }

        while let Some(id) = stack.pop() {
            if id.is_empty() {
                // Genesis sentinel: implicitly accepted.
                continue;
            }
            if self.queued.contains(&id) {
                self.needed.remove(&id);
                continue;
            }
            if self.store.status(&id)?.decided() {
                self.needed.remove(&id);
                continue;
            }
            let vertex = match avail.get(&id) {
                Some(vertex) => Some(vertex.clone()),
                None => self.store.vertex(&id)?,
            };
            let Some(vertex) = vertex else {
                self.fetch(id)?;
                continue;
            };

            self.store.set_status(&id, Status::Processing)?;
            self.needed.remove(&id);
            self.queued.insert(id);
            self.num_fetched += 1;

            let mut vtx_deps: HashSet<Id> = HashSet::new();
            let mut doomed = false;
            for parent in vertex.parents() {
                if parent.is_empty() {
                    continue;
                }
                match self.store.status(parent)? {
                    Status::Accepted => {}
                    Status::Rejected => doomed = true,
                    _ => {
                        vtx_deps.insert(*parent);
                    }
                }
            }

            if !doomed {
                for tx in vertex.txs() {
                    let tx_id = tx.id();
                    match self.vm.tx_status(&tx_id)? {
                        Status::Accepted => continue,
                        Status::Rejected => {
                            doomed = true;
                            break;
                        }
                        _ => {}
                    }
                    vtx_deps.insert(tx_id);
                    let mut tx_deps = HashSet::new();
                    for dep in tx.unsigned.dependencies() {
                        if self.vm.tx_status(&dep)? != Status::Accepted {
                            tx_deps.insert(dep);
                        }
                    }
                    self.tx_blocked.push(
                        JobRecord {
                            id: tx_id,
                            kind: JOB_KIND_TX,
                            payload: tx.bytes().to_vec(),
                        },
                        tx_deps,
                    )?;
                }
            }

            if doomed {
                // A rejected parent or transaction condemns the vertex.
                self.reject_cascade(id)?;
                continue;
            }

            self.vtx_blocked.push(
                JobRecord {
                    id,
                    kind: JOB_KIND_VERTEX,
                    payload: id.as_bytes().to_vec(),
                },
                vtx_deps,
            )?;

            for parent in vertex.parents() {
                if parent.is_empty() || self.queued.contains(parent) {
                    continue;
                }
                if self.store.status(parent)? == Status::Accepted {
                    continue;
                }
                stack.push(*parent);
            }
        }
        Ok(())
    }

    /// Bootstrap is done when nothing is needed and nothing is in flight.
    fn maybe_finish(&mut self) -> Result<(), BootstrapError> {
        if self.phase != Phase::Fetching || self.halted {
            return Ok(());
        }
        if !self.outstanding.is_empty() || !self.needed.is_empty() {
            return Ok(());
        }
        self.finish()
    }

    /// Drain the job queues in dependency order, then fire `on_finished`.
    fn finish(&mut self) -> Result<(), BootstrapError> {
        self.phase = Phase::Draining;
        info!(
            chain = %self.chain_id,
            fetched = self.num_fetched,
            "fetch complete, executing deferred jobs"
        );
        loop {
            let mut progressed = false;
            while let Some(record) = self.tx_blocked.pop_runnable()? {
                self.run_tx_job(record)?;
                progressed = true;
            }
            while let Some(record) = self.vtx_blocked.pop_runnable()? {
                self.run_vertex_job(record)?;
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        self.phase = Phase::Done;
        info!(chain = %self.chain_id, accepted = self.num_fetched, "bootstrap finished");
        if let Some(on_finished) = self.on_finished.take() {
            on_finished();
        }
        Ok(())
    }

    fn fulfill(&mut self, id: Id) -> Result<(), BootstrapError> {
        self.tx_blocked.fulfill(&id)?;
        self.vtx_blocked.fulfill(&id)?;
        Ok(())
    }

    /// Abandon everything transitively blocked on `id`, across both queues,
    /// marking each abandoned entity Rejected.
    fn abandon(&mut self, id: Id) -> Result<(), BootstrapError> {
        let mut frontier = vec![id];
        while let Some(dead) = frontier.pop() {
            let mut doomed = self.tx_blocked.abandon(&dead)?;
            doomed.extend(self.vtx_blocked.abandon(&dead)?);
            for record in doomed {
                match record.kind {
                    JOB_KIND_TX => self.vm.reject_tx(&record.id)?,
                    _ => self.store.set_status(&record.id, Status::Rejected)?,
                }
                frontier.push(record.id);
            }
        }
        Ok(())
    }

    fn reject_cascade(&mut self, id: Id) -> Result<(), BootstrapError> {
        self.store.set_status(&id, Status::Rejected)?;
        self.needed.remove(&id);
        self.abandon(id)
    }

    fn run_tx_job(&mut self, record: JobRecord) -> Result<(), BootstrapError> {
        let tx = self.vm.parse_tx(&record.payload)?;
        let tx_id = tx.id();
        if self.vm.tx_status(&tx_id)? == Status::Accepted {
            return self.fulfill(tx_id);
        }
        match self.vm.accept_tx(&tx) {
            Ok(()) => {
                debug!(chain = %self.chain_id, %tx_id, "accepted tx");
                self.fulfill(tx_id)?;
            }
            Err(err) if err.disposition() == Disposition::Temporary => {
                let tries = self.tx_retries.entry(tx_id).or_insert(0);
                *tries += 1;
                if *tries <= MAX_TX_RETRIES {
                    debug!(chain = %self.chain_id, %tx_id, %err, "tx not ready, requeueing");
                    self.tx_blocked.push(record, HashSet::new())?;
                } else {
                    warn!(
                        chain = %self.chain_id,
                        %tx_id,
                        %err,
                        "tx still blocked after retries, leaving for the live engine"
                    );
                }
            }
            Err(err) => {
                warn!(chain = %self.chain_id, %tx_id, %err, "rejecting invalid tx");
                self.vm.reject_tx(&tx_id)?;
                self.abandon(tx_id)?;
            }
        }
        Ok(())
    }

    fn run_vertex_job(&mut self, record: JobRecord) -> Result<(), BootstrapError> {
        let id = record.id;
        if self.store.status(&id)? == Status::Accepted {
            return self.fulfill(id);
        }
        let Some(vertex) = self.store.vertex(&id)? else {
            return Err(BootstrapError::MissingVertex(id));
        };

        // Height must be one past the highest parent (zero with no real
        // parents); a mismatch is a permanent fault in the vertex itself.
        let mut expected_height = 0u64;
        for parent in vertex.parents() {
            if parent.is_empty() {
                continue;
            }
            if self.store.status(parent)? == Status::Rejected {
                warn!(chain = %self.chain_id, %id, %parent, "parent rejected, rejecting vertex");
                return self.reject_cascade(id);
            }
            let Some(parent_vtx) = self.store.vertex(parent)? else {
                return Err(BootstrapError::MissingVertex(*parent));
            };
            expected_height = expected_height.max(parent_vtx.height() + 1);
        }
        if vertex.height() != expected_height {
            warn!(
                chain = %self.chain_id,
                %id,
                height = vertex.height(),
                expected = expected_height,
                "height does not match parents, rejecting vertex"
            );
            return self.reject_cascade(id);
        }

        self.store.set_status(&id, Status::Accepted)?;
        let mut edge: HashSet<Id> = self.store.edge()?.into_iter().collect();
        for parent in vertex.parents() {
            edge.remove(parent);
        }
        edge.insert(id);
        let mut edge: Vec<Id> = edge.into_iter().collect();
        edge.sort_unstable();
        self.store.set_edge(edge)?;

        debug!(chain = %self.chain_id, %id, height = vertex.height(), "accepted vertex");
        self.fulfill(id)
    }

    fn on_multi_put(
        &mut self,
        peer: ShortId,
        request_id: u32,
        containers: Vec<Vec<u8>>,
    ) -> Result<(), BootstrapError> {
        let Some(expected) = self.outstanding.remove(&(peer, request_id)) else {
            debug!(chain = %self.chain_id, %peer, request_id, "MultiPut matches no request");
            return Ok(());
        };
        self.fetching.remove(&expected);
        if self.halted || self.phase == Phase::Done {
            return Ok(());
        }
        if containers.len() > MAX_MULTIPUT_CONTAINERS {
            warn!(chain = %self.chain_id, %peer, "MultiPut exceeds container cap");
            return self.refetch(expected);
        }

        let mut iter = containers.into_iter();
        let Some(first) = iter.next() else {
            debug!(chain = %self.chain_id, %peer, "empty MultiPut");
            return self.refetch(expected);
        };

        let first_vtx = match self.store.parse_and_cache(&first) {
            Ok(vertex) if vertex.id() == expected => vertex,
            Ok(vertex) => {
                // Byzantine or confused peer: wrong vertex first. Keep the
                // rest as cache prefills and ask someone else.
                warn!(
                    chain = %self.chain_id,
                    %peer,
                    got = %vertex.id(),
                    want = %expected,
                    "unexpected first container, re-requesting"
                );
                for bytes in iter {
                    if self.store.parse_and_cache(&bytes).is_err() {
                        break;
                    }
                }
                return self.refetch(expected);
            }
            Err(err) => {
                warn!(chain = %self.chain_id, %peer, %err, "unparseable first container");
                return self.refetch(expected);
            }
        };

        let mut total = first.len();
        let mut avail = HashMap::new();
        avail.insert(expected, first_vtx);
        for bytes in iter {
            total += bytes.len();
            if total > MAX_MULTIPUT_BYTES {
                warn!(chain = %self.chain_id, %peer, "MultiPut exceeds byte cap, dropping remainder");
                break;
            }
            match self.store.parse_and_cache(&bytes) {
                Ok(vertex) => {
                    avail.insert(vertex.id(), vertex);
                }
                Err(err) => {
                    // Record the misbehavior and keep what parsed so far.
                    warn!(chain = %self.chain_id, %peer, %err, "bad container, dropping remainder");
                    break;
                }
            }
        }

        self.retries.remove(&expected);
        self.process(&avail, vec![expected])?;
        self.maybe_finish()
    }

    fn on_get_ancestors_failed(
        &mut self,
        peer: ShortId,
        request_id: u32,
    ) -> Result<(), BootstrapError> {
        let Some(expected) = self.outstanding.remove(&(peer, request_id)) else {
            return Ok(());
        };
        self.fetching.remove(&expected);
        if self.halted || self.phase == Phase::Done {
            return Ok(());
        }
        if self.store.status(&expected)?.fetched() {
            // Another response already delivered it.
            return self.maybe_finish();
        }
        debug!(chain = %self.chain_id, %peer, %expected, "GetAncestors failed, rotating peers");
        self.refetch(expected)?;
        self.maybe_finish()
    }

    /// Serve a peer's `GetAncestors`: the requested vertex first, then
    /// ancestors walking upward, bounded by the response caps.
    fn serve_ancestors(&mut self, peer: ShortId, request_id: u32, vtx_id: Id) -> Result<(), BootstrapError> {
        let Some(vertex) = self.store.vertex(&vtx_id)? else {
            debug!(chain = %self.chain_id, %peer, %vtx_id, "GetAncestors for unknown vertex");
            return Ok(());
        };
        let mut containers = vec![vertex.bytes().to_vec()];
        let mut total = containers[0].len();
        let mut visited: HashSet<Id> = HashSet::new();
        visited.insert(vtx_id);
        let mut queue: Vec<Id> = vertex.parents().to_vec();
        while let Some(id) = queue.pop() {
            if id.is_empty() || !visited.insert(id) {
                continue;
            }
            if containers.len() >= MAX_MULTIPUT_CONTAINERS {
                break;
            }
            let Some(ancestor) = self.store.vertex(&id)? else {
                continue;
            };
            total += ancestor.bytes().len();
            if total > MAX_MULTIPUT_BYTES {
                break;
            }
            containers.push(ancestor.bytes().to_vec());
            queue.extend_from_slice(ancestor.parents());
        }
        self.sender.send_multi_put(peer, request_id, containers);
        Ok(())
    }
}

impl Engine for Bootstrapper {
    fn get_accepted_frontier(&mut self, peer: ShortId, request_id: u32) -> EngineResult {
        let frontier = self.current_accepted_frontier()?;
        self.sender.send_accepted_frontier(peer, request_id, frontier);
        Ok(())
    }

    fn accepted_frontier(&mut self, peer: ShortId, _request_id: u32, ids: Vec<Id>) -> EngineResult {
        if !self.pending_frontier.remove(&peer) {
            debug!(chain = %self.chain_id, %peer, "frontier from unsampled peer dropped");
            return Ok(());
        }
        self.frontier_candidates.extend(ids);
        self.frontier_step()?;
        Ok(())
    }

    fn get_accepted_frontier_failed(&mut self, peer: ShortId, _request_id: u32) -> EngineResult {
        if self.pending_frontier.remove(&peer) {
            warn!(chain = %self.chain_id, %peer, "beacon failed to answer frontier request");
        }
        self.frontier_step()?;
        Ok(())
    }

    fn get_accepted(&mut self, peer: ShortId, request_id: u32, ids: Vec<Id>) -> EngineResult {
        let accepted = self.filter_accepted(&ids)?;
        self.sender.send_accepted(peer, request_id, accepted);
        Ok(())
    }

    fn accepted(&mut self, peer: ShortId, _request_id: u32, ids: Vec<Id>) -> EngineResult {
        if !self.pending_votes.remove(&peer) {
            return Ok(());
        }
        let weight = self.beacons.weight(&peer);
        for id in ids {
            *self.accepted_votes.entry(id).or_insert(0) += weight;
        }
        self.vote_step()?;
        Ok(())
    }

    fn get_accepted_failed(&mut self, peer: ShortId, _request_id: u32) -> EngineResult {
        if self.pending_votes.remove(&peer) {
            warn!(chain = %self.chain_id, %peer, "beacon failed to answer accepted poll");
        }
        self.vote_step()?;
        Ok(())
    }

    fn get_ancestors(&mut self, peer: ShortId, request_id: u32, vtx_id: Id) -> EngineResult {
        self.serve_ancestors(peer, request_id, vtx_id)?;
        Ok(())
    }

    fn multi_put(&mut self, peer: ShortId, request_id: u32, containers: Vec<Vec<u8>>) -> EngineResult {
        self.on_multi_put(peer, request_id, containers)?;
        Ok(())
    }

    fn get_ancestors_failed(&mut self, peer: ShortId, request_id: u32) -> EngineResult {
        self.on_get_ancestors_failed(peer, request_id)?;
        Ok(())
    }

    fn get(&mut self, peer: ShortId, request_id: u32, vtx_id: Id) -> EngineResult {
        if let Some(vertex) = self.store.vertex(&vtx_id)? {
            let bytes = vertex.bytes().to_vec();
            self.sender.send_put(peer, request_id, vtx_id, bytes);
        }
        Ok(())
    }

    fn put(
        &mut self,
        _peer: ShortId,
        _request_id: u32,
        _vtx_id: Id,
        container: Vec<u8>,
    ) -> EngineResult {
        // Unsolicited container: parse and cache, never promote.
        let _ = self.store.parse_and_cache(&container);
        Ok(())
    }

    fn get_failed(&mut self, _peer: ShortId, _request_id: u32) -> EngineResult {
        Ok(())
    }

    fn halt(&mut self) {
        self.halted = true;
        self.on_finished = None;
        self.outstanding.clear();
        self.fetching.clear();
        info!(chain = %self.chain_id, "bootstrap halted; queued work persists for restart");
    }
}
