//! Bootstrap engine scenarios: frontier discovery, byzantine responses,
//! transaction dependencies, and topological acceptance, driven against
//! real sled-backed stores and the production backends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use starling::bootstrap::{Bootstrapper, Config, Sender};
use starling::config::NodeConfig;
use starling::ids::{Id, ShortId};
use starling::queue::JobQueue;
use starling::router::Engine;
use starling::tx::verify::VerifyCtx;
use starling::tx::{AdvanceTimeTx, RewardValidatorTx, Tx, TxCodec, UnsignedTx};
use starling::utxo::UtxoDb;
use starling::validators::ValidatorSet;
use starling::vertex::store::VertexStore;
use starling::vertex::{Status, Vertex};
use starling::node::{TxState, VertexState};
use starling::shared_memory::SharedMemory;

// ── Test sender: records every outbound message ─────────────────────────

#[derive(Default)]
struct SenderLog {
    next_request_id: u32,
    get_accepted_frontier: Vec<(ShortId, u32)>,
    accepted_frontier: Vec<(ShortId, u32, Vec<Id>)>,
    get_accepted: Vec<(ShortId, u32, Vec<Id>)>,
    accepted: Vec<(ShortId, u32, Vec<Id>)>,
    get_ancestors: Vec<(ShortId, u32, Id)>,
    multi_put: Vec<(ShortId, u32, Vec<Vec<u8>>)>,
}

#[derive(Clone)]
struct TestSender(Arc<Mutex<SenderLog>>);

impl TestSender {
    fn mint(&self) -> u32 {
        let mut log = self.0.lock().unwrap();
        let id = log.next_request_id;
        log.next_request_id += 1;
        id
    }
}

impl Sender for TestSender {
    fn send_get_accepted_frontier(&mut self, peer: ShortId) -> u32 {
        let request_id = self.mint();
        self.0
            .lock()
            .unwrap()
            .get_accepted_frontier
            .push((peer, request_id));
        request_id
    }

    fn send_accepted_frontier(&mut self, peer: ShortId, request_id: u32, frontier: Vec<Id>) {
        self.0
            .lock()
            .unwrap()
            .accepted_frontier
            .push((peer, request_id, frontier));
    }

    fn send_get_accepted(&mut self, peer: ShortId, candidates: Vec<Id>) -> u32 {
        let request_id = self.mint();
        self.0
            .lock()
            .unwrap()
            .get_accepted
            .push((peer, request_id, candidates));
        request_id
    }

    fn send_accepted(&mut self, peer: ShortId, request_id: u32, accepted: Vec<Id>) {
        self.0
            .lock()
            .unwrap()
            .accepted
            .push((peer, request_id, accepted));
    }

    fn send_get_ancestors(&mut self, peer: ShortId, vtx_id: Id) -> u32 {
        let request_id = self.mint();
        self.0
            .lock()
            .unwrap()
            .get_ancestors
            .push((peer, request_id, vtx_id));
        request_id
    }

    fn send_multi_put(&mut self, peer: ShortId, request_id: u32, containers: Vec<Vec<u8>>) {
        self.0
            .lock()
            .unwrap()
            .multi_put
            .push((peer, request_id, containers));
    }

    fn send_get(&mut self, _peer: ShortId, _vtx_id: Id) -> u32 {
        self.mint()
    }

    fn send_put(&mut self, _peer: ShortId, _request_id: u32, _vtx_id: Id, _container: Vec<u8>) {}
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    engine: Bootstrapper,
    log: Arc<Mutex<SenderLog>>,
    codec: Arc<TxCodec>,
    store: Arc<VertexStore>,
    chain_id: Id,
    finishes: Arc<AtomicUsize>,
    _db: sled::Db,
}

fn peer(b: u8) -> ShortId {
    ShortId([b; 20])
}

fn harness(beacons: &[(u8, u64)], alpha: u64) -> Harness {
    let config = NodeConfig::default();
    let chain_id = Id([1u8; 32]);
    let fee_asset = Id([2u8; 32]);

    let db = sled::Config::new().temporary(true).open().unwrap();
    let state_tree = db.open_tree("chain").unwrap();

    let codec = Arc::new(TxCodec::new());
    let store = Arc::new(VertexStore::new(state_tree.clone(), Arc::clone(&codec)));
    let utxos = UtxoDb::new(state_tree.clone(), Arc::clone(&codec));
    let shared = Arc::new(SharedMemory::new(db.clone()));
    let fxs = Arc::new(starling::tx::fx::FxRegistry::standard());

    let set = ValidatorSet::new();
    for (b, weight) in beacons {
        set.add_weight(peer(*b), *weight, 0, u64::MAX);
    }

    let verify_ctx = VerifyCtx {
        network_id: config.network.network_id,
        chain_id,
        fee_asset,
        tx_fee: 0,
        min_stake: 1,
        current_time: 10_000,
    };

    let vtx_blocked = JobQueue::open(db.open_tree("vtx-jobs").unwrap(), |_| HashSet::new()).unwrap();
    let tx_blocked = JobQueue::open(db.open_tree("tx-jobs").unwrap(), |_| HashSet::new()).unwrap();

    let log = Arc::new(Mutex::new(SenderLog::default()));
    let finishes = Arc::new(AtomicUsize::new(0));
    let finish_counter = Arc::clone(&finishes);

    let engine = Bootstrapper::new(
        Config {
            chain_id,
            beacons: set.snapshot(),
            alpha,
            sample_size: 16,
            sender: Box::new(TestSender(Arc::clone(&log))),
            store: Box::new(VertexState::new(Arc::clone(&store), Arc::clone(&codec))),
            vm: Box::new(TxState::new(
                chain_id,
                Arc::clone(&store),
                utxos,
                state_tree,
                shared,
                Arc::clone(&codec),
                fxs,
                verify_ctx,
            )),
            vtx_blocked,
            tx_blocked,
        },
        Box::new(move || {
            finish_counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    Harness {
        engine,
        log,
        codec,
        store,
        chain_id,
        finishes,
        _db: db,
    }
}

impl Harness {
    fn advance_tx(&self, time: u64) -> Tx {
        self.codec
            .build_tx(UnsignedTx::Advance(AdvanceTimeTx { time }), vec![])
            .unwrap()
    }

    fn reward_tx(&self, rewarded: Id) -> Tx {
        self.codec
            .build_tx(
                UnsignedTx::Reward(RewardValidatorTx { tx_id: rewarded }),
                vec![],
            )
            .unwrap()
    }

    fn vertex(&self, height: u64, parents: Vec<Id>, txs: Vec<Tx>) -> Vertex {
        Vertex::build(self.chain_id, height, parents, txs).unwrap()
    }

    /// Place a vertex's bytes in the local store without promoting it, as
    /// if it had been gossiped earlier.
    fn prime(&self, vertex: &Vertex) {
        self.store.set_vertex(&vertex.id(), Some(vertex)).unwrap();
    }

    fn status(&self, id: &Id) -> Status {
        self.store.status(id).unwrap()
    }

    fn finished(&self) -> bool {
        self.finishes.load(Ordering::SeqCst) > 0
    }

    fn last_ancestor_request(&self) -> (ShortId, u32, Id) {
        self.log.lock().unwrap().get_ancestors.last().cloned().unwrap()
    }

    fn ancestor_request_count(&self) -> usize {
        self.log.lock().unwrap().get_ancestors.len()
    }
}

// ── Scenarios ───────────────────────────────────────────────────────────

/// Three vertices in the accepted frontier, none with parents: everything
/// accepts locally, no GetAncestors goes out, and the finish callback
/// fires exactly once.
#[test]
fn single_frontier_accepts_without_fetching() {
    let mut h = harness(&[(1, 1)], 1);
    let v0 = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    let v1 = h.vertex(0, vec![], vec![h.advance_tx(2)]);
    let v2 = h.vertex(0, vec![], vec![h.advance_tx(3)]);
    for v in [&v0, &v1, &v2] {
        h.prime(v);
    }

    h.engine
        .force_accepted(vec![v0.id(), v1.id(), v2.id()])
        .unwrap();

    assert!(h.finished());
    assert_eq!(h.finishes.load(Ordering::SeqCst), 1);
    for v in [&v0, &v1, &v2] {
        assert_eq!(h.status(&v.id()), Status::Accepted);
    }
    assert_eq!(h.ancestor_request_count(), 0);

    // All three are frontier vertices.
    let edge: HashSet<Id> = h.engine.current_accepted_frontier().unwrap().into_iter().collect();
    assert_eq!(edge, HashSet::from([v0.id(), v1.id(), v2.id()]));
}

/// The peer first answers with the wrong vertex (engine re-requests), then
/// with the right vertex plus an extra one that must not be accepted.
#[test]
fn byzantine_responses_rerequest_and_ignore_extras() {
    let mut h = harness(&[(1, 1)], 1);
    let vtx0 = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    let vtx1 = h.vertex(1, vec![vtx0.id()], vec![h.advance_tx(2)]);
    let vtx2 = h.vertex(0, vec![], vec![h.advance_tx(3)]);
    h.prime(&vtx1);

    h.engine.force_accepted(vec![vtx1.id()]).unwrap();
    let (peer0, req0, want) = h.last_ancestor_request();
    assert_eq!(want, vtx0.id());

    // Unexpected vertex first: a new request must go out.
    h.engine
        .multi_put(peer0, req0, vec![vtx2.bytes().to_vec()])
        .unwrap();
    assert!(!h.finished());
    let (peer1, req1, want) = h.last_ancestor_request();
    assert_eq!(want, vtx0.id());
    assert_ne!((peer0, req0), (peer1, req1));

    // Expected vertex plus an unrelated one.
    h.engine
        .multi_put(
            peer1,
            req1,
            vec![vtx0.bytes().to_vec(), vtx2.bytes().to_vec()],
        )
        .unwrap();

    assert!(h.finished());
    assert_eq!(h.status(&vtx0.id()), Status::Accepted);
    assert_eq!(h.status(&vtx1.id()), Status::Accepted);
    // The stray vertex was cached but never promoted.
    assert_ne!(h.status(&vtx2.id()), Status::Accepted);
}

/// A vertex dependency combined with a transaction dependency: tx1 (in the
/// parent vertex) spends tx0 (in the child); everything accepts in
/// dependency order from a single fetch.
#[test]
fn tx_dependencies_accept_in_order() {
    let mut h = harness(&[(1, 1)], 1);
    let tx0 = h.advance_tx(1);
    let tx1 = h.reward_tx(tx0.id());
    let vtx0 = h.vertex(0, vec![], vec![tx1.clone()]);
    let vtx1 = h.vertex(1, vec![vtx0.id()], vec![tx0.clone()]);
    h.prime(&vtx1);

    h.engine.force_accepted(vec![vtx1.id()]).unwrap();
    let (p, req, want) = h.last_ancestor_request();
    assert_eq!(want, vtx0.id());

    h.engine
        .multi_put(p, req, vec![vtx0.bytes().to_vec()])
        .unwrap();

    assert!(h.finished());
    assert_eq!(h.status(&tx0.id()), Status::Accepted);
    assert_eq!(h.status(&tx1.id()), Status::Accepted);
    assert_eq!(h.status(&vtx0.id()), Status::Accepted);
    assert_eq!(h.status(&vtx1.id()), Status::Accepted);
}

/// A transaction depends on a transaction no vertex carries: bootstrap
/// still completes (the needed-vertex set empties), leaving the blocked
/// transaction and its vertex Processing for the live engine.
#[test]
fn missing_tx_dependency_leaves_vertex_processing() {
    let mut h = harness(&[(1, 1)], 1);
    let tx_missing = Id([99u8; 32]);
    let tx1 = h.reward_tx(tx_missing);
    let vtx0 = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    let vtx1 = h.vertex(1, vec![vtx0.id()], vec![tx1.clone()]);
    h.prime(&vtx1);

    h.engine.force_accepted(vec![vtx1.id()]).unwrap();
    let (p, req, _) = h.last_ancestor_request();
    h.engine
        .multi_put(p, req, vec![vtx0.bytes().to_vec()])
        .unwrap();

    assert!(h.finished());
    assert_eq!(h.status(&vtx0.id()), Status::Accepted);
    assert_eq!(h.status(&vtx1.id()), Status::Processing);
    assert_ne!(h.status(&tx1.id()), Status::Accepted);
}

/// A MultiPut carrying only one of two needed ancestors: the engine issues
/// another GetAncestors for the rest of the chain.
#[test]
fn incomplete_multiput_fetches_remaining_ancestors() {
    let mut h = harness(&[(1, 1)], 1);
    let vtx0 = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    let vtx1 = h.vertex(1, vec![vtx0.id()], vec![h.advance_tx(2)]);
    let vtx2 = h.vertex(2, vec![vtx1.id()], vec![h.advance_tx(3)]);
    h.prime(&vtx2);

    h.engine.force_accepted(vec![vtx2.id()]).unwrap();
    let (p, req, want) = h.last_ancestor_request();
    assert_eq!(want, vtx1.id());

    h.engine
        .multi_put(p, req, vec![vtx1.bytes().to_vec()])
        .unwrap();
    assert!(!h.finished());
    let (p, req, want) = h.last_ancestor_request();
    assert_eq!(want, vtx0.id());

    h.engine
        .multi_put(p, req, vec![vtx0.bytes().to_vec()])
        .unwrap();

    assert!(h.finished());
    for id in [vtx0.id(), vtx1.id(), vtx2.id()] {
        assert_eq!(h.status(&id), Status::Accepted);
    }
}

/// One MultiPut carrying the whole ancestor chain: everything accepts with
/// no further requests.
#[test]
fn multiput_with_parents_accepts_whole_chain() {
    let mut h = harness(&[(1, 1)], 1);
    let vtx0 = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    let vtx1 = h.vertex(1, vec![vtx0.id()], vec![h.advance_tx(2)]);
    let vtx2 = h.vertex(2, vec![vtx1.id()], vec![h.advance_tx(3)]);

    h.engine.force_accepted(vec![vtx2.id()]).unwrap();
    let (p, req, want) = h.last_ancestor_request();
    assert_eq!(want, vtx2.id());

    h.engine
        .multi_put(
            p,
            req,
            vec![
                vtx2.bytes().to_vec(),
                vtx1.bytes().to_vec(),
                vtx0.bytes().to_vec(),
            ],
        )
        .unwrap();

    assert!(h.finished());
    assert_eq!(h.ancestor_request_count(), 1);
    for id in [vtx0.id(), vtx1.id(), vtx2.id()] {
        assert_eq!(h.status(&id), Status::Accepted);
    }
    // Only the tip remains on the frontier.
    let edge = h.engine.current_accepted_frontier().unwrap();
    assert_eq!(edge, vec![vtx2.id()]);
}

/// A failed request for a vertex that another response already delivered
/// must not wedge the engine.
#[test]
fn failure_after_delivery_still_finishes() {
    let mut h = harness(&[(1, 1)], 1);
    let vtx0 = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    let vtx1 = h.vertex(1, vec![vtx0.id()], vec![h.advance_tx(2)]);

    h.engine
        .force_accepted(vec![vtx0.id(), vtx1.id()])
        .unwrap();
    let requests: Vec<(ShortId, u32, Id)> =
        h.log.lock().unwrap().get_ancestors.clone();
    assert_eq!(requests.len(), 2);
    let (peer_for_vtx1, req_for_vtx1, _) = *requests
        .iter()
        .find(|(_, _, id)| *id == vtx1.id())
        .unwrap();
    let (peer_for_vtx0, req_for_vtx0, _) = *requests
        .iter()
        .find(|(_, _, id)| *id == vtx0.id())
        .unwrap();

    // vtx1's response carries vtx0 too.
    h.engine
        .multi_put(
            peer_for_vtx1,
            req_for_vtx1,
            vec![vtx1.bytes().to_vec(), vtx0.bytes().to_vec()],
        )
        .unwrap();

    // The request for vtx0 then times out; it is already held.
    h.engine
        .get_ancestors_failed(peer_for_vtx0, req_for_vtx0)
        .unwrap();

    assert!(h.finished());
    assert_eq!(h.finishes.load(Ordering::SeqCst), 1);
    assert_eq!(h.status(&vtx0.id()), Status::Accepted);
    assert_eq!(h.status(&vtx1.id()), Status::Accepted);
}

/// Frontier discovery with a weighted vote: only candidates reaching the
/// alpha weight threshold are accepted and fetched.
#[test]
fn weighted_frontier_vote_filters_candidates() {
    let mut h = harness(&[(1, 2), (2, 1)], 2);
    let heavy = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    let light = h.vertex(0, vec![], vec![h.advance_tx(2)]);

    h.engine.startup().unwrap();
    let frontier_reqs = h.log.lock().unwrap().get_accepted_frontier.clone();
    assert_eq!(frontier_reqs.len(), 2);

    // Each beacon reports its frontier.
    h.engine
        .accepted_frontier(peer(1), frontier_reqs[0].1, vec![heavy.id()])
        .unwrap();
    h.engine
        .accepted_frontier(peer(2), frontier_reqs[1].1, vec![light.id()])
        .unwrap();

    // Both get polled with the union of candidates.
    let polls = h.log.lock().unwrap().get_accepted.clone();
    assert_eq!(polls.len(), 2);
    for (_, _, candidates) in &polls {
        let set: HashSet<Id> = candidates.iter().copied().collect();
        assert_eq!(set, HashSet::from([heavy.id(), light.id()]));
    }

    // Only the weight-2 beacon endorses `heavy`; only peer(2) endorses
    // `light`, leaving it below alpha.
    h.engine.accepted(peer(1), polls[0].1, vec![heavy.id()]).unwrap();
    h.engine.accepted(peer(2), polls[1].1, vec![light.id()]).unwrap();

    // The engine fetches exactly the accepted candidate.
    let (p, req, want) = h.last_ancestor_request();
    assert_eq!(want, heavy.id());
    assert_eq!(h.ancestor_request_count(), 1);

    h.engine
        .multi_put(p, req, vec![heavy.bytes().to_vec()])
        .unwrap();
    assert!(h.finished());
    assert_eq!(h.status(&heavy.id()), Status::Accepted);
    assert_ne!(h.status(&light.id()), Status::Accepted);
}

/// A beacon that never answers frontier discovery is dropped by its
/// synthesized failure; bootstrap proceeds with the remaining answers.
#[test]
fn frontier_discovery_tolerates_failed_beacon() {
    let mut h = harness(&[(1, 1), (2, 1)], 1);
    let v = h.vertex(0, vec![], vec![h.advance_tx(1)]);

    h.engine.startup().unwrap();
    let frontier_reqs = h.log.lock().unwrap().get_accepted_frontier.clone();

    h.engine
        .accepted_frontier(peer(1), frontier_reqs[0].1, vec![v.id()])
        .unwrap();
    h.engine
        .get_accepted_frontier_failed(peer(2), frontier_reqs[1].1)
        .unwrap();

    let polls = h.log.lock().unwrap().get_accepted.clone();
    assert_eq!(polls.len(), 2);
    h.engine.accepted(peer(1), polls[0].1, vec![v.id()]).unwrap();
    h.engine.get_accepted_failed(peer(2), polls[1].1).unwrap();

    let (p, req, want) = h.last_ancestor_request();
    assert_eq!(want, v.id());
    h.engine.multi_put(p, req, vec![v.bytes().to_vec()]).unwrap();
    assert!(h.finished());
}

/// A vertex whose height disagrees with its parents is rejected, along
/// with everything that depends on it.
#[test]
fn wrong_height_rejects_vertex_and_dependents() {
    let mut h = harness(&[(1, 1)], 1);
    let vtx0 = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    // Claims height 5; parents demand 1.
    let bad = h.vertex(5, vec![vtx0.id()], vec![h.advance_tx(2)]);
    let child = h.vertex(6, vec![bad.id()], vec![h.advance_tx(3)]);
    h.prime(&child);

    h.engine.force_accepted(vec![child.id()]).unwrap();
    let (p, req, _) = h.last_ancestor_request();
    h.engine
        .multi_put(p, req, vec![bad.bytes().to_vec(), vtx0.bytes().to_vec()])
        .unwrap();

    assert!(h.finished());
    assert_eq!(h.status(&vtx0.id()), Status::Accepted);
    assert_eq!(h.status(&bad.id()), Status::Rejected);
    assert_eq!(h.status(&child.id()), Status::Rejected);
}

/// Accepted is terminal: a vertex accepted during bootstrap never leaves
/// that status even when re-delivered.
#[test]
fn acceptance_is_monotonic() {
    let mut h = harness(&[(1, 1)], 1);
    let v = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    h.prime(&v);
    h.engine.force_accepted(vec![v.id()]).unwrap();
    assert_eq!(h.status(&v.id()), Status::Accepted);

    // A stray re-delivery of the same container changes nothing.
    let stray_peer = peer(1);
    h.engine
        .put(stray_peer, 77, v.id(), v.bytes().to_vec())
        .unwrap();
    assert_eq!(h.status(&v.id()), Status::Accepted);
}

/// After a halt, responses are ignored and the finish callback never
/// fires.
#[test]
fn halt_suppresses_finish() {
    let mut h = harness(&[(1, 1)], 1);
    let vtx0 = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    let vtx1 = h.vertex(1, vec![vtx0.id()], vec![h.advance_tx(2)]);
    h.prime(&vtx1);

    h.engine.force_accepted(vec![vtx1.id()]).unwrap();
    let (p, req, _) = h.last_ancestor_request();

    h.engine.halt();
    h.engine
        .multi_put(p, req, vec![vtx0.bytes().to_vec()])
        .unwrap();
    assert!(!h.finished());
}

/// The engine answers peers bootstrapping from us: frontier queries return
/// the stored edge, accepted queries filter by status, and GetAncestors
/// returns the requested vertex with its ancestry.
#[test]
fn serves_other_bootstrappers() {
    let mut h = harness(&[(1, 1)], 1);
    let vtx0 = h.vertex(0, vec![], vec![h.advance_tx(1)]);
    let vtx1 = h.vertex(1, vec![vtx0.id()], vec![h.advance_tx(2)]);
    h.prime(&vtx1);
    h.engine.force_accepted(vec![vtx1.id()]).unwrap();
    let (p, req, _) = h.last_ancestor_request();
    h.engine
        .multi_put(p, req, vec![vtx0.bytes().to_vec()])
        .unwrap();
    assert!(h.finished());

    let asker = peer(9);
    h.engine.get_accepted_frontier(asker, 5).unwrap();
    let reply = h.log.lock().unwrap().accepted_frontier.last().cloned().unwrap();
    assert_eq!(reply.0, asker);
    assert_eq!(reply.1, 5);
    assert_eq!(reply.2, vec![vtx1.id()]);

    let unknown = Id([42u8; 32]);
    h.engine
        .get_accepted(asker, 6, vec![vtx0.id(), unknown])
        .unwrap();
    let reply = h.log.lock().unwrap().accepted.last().cloned().unwrap();
    assert_eq!(reply.2, vec![vtx0.id()]);

    h.engine.get_ancestors(asker, 7, vtx1.id()).unwrap();
    let (to, rid, containers) = h.log.lock().unwrap().multi_put.last().cloned().unwrap();
    assert_eq!((to, rid), (asker, 7));
    assert_eq!(containers[0], vtx1.bytes().to_vec());
    assert!(containers.contains(&vtx0.bytes().to_vec()));
}
