//! Wire messages and per-chain message routing.
//!
//! Every consensus message carries the destination chain ID and a request
//! ID. The router owns the request table: responses must match an
//! outstanding `(peer, chain, request)` entry of the right kind or they are
//! dropped, and entries that expire synthesize the matching `*Failed` event
//! into the chain's engine. Each chain's engine runs under its own lock
//! (the chain lock); the router never holds a chain lock while touching the
//! timeout table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{CodecError, Reader, Writer};
use crate::constants::{MAX_MULTIPUT_BYTES, MAX_MULTIPUT_CONTAINERS};
use crate::ids::{Id, ShortId};
use crate::timeout::{RequestKey, TimeoutManager};

/// Message kinds, also used to tag outstanding requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    GetAcceptedFrontier,
    AcceptedFrontier,
    GetAccepted,
    Accepted,
    GetAncestors,
    MultiPut,
    Get,
    Put,
    PushQuery,
    PullQuery,
    Chits,
}

impl Op {
    fn code(self) -> u8 {
        match self {
            Op::GetAcceptedFrontier => 0,
            Op::AcceptedFrontier => 1,
            Op::GetAccepted => 2,
            Op::Accepted => 3,
            Op::GetAncestors => 4,
            Op::MultiPut => 5,
            Op::Get => 6,
            Op::Put => 7,
            Op::PushQuery => 8,
            Op::PullQuery => 9,
            Op::Chits => 10,
        }
    }

    fn from_code(code: u8) -> Option<Op> {
        Some(match code {
            0 => Op::GetAcceptedFrontier,
            1 => Op::AcceptedFrontier,
            2 => Op::GetAccepted,
            3 => Op::Accepted,
            4 => Op::GetAncestors,
            5 => Op::MultiPut,
            6 => Op::Get,
            7 => Op::Put,
            8 => Op::PushQuery,
            9 => Op::PullQuery,
            10 => Op::Chits,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Op::GetAcceptedFrontier => "get_accepted_frontier",
            Op::AcceptedFrontier => "accepted_frontier",
            Op::GetAccepted => "get_accepted",
            Op::Accepted => "accepted",
            Op::GetAncestors => "get_ancestors",
            Op::MultiPut => "multi_put",
            Op::Get => "get",
            Op::Put => "put",
            Op::PushQuery => "push_query",
            Op::PullQuery => "pull_query",
            Op::Chits => "chits",
        };
        f.write_str(name)
    }
}

/// A consensus message. Deadlines are milliseconds the requester will wait.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    GetAcceptedFrontier {
        chain_id: Id,
        request_id: u32,
        deadline_ms: u64,
    },
    AcceptedFrontier {
        chain_id: Id,
        request_id: u32,
        container_ids: Vec<Id>,
    },
    GetAccepted {
        chain_id: Id,
        request_id: u32,
        deadline_ms: u64,
        container_ids: Vec<Id>,
    },
    Accepted {
        chain_id: Id,
        request_id: u32,
        container_ids: Vec<Id>,
    },
    GetAncestors {
        chain_id: Id,
        request_id: u32,
        deadline_ms: u64,
        container_id: Id,
    },
    MultiPut {
        chain_id: Id,
        request_id: u32,
        containers: Vec<Vec<u8>>,
    },
    Get {
        chain_id: Id,
        request_id: u32,
        deadline_ms: u64,
        container_id: Id,
    },
    Put {
        chain_id: Id,
        request_id: u32,
        container_id: Id,
        container: Vec<u8>,
    },
    PushQuery {
        chain_id: Id,
        request_id: u32,
        deadline_ms: u64,
        container_id: Id,
        container: Vec<u8>,
    },
    PullQuery {
        chain_id: Id,
        request_id: u32,
        deadline_ms: u64,
        container_id: Id,
    },
    Chits {
        chain_id: Id,
        request_id: u32,
        votes: Vec<Id>,
    },
}

fn write_id_set(w: &mut Writer, ids: &[Id]) {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    w.write_len(sorted.len());
    for id in &sorted {
        w.write_id(id);
    }
}

fn read_id_set(r: &mut Reader<'_>) -> Result<Vec<Id>, CodecError> {
    let n = r.read_len()?;
    let mut ids = Vec::with_capacity(n);
    for _ in 0..n {
        ids.push(r.read_id()?);
    }
    Ok(ids)
}

impl Message {
    pub fn op(&self) -> Op {
        match self {
            Message::GetAcceptedFrontier { .. } => Op::GetAcceptedFrontier,
            Message::AcceptedFrontier { .. } => Op::AcceptedFrontier,
            Message::GetAccepted { .. } => Op::GetAccepted,
            Message::Accepted { .. } => Op::Accepted,
            Message::GetAncestors { .. } => Op::GetAncestors,
            Message::MultiPut { .. } => Op::MultiPut,
            Message::Get { .. } => Op::Get,
            Message::Put { .. } => Op::Put,
            Message::PushQuery { .. } => Op::PushQuery,
            Message::PullQuery { .. } => Op::PullQuery,
            Message::Chits { .. } => Op::Chits,
        }
    }

    pub fn chain_id(&self) -> Id {
        match self {
            Message::GetAcceptedFrontier { chain_id, .. }
            | Message::AcceptedFrontier { chain_id, .. }
            | Message::GetAccepted { chain_id, .. }
            | Message::Accepted { chain_id, .. }
            | Message::GetAncestors { chain_id, .. }
            | Message::MultiPut { chain_id, .. }
            | Message::Get { chain_id, .. }
            | Message::Put { chain_id, .. }
            | Message::PushQuery { chain_id, .. }
            | Message::PullQuery { chain_id, .. }
            | Message::Chits { chain_id, .. } => *chain_id,
        }
    }

    pub fn request_id(&self) -> u32 {
        match self {
            Message::GetAcceptedFrontier { request_id, .. }
            | Message::AcceptedFrontier { request_id, .. }
            | Message::GetAccepted { request_id, .. }
            | Message::Accepted { request_id, .. }
            | Message::GetAncestors { request_id, .. }
            | Message::MultiPut { request_id, .. }
            | Message::Get { request_id, .. }
            | Message::Put { request_id, .. }
            | Message::PushQuery { request_id, .. }
            | Message::PullQuery { request_id, .. }
            | Message::Chits { request_id, .. } => *request_id,
        }
    }

    /// The request kind this message answers, if it is a response.
    pub fn responds_to(&self) -> Option<&'static [Op]> {
        match self {
            Message::AcceptedFrontier { .. } => Some(&[Op::GetAcceptedFrontier]),
            Message::Accepted { .. } => Some(&[Op::GetAccepted]),
            Message::MultiPut { .. } => Some(&[Op::GetAncestors]),
            Message::Put { .. } => Some(&[Op::Get]),
            Message::Chits { .. } => Some(&[Op::PushQuery, Op::PullQuery]),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u8(self.op().code());
        w.write_id(&self.chain_id());
        w.write_u32(self.request_id());
        match self {
            Message::GetAcceptedFrontier { deadline_ms, .. } => w.write_u64(*deadline_ms),
            Message::AcceptedFrontier { container_ids, .. }
            | Message::Accepted { container_ids, .. } => write_id_set(&mut w, container_ids),
            Message::GetAccepted {
                deadline_ms,
                container_ids,
                ..
            } => {
                w.write_u64(*deadline_ms);
                write_id_set(&mut w, container_ids);
            }
            Message::GetAncestors {
                deadline_ms,
                container_id,
                ..
            }
            | Message::Get {
                deadline_ms,
                container_id,
                ..
            }
            | Message::PullQuery {
                deadline_ms,
                container_id,
                ..
            } => {
                w.write_u64(*deadline_ms);
                w.write_id(container_id);
            }
            Message::MultiPut { containers, .. } => {
                w.write_len(containers.len());
                for container in containers {
                    w.write_bytes(container);
                }
            }
            Message::Put {
                container_id,
                container,
                ..
            } => {
                w.write_id(container_id);
                w.write_bytes(container);
            }
            Message::PushQuery {
                deadline_ms,
                container_id,
                container,
                ..
            } => {
                w.write_u64(*deadline_ms);
                w.write_id(container_id);
                w.write_bytes(container);
            }
            Message::Chits { votes, .. } => write_id_set(&mut w, votes),
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
        let mut r = Reader::new(bytes)?;
        let code = r.read_u8()?;
        let op = Op::from_code(code).ok_or(CodecError::UnknownType(code as u32))?;
        let chain_id = r.read_id()?;
        let request_id = r.read_u32()?;

        let msg = match op {
            Op::GetAcceptedFrontier => Message::GetAcceptedFrontier {
                chain_id,
                request_id,
                deadline_ms: r.read_u64()?,
            },
            Op::AcceptedFrontier => Message::AcceptedFrontier {
                chain_id,
                request_id,
                container_ids: read_id_set(&mut r)?,
            },
            Op::GetAccepted => Message::GetAccepted {
                chain_id,
                request_id,
                deadline_ms: r.read_u64()?,
                container_ids: read_id_set(&mut r)?,
            },
            Op::Accepted => Message::Accepted {
                chain_id,
                request_id,
                container_ids: read_id_set(&mut r)?,
            },
            Op::GetAncestors => Message::GetAncestors {
                chain_id,
                request_id,
                deadline_ms: r.read_u64()?,
                container_id: r.read_id()?,
            },
            Op::MultiPut => {
                let n = r.read_len()?;
                if n > MAX_MULTIPUT_CONTAINERS {
                    return Err(CodecError::LengthOverflow(
                        n as u32,
                        MAX_MULTIPUT_CONTAINERS as u32,
                    ));
                }
                let mut containers = Vec::with_capacity(n);
                let mut total = 0usize;
                for _ in 0..n {
                    let container = r.read_bytes()?;
                    total += container.len();
                    if total > MAX_MULTIPUT_BYTES {
                        return Err(CodecError::LengthOverflow(
                            total as u32,
                            MAX_MULTIPUT_BYTES as u32,
                        ));
                    }
                    containers.push(container.to_vec());
                }
                Message::MultiPut {
                    chain_id,
                    request_id,
                    containers,
                }
            }
            Op::Get => Message::Get {
                chain_id,
                request_id,
                deadline_ms: r.read_u64()?,
                container_id: r.read_id()?,
            },
            Op::Put => Message::Put {
                chain_id,
                request_id,
                container_id: r.read_id()?,
                container: r.read_bytes()?.to_vec(),
            },
            Op::PushQuery => Message::PushQuery {
                chain_id,
                request_id,
                deadline_ms: r.read_u64()?,
                container_id: r.read_id()?,
                container: r.read_bytes()?.to_vec(),
            },
            Op::PullQuery => Message::PullQuery {
                chain_id,
                request_id,
                deadline_ms: r.read_u64()?,
                container_id: r.read_id()?,
            },
            Op::Chits => Message::Chits {
                chain_id,
                request_id,
                votes: read_id_set(&mut r)?,
            },
        };
        r.done()?;
        Ok(msg)
    }
}

/// Result type for engine handlers.
pub type EngineResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A chain's message handler. Requests, responses, and synthesized failure
/// events all arrive through this surface, already serialized under the
/// chain lock. Unhandled kinds default to a logged drop.
#[allow(unused_variables)]
pub trait Engine: Send {
    // ── Requests from peers ──
    fn get_accepted_frontier(&mut self, peer: ShortId, request_id: u32) -> EngineResult {
        Ok(())
    }
    fn get_accepted(&mut self, peer: ShortId, request_id: u32, ids: Vec<Id>) -> EngineResult {
        Ok(())
    }
    fn get_ancestors(&mut self, peer: ShortId, request_id: u32, vtx_id: Id) -> EngineResult {
        Ok(())
    }
    fn get(&mut self, peer: ShortId, request_id: u32, vtx_id: Id) -> EngineResult {
        Ok(())
    }
    fn push_query(
        &mut self,
        peer: ShortId,
        request_id: u32,
        vtx_id: Id,
        container: Vec<u8>,
    ) -> EngineResult {
        debug!(%peer, request_id, "dropping push query during bootstrap");
        Ok(())
    }
    fn pull_query(&mut self, peer: ShortId, request_id: u32, vtx_id: Id) -> EngineResult {
        debug!(%peer, request_id, "dropping pull query during bootstrap");
        Ok(())
    }

    // ── Responses ──
    fn accepted_frontier(&mut self, peer: ShortId, request_id: u32, ids: Vec<Id>) -> EngineResult {
        Ok(())
    }
    fn accepted(&mut self, peer: ShortId, request_id: u32, ids: Vec<Id>) -> EngineResult {
        Ok(())
    }
    fn multi_put(
        &mut self,
        peer: ShortId,
        request_id: u32,
        containers: Vec<Vec<u8>>,
    ) -> EngineResult {
        Ok(())
    }
    fn put(
        &mut self,
        peer: ShortId,
        request_id: u32,
        vtx_id: Id,
        container: Vec<u8>,
    ) -> EngineResult {
        Ok(())
    }
    fn chits(&mut self, peer: ShortId, request_id: u32, votes: Vec<Id>) -> EngineResult {
        debug!(%peer, request_id, "dropping chits during bootstrap");
        Ok(())
    }

    // ── Synthesized failures ──
    fn get_accepted_frontier_failed(&mut self, peer: ShortId, request_id: u32) -> EngineResult {
        Ok(())
    }
    fn get_accepted_failed(&mut self, peer: ShortId, request_id: u32) -> EngineResult {
        Ok(())
    }
    fn get_ancestors_failed(&mut self, peer: ShortId, request_id: u32) -> EngineResult {
        Ok(())
    }
    fn get_failed(&mut self, peer: ShortId, request_id: u32) -> EngineResult {
        Ok(())
    }
    fn query_failed(&mut self, peer: ShortId, request_id: u32) -> EngineResult {
        Ok(())
    }

    /// The router is closing; abandon outstanding work. `on_finished`
    /// callbacks must not fire after this.
    fn halt(&mut self) {}
}

type SharedEngine = Arc<Mutex<Box<dyn Engine>>>;

/// Routes messages to the chain they address and owns the request table.
pub struct ChainRouter {
    chains: Mutex<HashMap<Id, SharedEngine>>,
    timeouts: Mutex<TimeoutManager<Op>>,
    closed: Mutex<bool>,
}

impl Default for ChainRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainRouter {
    pub fn new() -> Self {
        ChainRouter {
            chains: Mutex::new(HashMap::new()),
            timeouts: Mutex::new(TimeoutManager::default()),
            closed: Mutex::new(false),
        }
    }

    pub fn add_chain(&self, chain_id: Id, engine: Box<dyn Engine>) {
        self.chains
            .lock()
            .insert(chain_id, Arc::new(Mutex::new(engine)));
    }

    pub fn remove_chain(&self, chain_id: &Id) {
        self.chains.lock().remove(chain_id);
    }

    fn chain(&self, chain_id: &Id) -> Option<SharedEngine> {
        self.chains.lock().get(chain_id).cloned()
    }

    /// Record an outbound request so its response can be matched and its
    /// timeout fired. Returns the deadline. Called by senders with the
    /// request ID they minted; IDs are monotonically increasing per sender,
    /// so a `(peer, chain, id)` tuple never collides within a u32 window.
    pub fn register_request(
        &self,
        peer: ShortId,
        chain_id: Id,
        request_id: u32,
        op: Op,
        now: Instant,
    ) -> Instant {
        self.timeouts.lock().register(
            RequestKey {
                peer,
                chain_id,
                request_id,
            },
            op,
            now,
        )
    }

    /// Deliver an inbound message from `peer`. Responses that match no
    /// outstanding request (late, duplicate, or unsolicited) are dropped.
    pub fn handle(&self, peer: ShortId, msg: Message, now: Instant) {
        if *self.closed.lock() {
            debug!(%peer, op = %msg.op(), "router closed, dropping message");
            return;
        }
        let chain_id = msg.chain_id();
        let Some(engine) = self.chain(&chain_id) else {
            debug!(%peer, %chain_id, "message for unknown chain");
            return;
        };

        if let Some(expected) = msg.responds_to() {
            let key = RequestKey {
                peer,
                chain_id,
                request_id: msg.request_id(),
            };
            // Timeout table is touched outside the chain lock.
            let matched = self.timeouts.lock().response(&key, now);
            match matched {
                Some(op) if expected.contains(&op) => {}
                Some(op) => {
                    warn!(%peer, got = %msg.op(), expected = %op, "response kind mismatch, dropping");
                    return;
                }
                None => {
                    debug!(%peer, op = %msg.op(), request_id = msg.request_id(), "late or unsolicited response dropped");
                    return;
                }
            }
        }

        let mut engine = engine.lock();
        let result = match msg {
            Message::GetAcceptedFrontier { request_id, .. } => {
                engine.get_accepted_frontier(peer, request_id)
            }
            Message::AcceptedFrontier {
                request_id,
                container_ids,
                ..
            } => engine.accepted_frontier(peer, request_id, container_ids),
            Message::GetAccepted {
                request_id,
                container_ids,
                ..
            } => engine.get_accepted(peer, request_id, container_ids),
            Message::Accepted {
                request_id,
                container_ids,
                ..
            } => engine.accepted(peer, request_id, container_ids),
            Message::GetAncestors {
                request_id,
                container_id,
                ..
            } => engine.get_ancestors(peer, request_id, container_id),
            Message::MultiPut {
                request_id,
                containers,
                ..
            } => engine.multi_put(peer, request_id, containers),
            Message::Get {
                request_id,
                container_id,
                ..
            } => engine.get(peer, request_id, container_id),
            Message::Put {
                request_id,
                container_id,
                container,
                ..
            } => engine.put(peer, request_id, container_id, container),
            Message::PushQuery {
                request_id,
                container_id,
                container,
                ..
            } => engine.push_query(peer, request_id, container_id, container),
            Message::PullQuery {
                request_id,
                container_id,
                ..
            } => engine.pull_query(peer, request_id, container_id),
            Message::Chits {
                request_id, votes, ..
            } => engine.chits(peer, request_id, votes),
        };
        if let Err(err) = result {
            warn!(%peer, %err, "engine failed handling message");
        }
    }

    /// Fire `*Failed` events for every request whose deadline has passed.
    pub fn tick(&self, now: Instant) {
        let expired = self.timeouts.lock().expired(now);
        for (key, op) in expired {
            self.dispatch_failure(key, op);
        }
    }

    /// Close the router: every outstanding request fails immediately, every
    /// engine halts, and later messages are dropped.
    pub fn shutdown(&self) {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        let drained = self.timeouts.lock().drain();
        for (key, op) in drained {
            self.dispatch_failure(key, op);
        }
        let engines: Vec<SharedEngine> = self.chains.lock().values().cloned().collect();
        for engine in engines {
            engine.lock().halt();
        }
    }

    fn dispatch_failure(&self, key: RequestKey, op: Op) {
        let Some(engine) = self.chain(&key.chain_id) else {
            return;
        };
        let mut engine = engine.lock();
        let result = match op {
            Op::GetAcceptedFrontier => {
                engine.get_accepted_frontier_failed(key.peer, key.request_id)
            }
            Op::GetAccepted => engine.get_accepted_failed(key.peer, key.request_id),
            Op::GetAncestors => engine.get_ancestors_failed(key.peer, key.request_id),
            Op::Get => engine.get_failed(key.peer, key.request_id),
            Op::PushQuery | Op::PullQuery => engine.query_failed(key.peer, key.request_id),
            _ => Ok(()),
        };
        if let Err(err) = result {
            warn!(peer = %key.peer, %op, %err, "engine failed handling request failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn message_encode_decode_roundtrip() {
        let chain_id = Id([1u8; 32]);
        let msgs = vec![
            Message::GetAcceptedFrontier {
                chain_id,
                request_id: 1,
                deadline_ms: 500,
            },
            Message::AcceptedFrontier {
                chain_id,
                request_id: 1,
                container_ids: vec![Id([3u8; 32]), Id([2u8; 32])],
            },
            Message::GetAccepted {
                chain_id,
                request_id: 2,
                deadline_ms: 500,
                container_ids: vec![Id([4u8; 32])],
            },
            Message::Accepted {
                chain_id,
                request_id: 2,
                container_ids: vec![],
            },
            Message::GetAncestors {
                chain_id,
                request_id: 3,
                deadline_ms: 500,
                container_id: Id([5u8; 32]),
            },
            Message::MultiPut {
                chain_id,
                request_id: 3,
                containers: vec![vec![1, 2, 3], vec![4]],
            },
            Message::Get {
                chain_id,
                request_id: 4,
                deadline_ms: 500,
                container_id: Id([6u8; 32]),
            },
            Message::Put {
                chain_id,
                request_id: 4,
                container_id: Id([6u8; 32]),
                container: vec![9, 9],
            },
            Message::PushQuery {
                chain_id,
                request_id: 5,
                deadline_ms: 500,
                container_id: Id([7u8; 32]),
                container: vec![8],
            },
            Message::PullQuery {
                chain_id,
                request_id: 6,
                deadline_ms: 500,
                container_id: Id([7u8; 32]),
            },
            Message::Chits {
                chain_id,
                request_id: 6,
                votes: vec![Id([8u8; 32])],
            },
        ];
        for msg in msgs {
            let decoded = Message::decode(&msg.encode()).unwrap();
            // Sets come back sorted; everything else is byte-identical.
            assert_eq!(decoded.op(), msg.op());
            assert_eq!(decoded.chain_id(), msg.chain_id());
            assert_eq!(decoded.request_id(), msg.request_id());
            assert_eq!(decoded.encode(), msg.encode());
        }
    }

    #[test]
    fn id_sets_are_sorted_on_the_wire() {
        let msg = Message::AcceptedFrontier {
            chain_id: Id([1u8; 32]),
            request_id: 1,
            container_ids: vec![Id([9u8; 32]), Id([2u8; 32]), Id([5u8; 32])],
        };
        match Message::decode(&msg.encode()).unwrap() {
            Message::AcceptedFrontier { container_ids, .. } => {
                assert_eq!(
                    container_ids,
                    vec![Id([2u8; 32]), Id([5u8; 32]), Id([9u8; 32])]
                );
            }
            _ => panic!("wrong message kind"),
        }
    }

    #[test]
    fn oversized_multiput_rejected() {
        let mut w = Writer::new();
        w.write_u8(Op::MultiPut.code());
        w.write_id(&Id([1u8; 32]));
        w.write_u32(1);
        w.write_u32((MAX_MULTIPUT_CONTAINERS + 1) as u32);
        assert!(matches!(
            Message::decode(&w.into_bytes()),
            Err(CodecError::LengthOverflow(..)) | Err(CodecError::ShortBuffer)
        ));
    }

    #[derive(Default)]
    struct CountingEngine {
        multi_puts: Arc<AtomicUsize>,
        failures: Arc<AtomicUsize>,
    }

    impl Engine for CountingEngine {
        fn multi_put(
            &mut self,
            _peer: ShortId,
            _request_id: u32,
            _containers: Vec<Vec<u8>>,
        ) -> EngineResult {
            self.multi_puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn get_ancestors_failed(&mut self, _peer: ShortId, _request_id: u32) -> EngineResult {
            self.failures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_router() -> (ChainRouter, Id, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let chain_id = Id([1u8; 32]);
        let engine = CountingEngine::default();
        let multi_puts = Arc::clone(&engine.multi_puts);
        let failures = Arc::clone(&engine.failures);
        let router = ChainRouter::new();
        router.add_chain(chain_id, Box::new(engine));
        (router, chain_id, multi_puts, failures)
    }

    fn peer() -> ShortId {
        ShortId([7u8; 20])
    }

    #[test]
    fn matched_response_is_delivered_once() {
        let (router, chain_id, multi_puts, _) = counting_router();
        let now = Instant::now();
        router.register_request(peer(), chain_id, 1, Op::GetAncestors, now);

        let msg = Message::MultiPut {
            chain_id,
            request_id: 1,
            containers: vec![],
        };
        router.handle(peer(), msg.clone(), now);
        assert_eq!(multi_puts.load(Ordering::SeqCst), 1);

        // The duplicate finds no outstanding request and is dropped.
        router.handle(peer(), msg, now);
        assert_eq!(multi_puts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsolicited_response_dropped() {
        let (router, chain_id, multi_puts, _) = counting_router();
        router.handle(
            peer(),
            Message::MultiPut {
                chain_id,
                request_id: 42,
                containers: vec![],
            },
            Instant::now(),
        );
        assert_eq!(multi_puts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mismatched_response_kind_dropped() {
        let (router, chain_id, multi_puts, _) = counting_router();
        let now = Instant::now();
        router.register_request(peer(), chain_id, 1, Op::Get, now);
        router.handle(
            peer(),
            Message::MultiPut {
                chain_id,
                request_id: 1,
                containers: vec![],
            },
            now,
        );
        assert_eq!(multi_puts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expiry_synthesizes_failure_and_blocks_late_response() {
        let (router, chain_id, multi_puts, failures) = counting_router();
        let now = Instant::now();
        let deadline = router.register_request(peer(), chain_id, 1, Op::GetAncestors, now);

        router.tick(deadline);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // The real response arrives after the timeout: dropped.
        router.handle(
            peer(),
            Message::MultiPut {
                chain_id,
                request_id: 1,
                containers: vec![],
            },
            deadline,
        );
        assert_eq!(multi_puts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_fails_outstanding_and_drops_later_traffic() {
        let (router, chain_id, multi_puts, failures) = counting_router();
        let now = Instant::now();
        router.register_request(peer(), chain_id, 1, Op::GetAncestors, now);

        router.shutdown();
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        router.handle(
            peer(),
            Message::MultiPut {
                chain_id,
                request_id: 1,
                containers: vec![],
            },
            now,
        );
        assert_eq!(multi_puts.load(Ordering::SeqCst), 0);
    }
}
