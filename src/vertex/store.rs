//! Cached, parse-on-read persistence for vertices, statuses, and frontier
//! edges.
//!
//! Three logical namespaces over one keyspace, all keyed by ID bytes:
//! `vtx/` holds canonical vertex bytes (parsed on read), `sts/` holds `u32`
//! statuses (missing key means Unknown), `edg/` holds length-prefixed
//! frontier ID lists. Reads fill a bounded LRU cache with both positive and
//! negative results; writes go through the cache to the database. A parse
//! failure on a stored value is logged and treated as a miss — it never
//! evicts neighboring keys.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::error;

use crate::codec::{Reader, Writer};
use crate::constants::VERTEX_CACHE_ENTRIES;
use crate::ids::Id;
use crate::tx::TxCodec;
use crate::vertex::{Status, Vertex};

/// Errors from the vertex store. Parse failures are not errors: they are
/// logged and surfaced as misses.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("vertex store I/O error: {0}")]
    Io(String),
}

const VERTEX_PREFIX: &[u8] = b"vtx/";
const STATUS_PREFIX: &[u8] = b"sts/";
const EDGE_PREFIX: &[u8] = b"edg/";

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Namespace {
    Vertex,
    Status,
    Edge,
}

#[derive(Clone)]
enum CacheEntry {
    Vertex(Option<Arc<Vertex>>),
    Status(Status),
    Edge(Vec<Id>),
}

fn key(prefix: &[u8], id: &Id) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 32);
    key.extend_from_slice(prefix);
    key.extend_from_slice(id.as_bytes());
    key
}

/// The persistent DAG state for one chain.
pub struct VertexStore {
    tree: sled::Tree,
    codec: Arc<TxCodec>,
    cache: Mutex<LruCache<(Namespace, Id), CacheEntry>>,
}

impl VertexStore {
    pub fn new(tree: sled::Tree, codec: Arc<TxCodec>) -> Self {
        let cap = NonZeroUsize::new(VERTEX_CACHE_ENTRIES).unwrap();
        VertexStore {
            tree,
            codec,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Fetch and parse a vertex. Misses and unparseable values return
    /// `None`; both outcomes are cached.
    pub fn vertex(&self, id: &Id) -> Result<Option<Arc<Vertex>>, StoreError> {
        if let Some(CacheEntry::Vertex(hit)) = self.cache.lock().get(&(Namespace::Vertex, *id)) {
            return Ok(hit.clone());
        }

        let found = self
            .tree
            .get(key(VERTEX_PREFIX, id))
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let vertex = match found {
            Some(bytes) => match Vertex::parse(&self.codec, &bytes) {
                Ok(vertex) => Some(Arc::new(vertex)),
                Err(err) => {
                    error!(%id, %err, "parsing failed on saved vertex");
                    None
                }
            },
            None => None,
        };

        self.cache.lock().put(
            (Namespace::Vertex, *id),
            CacheEntry::Vertex(vertex.clone()),
        );
        Ok(vertex)
    }

    /// Write-through a vertex; `None` deletes.
    pub fn set_vertex(&self, id: &Id, vertex: Option<&Vertex>) -> Result<(), StoreError> {
        self.cache.lock().put(
            (Namespace::Vertex, *id),
            CacheEntry::Vertex(vertex.map(|v| Arc::new(v.clone()))),
        );
        match vertex {
            Some(vertex) => self
                .tree
                .insert(key(VERTEX_PREFIX, id), vertex.bytes())
                .map(|_| ())
                .map_err(|e| StoreError::Io(e.to_string())),
            None => self
                .tree
                .remove(key(VERTEX_PREFIX, id))
                .map(|_| ())
                .map_err(|e| StoreError::Io(e.to_string())),
        }
    }

    /// Status of a vertex or transaction; a missing key is Unknown.
    pub fn status(&self, id: &Id) -> Result<Status, StoreError> {
        if let Some(CacheEntry::Status(hit)) = self.cache.lock().get(&(Namespace::Status, *id)) {
            return Ok(*hit);
        }

        let found = self
            .tree
            .get(key(STATUS_PREFIX, id))
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let status = match found {
            Some(bytes) => {
                let mut r = Reader::bare(&bytes);
                match r.read_u32().ok().and_then(Status::from_u32) {
                    Some(status) if r.remaining() == 0 => status,
                    _ => {
                        error!(%id, "parsing failed on saved status");
                        Status::Unknown
                    }
                }
            }
            None => Status::Unknown,
        };

        self.cache
            .lock()
            .put((Namespace::Status, *id), CacheEntry::Status(status));
        Ok(status)
    }

    /// Write-through a status; Unknown deletes.
    pub fn set_status(&self, id: &Id, status: Status) -> Result<(), StoreError> {
        self.cache
            .lock()
            .put((Namespace::Status, *id), CacheEntry::Status(status));
        if status == Status::Unknown {
            return self
                .tree
                .remove(key(STATUS_PREFIX, id))
                .map(|_| ())
                .map_err(|e| StoreError::Io(e.to_string()));
        }
        let mut w = Writer::bare();
        w.write_u32(status.to_u32());
        self.tree
            .insert(key(STATUS_PREFIX, id), w.into_bytes())
            .map(|_| ())
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    /// The frontier edge list stored under `id`.
    pub fn edge(&self, id: &Id) -> Result<Vec<Id>, StoreError> {
        if let Some(CacheEntry::Edge(hit)) = self.cache.lock().get(&(Namespace::Edge, *id)) {
            return Ok(hit.clone());
        }

        let found = self
            .tree
            .get(key(EDGE_PREFIX, id))
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let frontier = match found {
            Some(bytes) => parse_edge(&bytes).unwrap_or_else(|| {
                error!(%id, "parsing failed on saved frontier ids");
                Vec::new()
            }),
            None => Vec::new(),
        };

        self.cache
            .lock()
            .put((Namespace::Edge, *id), CacheEntry::Edge(frontier.clone()));
        Ok(frontier)
    }

    /// Write-through the frontier; an empty list deletes.
    pub fn set_edge(&self, id: &Id, frontier: Vec<Id>) -> Result<(), StoreError> {
        self.cache
            .lock()
            .put((Namespace::Edge, *id), CacheEntry::Edge(frontier.clone()));
        if frontier.is_empty() {
            return self
                .tree
                .remove(key(EDGE_PREFIX, id))
                .map(|_| ())
                .map_err(|e| StoreError::Io(e.to_string()));
        }
        let mut w = Writer::bare();
        w.write_len(frontier.len());
        for id in &frontier {
            w.write_id(id);
        }
        self.tree
            .insert(key(EDGE_PREFIX, id), w.into_bytes())
            .map(|_| ())
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

fn parse_edge(bytes: &[u8]) -> Option<Vec<Id>> {
    let mut r = Reader::bare(bytes);
    let n = r.read_len().ok()?;
    let mut frontier = Vec::with_capacity(n);
    for _ in 0..n {
        frontier.push(r.read_id().ok()?);
    }
    if r.remaining() != 0 {
        return None;
    }
    Some(frontier)
}
