//! # Starling
//!
//! Core of a leaderless DAG consensus node for a multi-chain cryptoasset
//! network:
//! - **Bootstrap engine** — discovers the accepted frontier from trusted
//!   beacons, fetches every ancestor, and accepts vertices in a topologically
//!   valid order that tolerates byzantine peer responses
//! - **Vertex store** — cached, parse-on-read, content-addressed persistence
//!   of DAG vertices, statuses, and frontier edges
//! - **UTXO pipeline** — syntactic and semantic transaction verification with
//!   flow balance, credential checks, and stake-lock semantics
//! - **Routing plane** — per-chain message dispatch with adaptive per-request
//!   timeouts and guaranteed completion events
//! - **Shared memory** — crash-atomic cross-chain UTXO hand-off

pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod ids;
pub mod node;
pub mod queue;
pub mod router;
pub mod sampler;
pub mod shared_memory;
pub mod timeout;
pub mod tx;
pub mod utxo;
pub mod validators;
pub mod vertex;

/// Protocol constants
pub mod constants {
    /// Maximum number of containers in a single MultiPut response.
    pub const MAX_MULTIPUT_CONTAINERS: usize = 2048;
    /// Maximum total byte size of a MultiPut response (1 MiB).
    pub const MAX_MULTIPUT_BYTES: usize = 1024 * 1024;
    /// Maximum memo length in a transaction.
    pub const MAX_MEMO_BYTES: usize = 256;
    /// Maximum number of parent references per DAG vertex.
    pub const MAX_PARENTS: usize = 128;
    /// Maximum transactions per DAG vertex.
    pub const MAX_TXS_PER_VERTEX: usize = 1024;
    /// Entries held by the vertex store's LRU cache.
    pub const VERTEX_CACHE_ENTRIES: usize = 2048;
    /// Consecutive ancestor-fetch failures tolerated before the vertex is
    /// reset to Unknown and the fetch rotates to another peer.
    pub const MAX_FETCH_RETRIES: u32 = 5;
    /// Lower clamp for the adaptive request timeout, in milliseconds.
    pub const MIN_REQUEST_TIMEOUT_MS: u64 = 500;
    /// Upper clamp for the adaptive request timeout, in milliseconds.
    pub const MAX_REQUEST_TIMEOUT_MS: u64 = 30_000;
    /// Initial request timeout before any RTT has been observed.
    pub const INITIAL_REQUEST_TIMEOUT_MS: u64 = 5_000;
    /// Default number of beacons sampled for frontier discovery.
    pub const DEFAULT_SAMPLE_SIZE: u32 = 20;
    /// Default transaction fee in base units.
    pub const DEFAULT_TX_FEE: u64 = 1_000_000;
    /// Default minimum validator stake in base units.
    pub const DEFAULT_MIN_STAKE: u64 = 2_000_000_000_000;
    /// Default gossip frequency in milliseconds.
    pub const DEFAULT_GOSSIP_FREQUENCY_MS: u64 = 10_000;
    /// Default shutdown drain timeout in milliseconds.
    pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
}

/// Compute the SHA-256 content hash of `data`.
///
/// Vertex and transaction IDs are the hash of their canonical encoding, so
/// every container is self-authenticating: a peer cannot forge bytes for an
/// ID it does not possess.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 over the concatenation of `parts`, without length framing.
///
/// Only used where every part has a static size (e.g. ID prefix derivation);
/// variable-width parts would make the concatenation ambiguous.
pub fn hash256_parts(parts: &[&[u8]]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}
