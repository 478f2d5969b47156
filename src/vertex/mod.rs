//! DAG vertices and their lifecycle status.
//!
//! A vertex packages an ordered batch of transactions under an ordered set
//! of parent references. Its ID is the hash of its canonical encoding, so a
//! vertex received from any peer is self-authenticating.

pub mod store;

use crate::codec::{CodecError, Reader, Writer};
use crate::constants::{MAX_PARENTS, MAX_TXS_PER_VERTEX};
use crate::hash256;
use crate::ids::{is_sorted_and_unique, Id};
use crate::tx::{Tx, TxCodec};

/// Lifecycle of a vertex or transaction. Acceptance and rejection are
/// terminal; acceptance is monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Unknown,
    Processing,
    Rejected,
    Accepted,
}

impl Status {
    pub fn to_u32(self) -> u32 {
        match self {
            Status::Unknown => 0,
            Status::Processing => 1,
            Status::Rejected => 2,
            Status::Accepted => 3,
        }
    }

    pub fn from_u32(v: u32) -> Option<Status> {
        match v {
            0 => Some(Status::Unknown),
            1 => Some(Status::Processing),
            2 => Some(Status::Rejected),
            3 => Some(Status::Accepted),
            _ => None,
        }
    }

    /// Terminal states.
    pub fn decided(self) -> bool {
        matches!(self, Status::Accepted | Status::Rejected)
    }

    /// The local node holds the container's bytes.
    pub fn fetched(self) -> bool {
        matches!(self, Status::Processing | Status::Accepted)
    }
}

/// Errors from building or parsing vertices.
#[derive(Clone, Debug, thiserror::Error)]
pub enum VertexError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("vertex has no transactions")]
    NoTxs,
    #[error("vertex has {0} transactions, more than the maximum")]
    TooManyTxs(usize),
    #[error("vertex has {0} parents, more than the maximum")]
    TooManyParents(usize),
    #[error("parent ids not sorted and unique")]
    ParentsNotSorted,
    #[error("transactions not sorted by id")]
    TxsNotSorted,
    #[error("vertex store I/O: {0}")]
    Io(String),
}

/// A DAG vertex.
///
/// Invariants enforced at construction and parse: `id = hash(bytes)`,
/// parents lexicographically sorted and unique, transactions non-empty and
/// sorted by ID. The height invariant (`1 + max(parent.height)`) is checked
/// at acceptance, when parent heights are known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vertex {
    id: Id,
    chain_id: Id,
    height: u64,
    parents: Vec<Id>,
    txs: Vec<Tx>,
    bytes: Vec<u8>,
}

impl Vertex {
    /// Build a vertex, sorting parents and transactions into canonical
    /// order. Transactions already carry their canonical bytes, so no codec
    /// is needed here.
    pub fn build(
        chain_id: Id,
        height: u64,
        mut parents: Vec<Id>,
        mut txs: Vec<Tx>,
    ) -> Result<Vertex, VertexError> {
        parents.sort_unstable();
        parents.dedup();
        txs.sort_by_key(|tx| tx.id());

        if txs.is_empty() {
            return Err(VertexError::NoTxs);
        }
        if txs.len() > MAX_TXS_PER_VERTEX {
            return Err(VertexError::TooManyTxs(txs.len()));
        }
        if parents.len() > MAX_PARENTS {
            return Err(VertexError::TooManyParents(parents.len()));
        }

        let mut w = Writer::new();
        w.write_id(&chain_id);
        w.write_u64(height);
        w.write_len(parents.len());
        for parent in &parents {
            w.write_id(parent);
        }
        w.write_len(txs.len());
        for tx in &txs {
            w.write_bytes(tx.bytes());
        }
        let bytes = w.into_bytes();
        let id = Id(hash256(&bytes));
        Ok(Vertex {
            id,
            chain_id,
            height,
            parents,
            txs,
            bytes,
        })
    }

    /// Parse a vertex from its canonical bytes, enforcing every structural
    /// invariant. The whole slice must be consumed.
    pub fn parse(codec: &TxCodec, bytes: &[u8]) -> Result<Vertex, VertexError> {
        let mut r = Reader::new(bytes)?;
        let chain_id = r.read_id()?;
        let height = r.read_u64()?;

        let n = r.read_len()?;
        if n > MAX_PARENTS {
            return Err(VertexError::TooManyParents(n));
        }
        let mut parents = Vec::with_capacity(n);
        for _ in 0..n {
            parents.push(r.read_id()?);
        }
        if !is_sorted_and_unique(&parents) {
            return Err(VertexError::ParentsNotSorted);
        }

        let n = r.read_len()?;
        if n == 0 {
            return Err(VertexError::NoTxs);
        }
        if n > MAX_TXS_PER_VERTEX {
            return Err(VertexError::TooManyTxs(n));
        }
        let mut txs = Vec::with_capacity(n);
        for _ in 0..n {
            let tx_bytes = r.read_bytes()?;
            txs.push(codec.parse_tx(tx_bytes).map_err(VertexError::Codec)?);
        }
        if !txs.windows(2).all(|w| w[0].id() < w[1].id()) {
            return Err(VertexError::TxsNotSorted);
        }
        r.done()?;

        Ok(Vertex {
            id: Id(hash256(bytes)),
            chain_id,
            height,
            parents,
            txs,
            bytes: bytes.to_vec(),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn chain_id(&self) -> Id {
        self.chain_id
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Parent IDs; [`Id::EMPTY`] is the genesis sentinel and is implicitly
    /// accepted.
    pub fn parents(&self) -> &[Id] {
        &self.parents
    }

    pub fn txs(&self) -> &[Tx] {
        &self.txs
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::{AdvanceTimeTx, UnsignedTx};

    fn test_tx(codec: &TxCodec, time: u64) -> Tx {
        codec
            .build_tx(UnsignedTx::Advance(AdvanceTimeTx { time }), vec![])
            .unwrap()
    }

    #[test]
    fn build_parse_roundtrip() {
        let codec = TxCodec::new();
        let chain = Id([1u8; 32]);
        let vtx = Vertex::build(
            chain,
            3,
            vec![Id([9u8; 32]), Id([4u8; 32])],
            vec![test_tx(&codec, 1), test_tx(&codec, 2)],
        )
        .unwrap();

        let parsed = Vertex::parse(&codec, vtx.bytes()).unwrap();
        assert_eq!(parsed, vtx);
        assert_eq!(parsed.id(), vtx.id());
        assert_eq!(parsed.height(), 3);
        assert_eq!(parsed.chain_id(), chain);
        // Canonical order regardless of build order.
        assert!(parsed.parents().windows(2).all(|w| w[0] < w[1]));
        assert!(parsed.txs().windows(2).all(|w| w[0].id() < w[1].id()));
    }

    #[test]
    fn id_is_hash_of_bytes() {
        let codec = TxCodec::new();
        let vtx = Vertex::build(Id::EMPTY, 0, vec![], vec![test_tx(&codec, 1)]).unwrap();
        assert_eq!(vtx.id(), Id(crate::hash256(vtx.bytes())));
    }

    #[test]
    fn empty_txs_rejected() {
        assert!(matches!(
            Vertex::build(Id::EMPTY, 0, vec![], vec![]),
            Err(VertexError::NoTxs)
        ));
    }

    #[test]
    fn unsorted_parents_rejected_at_parse() {
        let codec = TxCodec::new();
        let vtx = Vertex::build(
            Id::EMPTY,
            1,
            vec![Id([1u8; 32]), Id([2u8; 32])],
            vec![test_tx(&codec, 1)],
        )
        .unwrap();

        // Swap the two parent ids in the raw encoding.
        let mut bytes = vtx.bytes().to_vec();
        // Layout: version(2) | chain(32) | height(8) | parent count(4) | ids.
        let base = 2 + 32 + 8 + 4;
        let (a, b) = (base, base + 32);
        let tmp: Vec<u8> = bytes[a..a + 32].to_vec();
        bytes.copy_within(b..b + 32, a);
        bytes[b..b + 32].copy_from_slice(&tmp);

        assert!(matches!(
            Vertex::parse(&codec, &bytes),
            Err(VertexError::ParentsNotSorted)
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let codec = TxCodec::new();
        let vtx = Vertex::build(Id::EMPTY, 0, vec![], vec![test_tx(&codec, 1)]).unwrap();
        let mut bytes = vtx.bytes().to_vec();
        bytes.push(0xAA);
        assert!(Vertex::parse(&codec, &bytes).is_err());
    }

    #[test]
    fn status_codes_roundtrip() {
        for status in [
            Status::Unknown,
            Status::Processing,
            Status::Rejected,
            Status::Accepted,
        ] {
            assert_eq!(Status::from_u32(status.to_u32()), Some(status));
        }
        assert_eq!(Status::from_u32(9), None);
        assert!(Status::Accepted.decided());
        assert!(Status::Rejected.decided());
        assert!(!Status::Processing.decided());
        assert!(Status::Processing.fetched());
        assert!(!Status::Unknown.fetched());
    }
}
