//! UTXO model and the persistent, address-indexed UTXO set.
//!
//! A UTXO exists iff an accepted transaction produced it and no accepted
//! transaction has consumed it. Production and consumption for one
//! transaction land in a single atomic batch, so a crash can never observe a
//! half-applied spend.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, Reader, Writer};
use crate::ids::{Id, ShortId};
use crate::tx::{Output, TxCodec};

/// Location of an output: the producing transaction and its output slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UtxoId {
    pub tx_id: Id,
    pub output_index: u32,
}

impl UtxoId {
    /// The derived key this UTXO is addressed by:
    /// `prefix(tx_id, output_index)`.
    pub fn input_id(&self) -> Id {
        self.tx_id.prefix(self.output_index as u64)
    }
}

impl fmt::Display for UtxoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

/// An unspent output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub utxo_id: UtxoId,
    pub asset_id: Id,
    pub out: Output,
}

impl Utxo {
    pub fn input_id(&self) -> Id {
        self.utxo_id.input_id()
    }

    pub fn encode(&self, codec: &TxCodec) -> Result<Vec<u8>, CodecError> {
        let mut w = Writer::new();
        w.write_id(&self.utxo_id.tx_id);
        w.write_u32(self.utxo_id.output_index);
        w.write_id(&self.asset_id);
        codec.write_output(&mut w, &self.out)?;
        Ok(w.into_bytes())
    }

    pub fn decode(codec: &TxCodec, bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes)?;
        let tx_id = r.read_id()?;
        let output_index = r.read_u32()?;
        let asset_id = r.read_id()?;
        let out = codec.decode_output(&mut r)?;
        r.done()?;
        Ok(Utxo {
            utxo_id: UtxoId {
                tx_id,
                output_index,
            },
            asset_id,
            out,
        })
    }
}

/// Errors from the UTXO store.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UtxoError {
    #[error("utxo store I/O error: {0}")]
    Io(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The net UTXO effect of accepting one transaction.
#[derive(Clone, Debug, Default)]
pub struct UtxoDelta {
    pub produced: Vec<Utxo>,
    /// Input IDs of consumed UTXOs.
    pub consumed: Vec<Id>,
}

const UTXO_PREFIX: &[u8] = b"utx/";
const ADDR_INDEX_PREFIX: &[u8] = b"idx/addr/";

/// Persistent UTXO set over a chain's keyspace.
///
/// Layout: `utx/<input_id>` holds the encoded UTXO, and
/// `idx/addr/<addr><input_id>` marks every owning address for paginated
/// address lookups.
pub struct UtxoDb {
    tree: sled::Tree,
    codec: std::sync::Arc<TxCodec>,
}

impl UtxoDb {
    pub fn new(tree: sled::Tree, codec: std::sync::Arc<TxCodec>) -> Self {
        UtxoDb { tree, codec }
    }

    fn utxo_key(input_id: &Id) -> Vec<u8> {
        let mut key = Vec::with_capacity(UTXO_PREFIX.len() + 32);
        key.extend_from_slice(UTXO_PREFIX);
        key.extend_from_slice(input_id.as_bytes());
        key
    }

    fn index_key(addr: &ShortId, input_id: &Id) -> Vec<u8> {
        let mut key = Vec::with_capacity(ADDR_INDEX_PREFIX.len() + 20 + 32);
        key.extend_from_slice(ADDR_INDEX_PREFIX);
        key.extend_from_slice(addr.as_bytes());
        key.extend_from_slice(input_id.as_bytes());
        key
    }

    pub fn utxo(&self, input_id: &Id) -> Result<Option<Utxo>, UtxoError> {
        match self
            .tree
            .get(Self::utxo_key(input_id))
            .map_err(|e| UtxoError::Io(e.to_string()))?
        {
            Some(bytes) => Ok(Some(Utxo::decode(&self.codec, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, input_id: &Id) -> Result<bool, UtxoError> {
        self.tree
            .contains_key(Self::utxo_key(input_id))
            .map_err(|e| UtxoError::Io(e.to_string()))
    }

    /// Stage a delta into a [`sled::Batch`] without applying it. Reads the
    /// consumed UTXOs first so their index entries can be deleted with them.
    pub fn stage(&self, delta: &UtxoDelta) -> Result<sled::Batch, UtxoError> {
        let mut batch = sled::Batch::default();
        for input_id in &delta.consumed {
            if let Some(utxo) = self.utxo(input_id)? {
                for addr in &utxo.out.owners().addrs {
                    batch.remove(Self::index_key(addr, input_id));
                }
            }
            batch.remove(Self::utxo_key(input_id));
        }
        for utxo in &delta.produced {
            let input_id = utxo.input_id();
            batch.insert(Self::utxo_key(&input_id), utxo.encode(&self.codec)?);
            for addr in &utxo.out.owners().addrs {
                batch.insert(Self::index_key(addr, &input_id), &b""[..]);
            }
        }
        Ok(batch)
    }

    /// Apply a delta atomically.
    pub fn commit(&self, delta: &UtxoDelta) -> Result<(), UtxoError> {
        let batch = self.stage(delta)?;
        self.tree
            .apply_batch(batch)
            .map_err(|e| UtxoError::Io(e.to_string()))
    }

    /// Input IDs owned by `addr`, in key order, starting strictly after
    /// `start` if given. Returns at most `limit` entries.
    pub fn utxo_ids_by_address(
        &self,
        addr: &ShortId,
        start: Option<Id>,
        limit: usize,
    ) -> Result<Vec<Id>, UtxoError> {
        let mut prefix = Vec::with_capacity(ADDR_INDEX_PREFIX.len() + 20);
        prefix.extend_from_slice(ADDR_INDEX_PREFIX);
        prefix.extend_from_slice(addr.as_bytes());

        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(&prefix) {
            let (key, _) = entry.map_err(|e| UtxoError::Io(e.to_string()))?;
            let input_id = Id::from_slice(&key[prefix.len()..])
                .map_err(|_| UtxoError::Io("corrupt address index key".into()))?;
            if let Some(start) = start {
                if input_id <= start {
                    continue;
                }
            }
            out.push(input_id);
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }
}
