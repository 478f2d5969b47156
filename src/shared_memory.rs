//! Cross-chain atomic value hand-off.
//!
//! An export places elements into the destination chain's shared keyspace;
//! an import consumes them by key. Consumption is combined with the
//! importing transaction's own state batch in a single cross-tree
//! transaction, so an element is consumable at most once across the union
//! of chains and a crash can never observe the import half-applied.

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};

use crate::ids::Id;

/// One exported value: an opaque key/value plus trait bytes (typically
/// owner addresses) for indexed lookup by the destination chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub traits: Vec<Vec<u8>>,
}

/// Errors from shared memory.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SharedMemoryError {
    #[error("shared memory I/O error: {0}")]
    Io(String),
    #[error("element {0} does not exist (already consumed?)")]
    MissingElement(String),
    #[error("element record corrupt: {0}")]
    Corrupt(String),
}

const ELEM_PREFIX: &[u8] = b"elem/";
const TRAIT_PREFIX: &[u8] = b"trait/";

fn elem_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ELEM_PREFIX.len() + key.len());
    out.extend_from_slice(ELEM_PREFIX);
    out.extend_from_slice(key);
    out
}

fn trait_key(trait_bytes: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TRAIT_PREFIX.len() + trait_bytes.len() + key.len());
    out.extend_from_slice(TRAIT_PREFIX);
    out.extend_from_slice(trait_bytes);
    out.extend_from_slice(key);
    out
}

/// Shared memory over one database, one keyspace per destination chain.
pub struct SharedMemory {
    db: sled::Db,
}

impl SharedMemory {
    pub fn new(db: sled::Db) -> Self {
        SharedMemory { db }
    }

    fn tree(&self, dest_chain: &Id) -> Result<sled::Tree, SharedMemoryError> {
        self.db
            .open_tree(format!("shared-{}", hex::encode(dest_chain.as_bytes())))
            .map_err(|e| SharedMemoryError::Io(e.to_string()))
    }

    /// Export `elements` for `dest_chain` to import later.
    pub fn put(&self, dest_chain: &Id, elements: &[Element]) -> Result<(), SharedMemoryError> {
        let tree = self.tree(dest_chain)?;
        let mut batch = sled::Batch::default();
        for element in elements {
            let bytes =
                bincode::serialize(element).map_err(|e| SharedMemoryError::Io(e.to_string()))?;
            batch.insert(elem_key(&element.key), bytes);
            for trait_bytes in &element.traits {
                batch.insert(trait_key(trait_bytes, &element.key), element.key.clone());
            }
        }
        tree.apply_batch(batch)
            .map_err(|e| SharedMemoryError::Io(e.to_string()))
    }

    /// Fetch elements by key; `None` for keys not present.
    pub fn get(
        &self,
        dest_chain: &Id,
        keys: &[Vec<u8>],
    ) -> Result<Vec<Option<Element>>, SharedMemoryError> {
        let tree = self.tree(dest_chain)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let element = tree
                .get(elem_key(key))
                .map_err(|e| SharedMemoryError::Io(e.to_string()))?
                .map(|bytes| {
                    bincode::deserialize(&bytes)
                        .map_err(|e| SharedMemoryError::Corrupt(e.to_string()))
                })
                .transpose()?;
            out.push(element);
        }
        Ok(out)
    }

    /// Keys carrying `trait_bytes`, in key order, up to `limit`.
    pub fn indexed(
        &self,
        dest_chain: &Id,
        trait_bytes: &[u8],
        limit: usize,
    ) -> Result<Vec<Vec<u8>>, SharedMemoryError> {
        let tree = self.tree(dest_chain)?;
        let mut prefix = Vec::with_capacity(TRAIT_PREFIX.len() + trait_bytes.len());
        prefix.extend_from_slice(TRAIT_PREFIX);
        prefix.extend_from_slice(trait_bytes);

        let mut out = Vec::new();
        for entry in tree.scan_prefix(&prefix) {
            let (_, value) = entry.map_err(|e| SharedMemoryError::Io(e.to_string()))?;
            out.push(value.to_vec());
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    /// Atomically consume `remove_keys` from `dest_chain`'s keyspace and
    /// apply `state_batch` to `state_tree` in the same transaction. Fails —
    /// applying nothing — if any element is missing, which is how a double
    /// consume surfaces.
    pub fn consume_with(
        &self,
        dest_chain: &Id,
        remove_keys: &[Vec<u8>],
        state_tree: &sled::Tree,
        state_batch: &sled::Batch,
    ) -> Result<(), SharedMemoryError> {
        let shared_tree = self.tree(dest_chain)?;
        let result = (&shared_tree, state_tree).transaction(|(shared, state)| {
            for key in remove_keys {
                let stored = shared.get(elem_key(key))?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(SharedMemoryError::MissingElement(
                        hex::encode(key),
                    ))
                })?;
                let element: Element = bincode::deserialize(&stored).map_err(|e| {
                    ConflictableTransactionError::Abort(SharedMemoryError::Corrupt(e.to_string()))
                })?;
                shared.remove(elem_key(key))?;
                for trait_bytes in &element.traits {
                    shared.remove(trait_key(trait_bytes, key))?;
                }
            }
            state.apply_batch(state_batch)?;
            Ok(())
        });
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(SharedMemoryError::Io(err.to_string())),
        }
    }
}
