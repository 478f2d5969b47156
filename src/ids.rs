//! Opaque identifiers used throughout the protocol.
//!
//! Two widths: 32-byte [`Id`] for content-addressed containers (vertices,
//! transactions, chains, assets) and 20-byte [`ShortId`] for addresses and
//! node identities. Both render as CB58 (base58 with a 4-byte SHA-256
//! checksum suffix); addresses additionally carry a chain tag and a bech32
//! body, e.g. `X-starling1...`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bech32::{FromBase32, ToBase32, Variant};
use serde::{Deserialize, Serialize};

use crate::hash256_parts;

/// Byte length of an [`Id`].
pub const ID_LEN: usize = 32;
/// Byte length of a [`ShortId`].
pub const SHORT_ID_LEN: usize = 20;

/// Errors from parsing textual identifier forms.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("expected {expected} bytes, got {got}")]
    WrongLength { expected: usize, got: usize },
    #[error("invalid base58: {0}")]
    Base58(String),
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("invalid bech32: {0}")]
    Bech32(String),
    #[error("missing chain tag (expected e.g. \"X-...\")")]
    MissingChainTag,
}

/// A 32-byte opaque identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub [u8; ID_LEN]);

impl Id {
    /// The all-zero sentinel. Used as the genesis parent reference, which is
    /// implicitly accepted.
    pub const EMPTY: Id = Id([0u8; ID_LEN]);

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; ID_LEN] = bytes.try_into().map_err(|_| IdError::WrongLength {
            expected: ID_LEN,
            got: bytes.len(),
        })?;
        Ok(Id(arr))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Derive a child ID: `prefix(id, n) = hash(id ‖ n)`.
    ///
    /// Used to mint per-output UTXO IDs from `(txID, outputIndex)`.
    pub fn prefix(&self, n: u64) -> Id {
        Id(hash256_parts(&[&self.0, &n.to_be_bytes()]))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&cb58_encode(&self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", cb58_encode(&self.0))
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, IdError> {
        Id::from_slice(&cb58_decode(s)?)
    }
}

/// A 20-byte address or node identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShortId(pub [u8; SHORT_ID_LEN]);

impl ShortId {
    pub const EMPTY: ShortId = ShortId([0u8; SHORT_ID_LEN]);

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; SHORT_ID_LEN] = bytes.try_into().map_err(|_| IdError::WrongLength {
            expected: SHORT_ID_LEN,
            got: bytes.len(),
        })?;
        Ok(ShortId(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SHORT_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&cb58_encode(&self.0))
    }
}

impl fmt::Debug for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortId({})", cb58_encode(&self.0))
    }
}

impl FromStr for ShortId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, IdError> {
        ShortId::from_slice(&cb58_decode(s)?)
    }
}

/// Encode bytes as CB58: base58 over `data ‖ sha256(data)[28..32]`.
pub fn cb58_encode(data: &[u8]) -> String {
    let checksum = crate::hash256(data);
    let mut buf = Vec::with_capacity(data.len() + 4);
    buf.extend_from_slice(data);
    buf.extend_from_slice(&checksum[28..32]);
    bs58::encode(buf).into_string()
}

/// Decode a CB58 string, verifying the 4-byte checksum suffix.
pub fn cb58_decode(s: &str) -> Result<Vec<u8>, IdError> {
    let raw = bs58::decode(s)
        .into_vec()
        .map_err(|e| IdError::Base58(e.to_string()))?;
    if raw.len() < 4 {
        return Err(IdError::BadChecksum);
    }
    let (data, checksum) = raw.split_at(raw.len() - 4);
    if crate::hash256(data)[28..32] != *checksum {
        return Err(IdError::BadChecksum);
    }
    Ok(data.to_vec())
}

/// Render an address: chain tag, dash, bech32 body, e.g. `X-starling1...`.
///
/// `hrp` is the network's human-readable part ("starling" on mainnet, a
/// network-ID-suffixed variant elsewhere).
pub fn format_address(chain: &str, hrp: &str, addr: &ShortId) -> Result<String, IdError> {
    let body = bech32::encode(hrp, addr.0.to_base32(), Variant::Bech32)
        .map_err(|e| IdError::Bech32(e.to_string()))?;
    Ok(format!("{chain}-{body}"))
}

/// Parse an address of the form `X-starling1...` into its chain tag, HRP,
/// and 20-byte payload.
pub fn parse_address(s: &str) -> Result<(String, String, ShortId), IdError> {
    let (chain, body) = s.split_once('-').ok_or(IdError::MissingChainTag)?;
    if chain.is_empty() {
        return Err(IdError::MissingChainTag);
    }
    let (hrp, data, _variant) =
        bech32::decode(body).map_err(|e| IdError::Bech32(e.to_string()))?;
    let bytes = Vec::<u8>::from_base32(&data).map_err(|e| IdError::Bech32(e.to_string()))?;
    Ok((chain.to_string(), hrp, ShortId::from_slice(&bytes)?))
}

/// Bidirectional alias table mapping IDs to human-readable names.
///
/// Chains register aliases ("X", "P", "C") so logs and addresses can name
/// them without dumping CB58. The first alias registered for an ID is its
/// primary alias.
#[derive(Debug, Default)]
pub struct Aliaser {
    id_to_aliases: HashMap<Id, Vec<String>>,
    alias_to_id: HashMap<String, Id>,
}

impl Aliaser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `alias` for `id`. Returns false if the alias is already
    /// bound to a different ID.
    pub fn alias(&mut self, id: Id, alias: &str) -> bool {
        match self.alias_to_id.get(alias) {
            Some(existing) if *existing != id => return false,
            Some(_) => return true,
            None => {}
        }
        self.alias_to_id.insert(alias.to_string(), id);
        self.id_to_aliases
            .entry(id)
            .or_default()
            .push(alias.to_string());
        true
    }

    /// Look up the ID bound to `alias`.
    pub fn lookup(&self, alias: &str) -> Option<Id> {
        self.alias_to_id.get(alias).copied()
    }

    /// The first alias registered for `id`, or its CB58 form if none.
    pub fn primary_alias(&self, id: &Id) -> String {
        self.id_to_aliases
            .get(id)
            .and_then(|aliases| aliases.first())
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    pub fn aliases(&self, id: &Id) -> &[String] {
        self.id_to_aliases
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Drop every alias bound to `id`.
    pub fn remove_aliases(&mut self, id: &Id) {
        if let Some(aliases) = self.id_to_aliases.remove(id) {
            for alias in aliases {
                self.alias_to_id.remove(&alias);
            }
        }
    }
}

/// True iff `ids` is strictly increasing in byte order (sorted and unique).
pub fn is_sorted_and_unique(ids: &[Id]) -> bool {
    ids.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_deterministic_and_distinct() {
        let id = Id([7u8; 32]);
        assert_eq!(id.prefix(0), id.prefix(0));
        assert_ne!(id.prefix(0), id.prefix(1));
        assert_ne!(id.prefix(0), id);
    }

    #[test]
    fn cb58_roundtrip() {
        let id = Id([42u8; 32]);
        let s = id.to_string();
        let back: Id = s.parse().unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn cb58_rejects_corrupted_checksum() {
        let id = Id([42u8; 32]);
        let mut s = id.to_string();
        // Flip the last character to another base58 digit.
        let last = s.pop().unwrap();
        s.push(if last == '2' { '3' } else { '2' });
        assert!(s.parse::<Id>().is_err());
    }

    #[test]
    fn cb58_rejects_short_input() {
        assert_eq!(cb58_decode("2g"), Err(IdError::BadChecksum));
    }

    #[test]
    fn short_id_roundtrip() {
        let addr = ShortId([9u8; 20]);
        let back: ShortId = addr.to_string().parse().unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn address_roundtrip() {
        let addr = ShortId([1u8; 20]);
        let s = format_address("X", "starling", &addr).unwrap();
        assert!(s.starts_with("X-starling1"));
        let (chain, hrp, back) = parse_address(&s).unwrap();
        assert_eq!(chain, "X");
        assert_eq!(hrp, "starling");
        assert_eq!(back, addr);
    }

    #[test]
    fn address_requires_chain_tag() {
        let addr = ShortId([1u8; 20]);
        let s = format_address("P", "starling", &addr).unwrap();
        let body = s.split_once('-').unwrap().1;
        assert_eq!(parse_address(body), Err(IdError::MissingChainTag));
    }

    #[test]
    fn aliaser_primary_and_conflict() {
        let mut aliaser = Aliaser::new();
        let x = Id([1u8; 32]);
        let p = Id([2u8; 32]);

        assert!(aliaser.alias(x, "X"));
        assert!(aliaser.alias(x, "swap"));
        assert!(aliaser.alias(p, "P"));
        // "X" is taken by a different ID.
        assert!(!aliaser.alias(p, "X"));

        assert_eq!(aliaser.lookup("X"), Some(x));
        assert_eq!(aliaser.primary_alias(&x), "X");
        assert_eq!(aliaser.aliases(&x).len(), 2);

        aliaser.remove_aliases(&x);
        assert_eq!(aliaser.lookup("X"), None);
        assert_eq!(aliaser.primary_alias(&x), x.to_string());
    }

    #[test]
    fn sorted_unique_check() {
        let a = Id([1u8; 32]);
        let b = Id([2u8; 32]);
        assert!(is_sorted_and_unique(&[]));
        assert!(is_sorted_and_unique(&[a]));
        assert!(is_sorted_and_unique(&[a, b]));
        assert!(!is_sorted_and_unique(&[b, a]));
        assert!(!is_sorted_and_unique(&[a, a]));
    }
}
