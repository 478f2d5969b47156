//! Feature extensions: pluggable output/credential families.
//!
//! Each family ("fx") owns the rule for proving that a credential unlocks an
//! output. The registry dispatches on the output's family; consuming an
//! output with an input or credential from a different family is rejected
//! before any signature work.
//!
//! All three standard families authenticate with 65-byte recoverable ECDSA
//! signatures over the SHA-256 of the unsigned transaction: a signature
//! recovers to a public key, the key hashes to a 20-byte address
//! (RIPEMD160 ∘ SHA-256), and that address must sit at the signed index of
//! the output's owner list.

use std::collections::HashMap;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use super::verify::TxError;
use super::{Credential, Input, Output, OutputOwners, RecoverableSig};
use crate::ids::ShortId;

/// Identifier of a feature-extension family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FxId {
    Secp256k1,
    Nft,
    Property,
}

impl std::fmt::Display for FxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FxId::Secp256k1 => "secp256k1fx",
            FxId::Nft => "nftfx",
            FxId::Property => "propertyfx",
        };
        f.write_str(name)
    }
}

/// Hash a compressed public key to its 20-byte address form.
pub fn pubkey_to_address(compressed: &[u8]) -> ShortId {
    let sha = Sha256::digest(compressed);
    let rip = Ripemd160::digest(sha);
    ShortId(rip.into())
}

/// Recover the signing address from a recoverable signature over `digest`.
pub fn recover_address(digest: &[u8; 32], sig: &RecoverableSig) -> Result<ShortId, TxError> {
    let signature =
        Signature::from_slice(&sig[..64]).map_err(|_| TxError::InvalidCredential("bad signature"))?;
    let recovery_id = RecoveryId::from_byte(sig[64])
        .ok_or(TxError::InvalidCredential("bad recovery id"))?;
    let key = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
        .map_err(|_| TxError::InvalidCredential("unrecoverable signature"))?;
    Ok(pubkey_to_address(key.to_encoded_point(true).as_bytes()))
}

/// Shared owner check: `sig_indices` selects `threshold` addresses from
/// `owners`, and each signature must recover to the address at its index.
fn verify_owners(
    digest: &[u8; 32],
    sig_indices: &[u32],
    sigs: &[RecoverableSig],
    owners: &OutputOwners,
    now: u64,
) -> Result<(), TxError> {
    if owners.locktime > now {
        return Err(TxError::OwnerLocked {
            locktime: owners.locktime,
            now,
        });
    }
    if sig_indices.len() != owners.threshold as usize {
        return Err(TxError::InvalidCredential("wrong number of signature indices"));
    }
    if sigs.len() != sig_indices.len() {
        return Err(TxError::InvalidCredential("wrong number of signatures"));
    }
    for (sig, &idx) in sigs.iter().zip(sig_indices) {
        let addr = owners
            .addrs
            .get(idx as usize)
            .ok_or(TxError::InvalidCredential("signature index out of range"))?;
        if recover_address(digest, sig)? != *addr {
            return Err(TxError::InvalidCredential("signature does not match owner"));
        }
    }
    Ok(())
}

/// One feature extension's verifier.
pub trait Fx: Send + Sync {
    fn id(&self) -> FxId;

    /// Verify that `cred` authorizes consuming `out` through `input` for a
    /// transaction whose unsigned digest is `digest`.
    fn verify_spend(
        &self,
        digest: &[u8; 32],
        input: &Input,
        cred: &Credential,
        out: &Output,
        now: u64,
    ) -> Result<(), TxError>;

    /// Verify that `cred` authorizes operating on `out` (no amount flow).
    fn verify_operation(
        &self,
        digest: &[u8; 32],
        cred: &Credential,
        out: &Output,
        now: u64,
    ) -> Result<(), TxError> {
        let owners = out.owners();
        let indices: Vec<u32> = (0..owners.threshold).collect();
        verify_owners(digest, &indices, cred.sigs(), owners, now)
    }
}

/// The fungible secp256k1 family.
pub struct Secp256k1Fx;

impl Fx for Secp256k1Fx {
    fn id(&self) -> FxId {
        FxId::Secp256k1
    }

    fn verify_spend(
        &self,
        digest: &[u8; 32],
        input: &Input,
        cred: &Credential,
        out: &Output,
        now: u64,
    ) -> Result<(), TxError> {
        if input.amount() != out.amount() {
            return Err(TxError::AmountMismatch {
                input: input.amount(),
                output: out.amount(),
            });
        }
        verify_owners(digest, input.sig_indices(), cred.sigs(), out.owners(), now)
    }
}

/// The non-fungible token family. Amounts do not flow; ownership does.
pub struct NftFx;

impl Fx for NftFx {
    fn id(&self) -> FxId {
        FxId::Nft
    }

    fn verify_spend(
        &self,
        digest: &[u8; 32],
        input: &Input,
        cred: &Credential,
        out: &Output,
        now: u64,
    ) -> Result<(), TxError> {
        verify_owners(digest, input.sig_indices(), cred.sigs(), out.owners(), now)
    }
}

/// The property family: owned payloads updated through operations.
pub struct PropertyFx;

impl Fx for PropertyFx {
    fn id(&self) -> FxId {
        FxId::Property
    }

    fn verify_spend(
        &self,
        digest: &[u8; 32],
        input: &Input,
        cred: &Credential,
        out: &Output,
        now: u64,
    ) -> Result<(), TxError> {
        verify_owners(digest, input.sig_indices(), cred.sigs(), out.owners(), now)
    }
}

/// Registry dispatching verification to the family that owns an output.
pub struct FxRegistry {
    fxs: HashMap<FxId, Box<dyn Fx>>,
}

impl FxRegistry {
    /// The three standard families.
    pub fn standard() -> Self {
        let mut registry = FxRegistry {
            fxs: HashMap::new(),
        };
        registry.register(Box::new(Secp256k1Fx));
        registry.register(Box::new(NftFx));
        registry.register(Box::new(PropertyFx));
        registry
    }

    pub fn register(&mut self, fx: Box<dyn Fx>) {
        self.fxs.insert(fx.id(), fx);
    }

    pub fn get(&self, id: FxId) -> Option<&dyn Fx> {
        self.fxs.get(&id).map(|fx| fx.as_ref())
    }

    /// Family-checked spend verification: the output, input, and credential
    /// must all belong to the same registered family.
    pub fn verify_spend(
        &self,
        digest: &[u8; 32],
        input: &Input,
        cred: &Credential,
        out: &Output,
        now: u64,
    ) -> Result<(), TxError> {
        let fx_id = out.fx_id();
        if input.fx_id() != fx_id || cred.fx_id() != fx_id {
            return Err(TxError::IncompatibleFx {
                output: fx_id,
                input: input.fx_id(),
                credential: cred.fx_id(),
            });
        }
        let fx = self.get(fx_id).ok_or(TxError::UnknownFx(fx_id))?;
        fx.verify_spend(digest, input, cred, out, now)
    }

    /// Family-checked operation verification.
    pub fn verify_operation(
        &self,
        digest: &[u8; 32],
        cred: &Credential,
        out: &Output,
        now: u64,
    ) -> Result<(), TxError> {
        let fx_id = out.fx_id();
        if cred.fx_id() != fx_id {
            return Err(TxError::IncompatibleFx {
                output: fx_id,
                input: fx_id,
                credential: cred.fx_id(),
            });
        }
        let fx = self.get(fx_id).ok_or(TxError::UnknownFx(fx_id))?;
        fx.verify_operation(digest, cred, out, now)
    }
}
