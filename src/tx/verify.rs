//! Two-phase transaction verification.
//!
//! **Syntactic** verification is pure: structural well-formedness against the
//! chain context, cached on the transaction once it passes. **Semantic**
//! verification runs against a UTXO view and produces the transaction's
//! effects (local UTXO delta, shared-memory consumption, exports) without
//! committing anything; the caller applies effects atomically.
//!
//! Every error carries a disposition: permanent errors reject the
//! transaction and its dependents, temporary errors leave it Processing for
//! retry.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::codec::CodecError;
use crate::constants::MAX_MEMO_BYTES;
use crate::ids::Id;
use crate::tx::fx::{FxId, FxRegistry};
use crate::tx::{Output, TransferableInput, TransferableOutput, Tx, TxCodec, UnsignedTx};
use crate::utxo::{Utxo, UtxoDelta, UtxoId};

/// Whether an error can be retried or condemns the entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Rule violation: reject, abandon dependents, never retry.
    Permanent,
    /// I/O or missing precondition that may yet arrive: retry.
    Temporary,
}

/// Errors from transaction verification.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TxError {
    #[error("wrong network id: tx {tx}, chain {chain}")]
    WrongNetwork { tx: u32, chain: u32 },
    #[error("wrong chain id")]
    WrongChain,
    #[error("memo of {0} bytes exceeds limit")]
    MemoTooLarge(usize),
    #[error("output amount must be positive")]
    ZeroAmount,
    #[error("owner threshold exceeds address count or is zero with owners")]
    InvalidThreshold,
    #[error("owner addresses not sorted and unique")]
    AddrsNotSortedUnique,
    #[error("signature indices not sorted and unique")]
    SigIndicesNotSortedUnique,
    #[error("inputs not sorted and unique by (asset, input id)")]
    InputsNotSorted,
    #[error("outputs not sorted by (asset, encoded output)")]
    OutputsNotSorted,
    #[error("expected {expected} credentials, got {got}")]
    WrongCredentialCount { expected: usize, got: usize },
    #[error("stakeable lock must not nest another stakeable lock")]
    NestedStakeLock,
    #[error("stakeable lock has zero locktime")]
    ZeroLocktime,
    #[error("stake outputs sum to {total}, declared weight {weight}")]
    StakeWeightMismatch { total: u64, weight: u64 },
    #[error("staking period is empty or inverted")]
    InvalidStakingPeriod,
    #[error("asset name or symbol malformed")]
    BadAssetName,
    #[error("created asset has no initial state")]
    EmptyInitialState,
    #[error("cross-chain transfer references this chain itself")]
    SelfChainTransfer,
    #[error("missing utxo {0}")]
    MissingUtxo(Id),
    #[error("input asset does not match utxo asset")]
    AssetIdMismatch,
    #[error("input amount {input} does not match output amount {output}")]
    AmountMismatch { input: u64, output: u64 },
    #[error("incompatible fx: output {output}, input {input}, credential {credential}")]
    IncompatibleFx {
        output: FxId,
        input: FxId,
        credential: FxId,
    },
    #[error("no fx registered for {0}")]
    UnknownFx(FxId),
    #[error("invalid credential: {0}")]
    InvalidCredential(&'static str),
    #[error("output owner is timelocked until {locktime}, now {now}")]
    OwnerLocked { locktime: u64, now: u64 },
    #[error("stake-locked output (locktime {locktime}) consumed by non-matching input")]
    StakeLockViolated { locktime: u64 },
    #[error("amount overflow")]
    Overflow,
    #[error("amount underflow")]
    Underflow,
    #[error("flow imbalance for asset {0}")]
    FlowImbalance(Id),
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
    #[error("utxo store I/O: {0}")]
    Io(String),
}

impl TxError {
    /// Disposition per the error-handling design: only I/O and
    /// might-still-arrive preconditions are retryable.
    pub fn disposition(&self) -> Disposition {
        match self {
            TxError::MissingUtxo(_) | TxError::Io(_) => Disposition::Temporary,
            _ => Disposition::Permanent,
        }
    }
}

impl From<crate::utxo::UtxoError> for TxError {
    fn from(err: crate::utxo::UtxoError) -> Self {
        match err {
            crate::utxo::UtxoError::Io(msg) => TxError::Io(msg),
            crate::utxo::UtxoError::Codec(e) => TxError::Codec(e),
        }
    }
}

/// Chain-level parameters the verifier checks against.
#[derive(Clone, Debug)]
pub struct VerifyCtx {
    pub network_id: u32,
    pub chain_id: Id,
    /// The asset fees are denominated in.
    pub fee_asset: Id,
    pub tx_fee: u64,
    pub min_stake: u64,
    /// Current chain time, unix seconds.
    pub current_time: u64,
}

/// Read-only view of the UTXO set that semantic verification runs against.
pub trait UtxoView {
    fn utxo(&self, input_id: &Id) -> Result<Option<Utxo>, TxError>;
}

impl UtxoView for crate::utxo::UtxoDb {
    fn utxo(&self, input_id: &Id) -> Result<Option<Utxo>, TxError> {
        Ok(crate::utxo::UtxoDb::utxo(self, input_id)?)
    }
}

/// Everything accepting a verified transaction must apply atomically.
#[derive(Clone, Debug, Default)]
pub struct TxEffects {
    /// Local UTXO production and consumption.
    pub delta: UtxoDelta,
    /// Shared-memory element keys consumed from `source_chain`.
    pub imported: Vec<Id>,
    pub source_chain: Option<Id>,
    /// UTXOs to materialize in `dest_chain`'s shared memory.
    pub exported: Vec<Utxo>,
    pub dest_chain: Option<Id>,
}

fn verify_output(out: &Output, nested: bool) -> Result<(), TxError> {
    match out {
        Output::Transfer(o) => {
            if o.amount == 0 {
                return Err(TxError::ZeroAmount);
            }
            o.owners.verify()
        }
        Output::Nft(o) => o.owners.verify(),
        Output::Property(o) => o.owners.verify(),
        Output::StakeableLock(s) => {
            if nested {
                return Err(TxError::NestedStakeLock);
            }
            if s.locktime == 0 {
                return Err(TxError::ZeroLocktime);
            }
            verify_output(&s.out, true)
        }
    }
}

fn verify_input(input: &crate::tx::Input, nested: bool) -> Result<(), TxError> {
    match input {
        crate::tx::Input::Transfer(i) => {
            if i.amount == 0 {
                return Err(TxError::ZeroAmount);
            }
            if !i.sig_indices.windows(2).all(|w| w[0] < w[1]) {
                return Err(TxError::SigIndicesNotSortedUnique);
            }
            Ok(())
        }
        crate::tx::Input::StakeableLock(s) => {
            if nested {
                return Err(TxError::NestedStakeLock);
            }
            if s.locktime == 0 {
                return Err(TxError::ZeroLocktime);
            }
            verify_input(&s.input, true)
        }
    }
}

fn inputs_sorted_and_unique(ins: &[TransferableInput]) -> bool {
    let keys: Vec<(Id, Id)> = ins
        .iter()
        .map(|i| (i.asset_id, i.utxo_id.input_id()))
        .collect();
    keys.windows(2).all(|w| w[0] < w[1])
}

fn outputs_sorted(codec: &TxCodec, outs: &[TransferableOutput]) -> Result<bool, TxError> {
    let mut keys = Vec::with_capacity(outs.len());
    for out in outs {
        keys.push((out.asset_id, codec.encode_output(&out.out)?));
    }
    Ok(keys.windows(2).all(|w| w[0] <= w[1]))
}

fn verify_base(codec: &TxCodec, base: &crate::tx::BaseTx, ctx: &VerifyCtx) -> Result<(), TxError> {
    if base.network_id != ctx.network_id {
        return Err(TxError::WrongNetwork {
            tx: base.network_id,
            chain: ctx.network_id,
        });
    }
    if base.chain_id != ctx.chain_id {
        return Err(TxError::WrongChain);
    }
    if base.memo.len() > MAX_MEMO_BYTES {
        return Err(TxError::MemoTooLarge(base.memo.len()));
    }
    for out in &base.outs {
        verify_output(&out.out, false)?;
    }
    if !outputs_sorted(codec, &base.outs)? {
        return Err(TxError::OutputsNotSorted);
    }
    for input in &base.ins {
        verify_input(&input.input, false)?;
    }
    if !inputs_sorted_and_unique(&base.ins) {
        return Err(TxError::InputsNotSorted);
    }
    Ok(())
}

fn verify_stake(
    stake: &[TransferableOutput],
    weight: u64,
    min_stake: u64,
) -> Result<(), TxError> {
    let mut total: u64 = 0;
    for out in stake {
        verify_output(&out.out, false)?;
        total = total.checked_add(out.out.amount()).ok_or(TxError::Overflow)?;
    }
    if total != weight {
        return Err(TxError::StakeWeightMismatch { total, weight });
    }
    if weight < min_stake {
        return Err(TxError::StakeWeightMismatch {
            total,
            weight: min_stake,
        });
    }
    Ok(())
}

/// Syntactic verification: pure structural checks. Idempotent; the result
/// is cached on the transaction.
pub fn syntactic_verify(codec: &TxCodec, tx: &Tx, ctx: &VerifyCtx) -> Result<(), TxError> {
    if tx.syntactic_verified() {
        return Ok(());
    }

    let expected = tx.unsigned.num_credentials();
    if expected != tx.creds.len() {
        return Err(TxError::WrongCredentialCount {
            expected,
            got: tx.creds.len(),
        });
    }

    if let Some(base) = tx.unsigned.base() {
        verify_base(codec, base, ctx)?;
    }

    match &tx.unsigned {
        UnsignedTx::CreateAsset(t) => {
            if t.name.is_empty() || t.symbol.is_empty() || t.symbol.len() > 4 {
                return Err(TxError::BadAssetName);
            }
            if t.states.is_empty() {
                return Err(TxError::EmptyInitialState);
            }
            for state in &t.states {
                if let crate::tx::InitialState::VariableCap(owners) = state {
                    for owner in owners {
                        owner.verify()?;
                    }
                }
            }
        }
        UnsignedTx::Operation(t) => {
            for op in &t.ops {
                for out in &op.outputs {
                    verify_output(out, false)?;
                }
            }
        }
        UnsignedTx::Import(t) => {
            if t.source_chain == ctx.chain_id {
                return Err(TxError::SelfChainTransfer);
            }
            for input in &t.imported_ins {
                verify_input(&input.input, false)?;
            }
            if !inputs_sorted_and_unique(&t.imported_ins) {
                return Err(TxError::InputsNotSorted);
            }
        }
        UnsignedTx::Export(t) => {
            if t.dest_chain == ctx.chain_id {
                return Err(TxError::SelfChainTransfer);
            }
            for out in &t.exported_outs {
                verify_output(&out.out, false)?;
            }
        }
        UnsignedTx::AddValidator(t) => {
            if t.staker.end_time <= t.staker.start_time {
                return Err(TxError::InvalidStakingPeriod);
            }
            t.reward_owner.verify()?;
            verify_stake(&t.stake, t.staker.weight, ctx.min_stake)?;
        }
        UnsignedTx::AddDelegator(t) => {
            if t.staker.end_time <= t.staker.start_time {
                return Err(TxError::InvalidStakingPeriod);
            }
            t.reward_owner.verify()?;
            verify_stake(&t.stake, t.staker.weight, 1)?;
        }
        UnsignedTx::AddSubnetValidator(t) => {
            if t.staker.end_time <= t.staker.start_time {
                return Err(TxError::InvalidStakingPeriod);
            }
            if !t.subnet_auth.sig_indices.windows(2).all(|w| w[0] < w[1]) {
                return Err(TxError::SigIndicesNotSortedUnique);
            }
        }
        UnsignedTx::CreateChain(t) => {
            if t.chain_name.is_empty() {
                return Err(TxError::BadAssetName);
            }
            if !t.subnet_auth.sig_indices.windows(2).all(|w| w[0] < w[1]) {
                return Err(TxError::SigIndicesNotSortedUnique);
            }
        }
        UnsignedTx::CreateSubnet(t) => t.owner.verify()?,
        UnsignedTx::Base(_) | UnsignedTx::Advance(_) | UnsignedTx::Reward(_) => {}
    }

    tx.mark_syntactic_verified();
    Ok(())
}

/// Per-asset flow pools, partitioned by stake-lock class (0 = unlocked).
#[derive(Debug, Default)]
struct Pools {
    consumed: BTreeMap<u64, u64>,
    produced: BTreeMap<u64, u64>,
}

fn add_to(map: &mut BTreeMap<u64, u64>, class: u64, amount: u64) -> Result<(), TxError> {
    let slot = map.entry(class).or_insert(0);
    *slot = slot.checked_add(amount).ok_or(TxError::Overflow)?;
    Ok(())
}

/// The flow check: per asset, and within each asset per locktime class,
/// consumed funds must cover produced funds plus the fee. Stake-locked
/// deficits may only be covered by unlocked funds (stake can be created,
/// never unlocked early), and locked surplus never flows down to unlocked
/// outputs or fees.
fn check_flow(
    consumed: &[(Id, u64, u64)], // (asset, class, amount)
    produced: &[(Id, u64, u64)],
    fee_asset: Id,
    fee: u64,
) -> Result<(), TxError> {
    let mut pools: HashMap<Id, Pools> = HashMap::new();
    for &(asset, class, amount) in consumed {
        add_to(&mut pools.entry(asset).or_default().consumed, class, amount)?;
    }
    for &(asset, class, amount) in produced {
        add_to(&mut pools.entry(asset).or_default().produced, class, amount)?;
    }
    add_to(
        &mut pools.entry(fee_asset).or_default().produced,
        0,
        fee,
    )?;

    for (asset, pool) in &pools {
        let mut unlocked = pool.consumed.get(&0).copied().unwrap_or(0);
        for (&class, &prod) in pool.produced.iter().rev() {
            if class == 0 {
                continue;
            }
            let cons = pool.consumed.get(&class).copied().unwrap_or(0);
            if prod > cons {
                let deficit = prod - cons;
                unlocked = unlocked.checked_sub(deficit).ok_or(TxError::Underflow)?;
            }
        }
        let unlocked_produced = pool.produced.get(&0).copied().unwrap_or(0);
        if unlocked < unlocked_produced {
            return Err(TxError::FlowImbalance(*asset));
        }
    }
    Ok(())
}

/// The stake-lock class an output falls into at `now`: its locktime while
/// locked, 0 once expired or never locked.
fn lock_class(out: &Output, now: u64) -> u64 {
    match out.stake_locktime() {
        Some(locktime) if locktime > now => locktime,
        _ => 0,
    }
}

/// Semantic verification: resolve inputs against the views, verify
/// credentials and lock gating, and run the flow check. Pure with respect to
/// the views; returns the effects for the caller to commit.
pub fn semantic_verify(
    codec: &TxCodec,
    fxs: &FxRegistry,
    tx: &Tx,
    view: &dyn UtxoView,
    shared_view: Option<&dyn UtxoView>,
    ctx: &VerifyCtx,
) -> Result<TxEffects, TxError> {
    syntactic_verify(codec, tx, ctx)?;

    let digest = crate::hash256(tx.unsigned_bytes());
    let now = ctx.current_time;
    let mut effects = TxEffects::default();
    let mut consumed_flow: Vec<(Id, u64, u64)> = Vec::new();
    let mut produced_flow: Vec<(Id, u64, u64)> = Vec::new();

    let base_ins: &[TransferableInput] = tx
        .unsigned
        .base()
        .map(|b| b.ins.as_slice())
        .unwrap_or(&[]);

    // Base inputs resolve locally; imported inputs resolve from the source
    // chain's exports to us.
    let mut resolved: Vec<(&TransferableInput, Utxo, bool)> = Vec::new();
    for input in base_ins {
        let input_id = input.utxo_id.input_id();
        let utxo = view
            .utxo(&input_id)?
            .ok_or(TxError::MissingUtxo(input_id))?;
        resolved.push((input, utxo, false));
    }
    if let UnsignedTx::Import(t) = &tx.unsigned {
        let shared = shared_view.ok_or_else(|| TxError::Io("no shared memory view".into()))?;
        for input in &t.imported_ins {
            let input_id = input.utxo_id.input_id();
            let utxo = shared
                .utxo(&input_id)?
                .ok_or(TxError::MissingUtxo(input_id))?;
            resolved.push((input, utxo, true));
        }
        effects.source_chain = Some(t.source_chain);
    }

    for (i, (input, utxo, imported)) in resolved.iter().enumerate() {
        if input.asset_id != utxo.asset_id {
            return Err(TxError::AssetIdMismatch);
        }

        // Stake-lock gating: a locked output may only be consumed by a lock
        // input carrying the identical locktime until the lock expires.
        let out_lock = utxo.out.stake_locktime();
        let in_lock = input.input.stake_locktime();
        match (out_lock, in_lock) {
            (Some(locktime), _) if locktime > now && in_lock != Some(locktime) => {
                return Err(TxError::StakeLockViolated { locktime });
            }
            (Some(locktime), Some(input_locktime))
                if locktime <= now && input_locktime != locktime =>
            {
                return Err(TxError::StakeLockViolated { locktime });
            }
            (None, Some(locktime)) => {
                return Err(TxError::StakeLockViolated { locktime });
            }
            _ => {}
        }

        let cred = tx
            .creds
            .get(i)
            .ok_or(TxError::InvalidCredential("missing credential"))?;
        fxs.verify_spend(&digest, &input.input, cred, &utxo.out, now)?;

        consumed_flow.push((
            utxo.asset_id,
            lock_class(&utxo.out, now),
            input.input.amount(),
        ));
        if *imported {
            effects.imported.push(utxo.input_id());
        } else {
            effects.delta.consumed.push(utxo.input_id());
        }
    }

    // Asset operations: consume owned non-fungible outputs, produce
    // same-family outputs. One credential per operation, after the inputs'.
    if let UnsignedTx::Operation(t) = &tx.unsigned {
        let mut seen: HashSet<Id> = HashSet::new();
        for (op_index, op) in t.ops.iter().enumerate() {
            let cred = tx
                .creds
                .get(base_ins.len() + op_index)
                .ok_or(TxError::InvalidCredential("missing operation credential"))?;
            for utxo_id in &op.utxo_ids {
                let input_id = utxo_id.input_id();
                if !seen.insert(input_id) {
                    return Err(TxError::InputsNotSorted);
                }
                let utxo = view
                    .utxo(&input_id)?
                    .ok_or(TxError::MissingUtxo(input_id))?;
                if utxo.asset_id != op.asset_id {
                    return Err(TxError::AssetIdMismatch);
                }
                for out in &op.outputs {
                    if out.fx_id() != utxo.out.fx_id() {
                        return Err(TxError::IncompatibleFx {
                            output: utxo.out.fx_id(),
                            input: out.fx_id(),
                            credential: cred.fx_id(),
                        });
                    }
                }
                fxs.verify_operation(&digest, cred, &utxo.out, now)?;
                effects.delta.consumed.push(input_id);
            }
        }
    }

    // Produced outputs, indexed in order: base outs, then the variant's
    // extra outputs (stake, exports).
    let mut output_index: u32 = 0;
    let mut produce = |effects: &mut TxEffects,
                       produced_flow: &mut Vec<(Id, u64, u64)>,
                       out: &TransferableOutput,
                       exported: bool| {
        let utxo = Utxo {
            utxo_id: UtxoId {
                tx_id: tx.id(),
                output_index,
            },
            asset_id: out.asset_id,
            out: out.out.clone(),
        };
        output_index += 1;
        produced_flow.push((out.asset_id, lock_class(&out.out, now), out.out.amount()));
        if exported {
            effects.exported.push(utxo);
        } else {
            effects.delta.produced.push(utxo);
        }
    };

    if let Some(base) = tx.unsigned.base() {
        for out in &base.outs {
            produce(&mut effects, &mut produced_flow, out, false);
        }
    }
    match &tx.unsigned {
        UnsignedTx::AddValidator(t) => {
            for out in &t.stake {
                produce(&mut effects, &mut produced_flow, out, false);
            }
        }
        UnsignedTx::AddDelegator(t) => {
            for out in &t.stake {
                produce(&mut effects, &mut produced_flow, out, false);
            }
        }
        UnsignedTx::Export(t) => {
            effects.dest_chain = Some(t.dest_chain);
            for out in &t.exported_outs {
                produce(&mut effects, &mut produced_flow, out, true);
            }
        }
        UnsignedTx::Operation(t) => {
            for op in &t.ops {
                for out in &op.outputs {
                    produce(
                        &mut effects,
                        &mut produced_flow,
                        &TransferableOutput {
                            asset_id: op.asset_id,
                            out: out.clone(),
                        },
                        false,
                    );
                }
            }
        }
        _ => {}
    }

    // The bare state transitions move no value and pay no fee.
    let fee = match &tx.unsigned {
        UnsignedTx::Advance(_) | UnsignedTx::Reward(_) => 0,
        UnsignedTx::CreateAsset(_) => {
            // Asset creation mints the asset's genesis UTXOs out of its
            // initial state rather than the flow; creation still pays the fee.
            ctx.tx_fee
        }
        _ => ctx.tx_fee,
    };
    check_flow(&consumed_flow, &produced_flow, ctx.fee_asset, fee)?;

    // CreateAsset materializes fixed-cap allocations as UTXOs of the new
    // asset (identified by this tx's ID).
    if let UnsignedTx::CreateAsset(t) = &tx.unsigned {
        for state in &t.states {
            if let crate::tx::InitialState::FixedCap(holders) = state {
                for holder in holders {
                    effects.delta.produced.push(Utxo {
                        utxo_id: UtxoId {
                            tx_id: tx.id(),
                            output_index,
                        },
                        asset_id: tx.id(),
                        out: Output::Transfer(crate::tx::TransferOutput {
                            amount: holder.amount,
                            owners: crate::tx::OutputOwners {
                                locktime: 0,
                                threshold: 1,
                                addrs: vec![holder.address],
                            },
                        }),
                    });
                    output_index += 1;
                }
            }
        }
    }

    Ok(effects)
}
