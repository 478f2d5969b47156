//! Transaction model: polymorphic unsigned transactions, transferable
//! inputs/outputs, credentials, and the registry codec binding them to the
//! wire.
//!
//! A transaction consumes UTXOs named by its inputs and produces the UTXOs
//! described by its outputs. Authority to consume is proven by one credential
//! per input, in input order. The unsigned variants cover value transfer,
//! asset creation and operations, cross-chain import/export, and the staking
//! family.

pub mod fx;
pub mod verify;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::{CodecError, Reader, Registry, Writer};
use crate::hash256;
use crate::ids::{Id, ShortId};
use crate::utxo::UtxoId;

pub use fx::FxId;

/// Owner specification shared by every output family: consumable after
/// `locktime` by `threshold` of `addrs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputOwners {
    pub locktime: u64,
    pub threshold: u32,
    /// Sorted, unique.
    pub addrs: Vec<ShortId>,
}

impl OutputOwners {
    pub fn verify(&self) -> Result<(), verify::TxError> {
        if self.threshold as usize > self.addrs.len() {
            return Err(verify::TxError::InvalidThreshold);
        }
        if self.threshold == 0 && !self.addrs.is_empty() {
            return Err(verify::TxError::InvalidThreshold);
        }
        if !self.addrs.windows(2).all(|w| w[0] < w[1]) {
            return Err(verify::TxError::AddrsNotSortedUnique);
        }
        Ok(())
    }

    fn write(&self, w: &mut Writer) {
        w.write_u64(self.locktime);
        w.write_u32(self.threshold);
        w.write_len(self.addrs.len());
        for addr in &self.addrs {
            w.write_short_id(addr);
        }
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let locktime = r.read_u64()?;
        let threshold = r.read_u32()?;
        let n = r.read_len()?;
        let mut addrs = Vec::with_capacity(n);
        for _ in 0..n {
            addrs.push(r.read_short_id()?);
        }
        Ok(OutputOwners {
            locktime,
            threshold,
            addrs,
        })
    }
}

/// Fungible output: `amount` owned by `owners`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferOutput {
    pub amount: u64,
    pub owners: OutputOwners,
}

/// Non-fungible output carrying a group ID and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NftTransferOutput {
    pub group_id: u32,
    pub payload: Vec<u8>,
    pub owners: OutputOwners,
}

/// Property output: an owned, non-fungible payload without groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyOutput {
    pub payload: Vec<u8>,
    pub owners: OutputOwners,
}

/// Wraps a transferable output so it can only be consumed as stake before
/// `locktime`. Nesting a lock inside a lock is invalid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StakeableLockOut {
    pub locktime: u64,
    pub out: Box<Output>,
}

/// Output families, dispatched on the wire by registered type ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    Transfer(TransferOutput),
    Nft(NftTransferOutput),
    Property(PropertyOutput),
    StakeableLock(StakeableLockOut),
}

impl Output {
    pub fn type_name(&self) -> &'static str {
        match self {
            Output::Transfer(_) => "secp256k1.transfer_output",
            Output::Nft(_) => "nft.transfer_output",
            Output::Property(_) => "property.output",
            Output::StakeableLock(_) => "stakeable.lock_output",
        }
    }

    /// The feature extension this output belongs to; lock wrappers defer to
    /// the wrapped output.
    pub fn fx_id(&self) -> FxId {
        match self {
            Output::Transfer(_) => FxId::Secp256k1,
            Output::Nft(_) => FxId::Nft,
            Output::Property(_) => FxId::Property,
            Output::StakeableLock(s) => s.out.fx_id(),
        }
    }

    /// Fungible amount carried; non-fungible families carry none.
    pub fn amount(&self) -> u64 {
        match self {
            Output::Transfer(o) => o.amount,
            Output::Nft(_) | Output::Property(_) => 0,
            Output::StakeableLock(s) => s.out.amount(),
        }
    }

    pub fn owners(&self) -> &OutputOwners {
        match self {
            Output::Transfer(o) => &o.owners,
            Output::Nft(o) => &o.owners,
            Output::Property(o) => &o.owners,
            Output::StakeableLock(s) => s.out.owners(),
        }
    }

    /// Stake-lock expiry, if this output is lock-wrapped.
    pub fn stake_locktime(&self) -> Option<u64> {
        match self {
            Output::StakeableLock(s) => Some(s.locktime),
            _ => None,
        }
    }

    pub fn is_stakeable_lock(&self) -> bool {
        matches!(self, Output::StakeableLock(_))
    }
}

/// Fungible input consuming `amount` with signatures at `sig_indices` into
/// the referenced output's address list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferInput {
    pub amount: u64,
    /// Sorted, unique indices into the consumed output's `addrs`.
    pub sig_indices: Vec<u32>,
}

/// Consumes a stake-locked output of identical locktime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StakeableLockIn {
    pub locktime: u64,
    pub input: Box<Input>,
}

/// Input families.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Transfer(TransferInput),
    StakeableLock(StakeableLockIn),
}

impl Input {
    pub fn type_name(&self) -> &'static str {
        match self {
            Input::Transfer(_) => "secp256k1.transfer_input",
            Input::StakeableLock(_) => "stakeable.lock_input",
        }
    }

    pub fn fx_id(&self) -> FxId {
        match self {
            Input::Transfer(_) => FxId::Secp256k1,
            Input::StakeableLock(s) => s.input.fx_id(),
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            Input::Transfer(i) => i.amount,
            Input::StakeableLock(s) => s.input.amount(),
        }
    }

    pub fn sig_indices(&self) -> &[u32] {
        match self {
            Input::Transfer(i) => &i.sig_indices,
            Input::StakeableLock(s) => s.input.sig_indices(),
        }
    }

    pub fn stake_locktime(&self) -> Option<u64> {
        match self {
            Input::StakeableLock(s) => Some(s.locktime),
            _ => None,
        }
    }
}

/// A 65-byte recoverable ECDSA signature.
pub type RecoverableSig = [u8; 65];

/// Ordered signatures matching an input's `sig_indices`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecpCredential {
    pub sigs: Vec<RecoverableSig>,
}

/// Credential families. The NFT and property families reuse recoverable
/// signatures over the same digest; they differ in which outputs they may
/// unlock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    Secp256k1(SecpCredential),
    Nft(SecpCredential),
    Property(SecpCredential),
}

impl Credential {
    pub fn type_name(&self) -> &'static str {
        match self {
            Credential::Secp256k1(_) => "secp256k1.credential",
            Credential::Nft(_) => "nft.credential",
            Credential::Property(_) => "property.credential",
        }
    }

    pub fn fx_id(&self) -> FxId {
        match self {
            Credential::Secp256k1(_) => FxId::Secp256k1,
            Credential::Nft(_) => FxId::Nft,
            Credential::Property(_) => FxId::Property,
        }
    }

    pub fn sigs(&self) -> &[RecoverableSig] {
        match self {
            Credential::Secp256k1(c) | Credential::Nft(c) | Credential::Property(c) => &c.sigs,
        }
    }
}

/// An output bound to the asset it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferableOutput {
    pub asset_id: Id,
    pub out: Output,
}

/// An input bound to the UTXO it consumes and that UTXO's asset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferableInput {
    pub utxo_id: UtxoId,
    pub asset_id: Id,
    pub input: Input,
}

/// Fields shared by every value-moving transaction.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BaseTx {
    pub network_id: u32,
    pub chain_id: Id,
    /// Sorted by `(asset_id, encoded output)`.
    pub outs: Vec<TransferableOutput>,
    /// Sorted by `(asset_id, input_id)`, unique.
    pub ins: Vec<TransferableInput>,
    pub memo: Vec<u8>,
}

/// Genesis allocation for a fixed-cap asset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Holder {
    pub amount: u64,
    pub address: ShortId,
}

/// Initial state of a created asset: either a fixed allocation or a set of
/// minting authorities. Unknown tags are rejected at parse time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InitialState {
    FixedCap(Vec<Holder>),
    VariableCap(Vec<OutputOwners>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateAssetTx {
    pub base: BaseTx,
    pub name: String,
    pub symbol: String,
    pub denomination: u8,
    pub states: Vec<InitialState>,
}

/// One asset operation: consume `utxo_ids` of `asset_id`, produce `outputs`
/// of the same feature extension. Carries its own credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub asset_id: Id,
    pub utxo_ids: Vec<UtxoId>,
    pub outputs: Vec<Output>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationTx {
    pub base: BaseTx,
    pub ops: Vec<Operation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportTx {
    pub base: BaseTx,
    pub source_chain: Id,
    /// Consume elements previously exported to this chain.
    pub imported_ins: Vec<TransferableInput>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportTx {
    pub base: BaseTx,
    pub dest_chain: Id,
    /// Materialize in the destination chain's shared memory.
    pub exported_outs: Vec<TransferableOutput>,
}

/// Staking registration window and weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Staker {
    pub node_id: ShortId,
    pub start_time: u64,
    pub end_time: u64,
    pub weight: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddValidatorTx {
    pub base: BaseTx,
    pub staker: Staker,
    /// Stake-locked outputs whose amounts must sum to `staker.weight`.
    pub stake: Vec<TransferableOutput>,
    pub reward_owner: OutputOwners,
    /// Delegation fee in hundredths of a percent.
    pub delegation_shares: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddDelegatorTx {
    pub base: BaseTx,
    pub staker: Staker,
    pub stake: Vec<TransferableOutput>,
    pub reward_owner: OutputOwners,
}

/// Authorization over a subnet's control keys.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SubnetAuth {
    pub sig_indices: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddSubnetValidatorTx {
    pub base: BaseTx,
    pub staker: Staker,
    pub subnet_id: Id,
    pub subnet_auth: SubnetAuth,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateChainTx {
    pub base: BaseTx,
    pub subnet_id: Id,
    pub chain_name: String,
    pub vm_id: Id,
    pub fx_ids: Vec<Id>,
    pub genesis_data: Vec<u8>,
    pub subnet_auth: SubnetAuth,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateSubnetTx {
    pub base: BaseTx,
    pub owner: OutputOwners,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvanceTimeTx {
    pub time: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RewardValidatorTx {
    pub tx_id: Id,
}

/// The unsigned transaction variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnsignedTx {
    Base(BaseTx),
    CreateAsset(CreateAssetTx),
    Operation(OperationTx),
    Import(ImportTx),
    Export(ExportTx),
    AddValidator(AddValidatorTx),
    AddDelegator(AddDelegatorTx),
    AddSubnetValidator(AddSubnetValidatorTx),
    CreateChain(CreateChainTx),
    CreateSubnet(CreateSubnetTx),
    Advance(AdvanceTimeTx),
    Reward(RewardValidatorTx),
}

impl UnsignedTx {
    pub fn type_name(&self) -> &'static str {
        match self {
            UnsignedTx::Base(_) => "tx.base",
            UnsignedTx::CreateAsset(_) => "tx.create_asset",
            UnsignedTx::Operation(_) => "tx.operation",
            UnsignedTx::Import(_) => "tx.import",
            UnsignedTx::Export(_) => "tx.export",
            UnsignedTx::AddValidator(_) => "tx.add_validator",
            UnsignedTx::AddDelegator(_) => "tx.add_delegator",
            UnsignedTx::AddSubnetValidator(_) => "tx.add_subnet_validator",
            UnsignedTx::CreateChain(_) => "tx.create_chain",
            UnsignedTx::CreateSubnet(_) => "tx.create_subnet",
            UnsignedTx::Advance(_) => "tx.advance_time",
            UnsignedTx::Reward(_) => "tx.reward_validator",
        }
    }

    /// The shared base fields, absent only on the two bare state
    /// transitions (Advance, Reward).
    pub fn base(&self) -> Option<&BaseTx> {
        match self {
            UnsignedTx::Base(b) => Some(b),
            UnsignedTx::CreateAsset(t) => Some(&t.base),
            UnsignedTx::Operation(t) => Some(&t.base),
            UnsignedTx::Import(t) => Some(&t.base),
            UnsignedTx::Export(t) => Some(&t.base),
            UnsignedTx::AddValidator(t) => Some(&t.base),
            UnsignedTx::AddDelegator(t) => Some(&t.base),
            UnsignedTx::AddSubnetValidator(t) => Some(&t.base),
            UnsignedTx::CreateChain(t) => Some(&t.base),
            UnsignedTx::CreateSubnet(t) => Some(&t.base),
            UnsignedTx::Advance(_) | UnsignedTx::Reward(_) => None,
        }
    }

    /// Number of credentials this transaction must carry: one per base
    /// input, one per imported input, one per operation, and one for a
    /// subnet authorization where present.
    pub fn num_credentials(&self) -> usize {
        let base_ins = self.base().map(|b| b.ins.len()).unwrap_or(0);
        match self {
            UnsignedTx::Operation(t) => base_ins + t.ops.len(),
            UnsignedTx::Import(t) => base_ins + t.imported_ins.len(),
            UnsignedTx::AddSubnetValidator(_) | UnsignedTx::CreateChain(_) => base_ins + 1,
            _ => base_ins,
        }
    }

    /// IDs of same-chain transactions this one depends on: the producers of
    /// every consumed UTXO, plus the rewarded transaction. Imported inputs
    /// reference other chains and are resolved through shared memory, not
    /// the local DAG.
    pub fn dependencies(&self) -> BTreeSet<Id> {
        let mut deps = BTreeSet::new();
        if let Some(base) = self.base() {
            for input in &base.ins {
                deps.insert(input.utxo_id.tx_id);
            }
        }
        match self {
            UnsignedTx::Operation(t) => {
                for op in &t.ops {
                    for utxo_id in &op.utxo_ids {
                        deps.insert(utxo_id.tx_id);
                    }
                }
            }
            UnsignedTx::Reward(t) => {
                deps.insert(t.tx_id);
            }
            _ => {}
        }
        deps
    }
}

/// A signed transaction: the unsigned body plus its credentials, with the
/// canonical bytes and content-addressed ID cached at construction.
#[derive(Debug)]
pub struct Tx {
    pub unsigned: UnsignedTx,
    pub creds: Vec<Credential>,
    id: Id,
    bytes: Vec<u8>,
    unsigned_bytes: Vec<u8>,
    syntactic_ok: AtomicBool,
}

impl Tx {
    pub fn id(&self) -> Id {
        self.id
    }

    /// Canonical encoding; `id == hash256(bytes)`.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The signed-over prefix (version, type ID, unsigned body).
    pub fn unsigned_bytes(&self) -> &[u8] {
        &self.unsigned_bytes
    }

    pub(crate) fn syntactic_verified(&self) -> bool {
        self.syntactic_ok.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_syntactic_verified(&self) {
        self.syntactic_ok.store(true, Ordering::Relaxed);
    }
}

impl Clone for Tx {
    fn clone(&self) -> Self {
        Tx {
            unsigned: self.unsigned.clone(),
            creds: self.creds.clone(),
            id: self.id,
            bytes: self.bytes.clone(),
            unsigned_bytes: self.unsigned_bytes.clone(),
            syntactic_ok: AtomicBool::new(self.syntactic_ok.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for Tx {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Tx {}

/// The configured registry codec for transactions and their polymorphic
/// fields. Construct once at chain initialization and share; registration
/// order defines the wire type IDs.
pub struct TxCodec {
    outputs: Registry<Output, TxCodec>,
    inputs: Registry<Input, TxCodec>,
    creds: Registry<Credential, TxCodec>,
    txs: Registry<UnsignedTx, TxCodec>,
}

impl Default for TxCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TxCodec {
    pub fn new() -> Self {
        let mut outputs = Registry::new();
        outputs.register("secp256k1.transfer_output", decode_transfer_output);
        outputs.register("nft.transfer_output", decode_nft_output);
        outputs.register("property.output", decode_property_output);
        outputs.register("stakeable.lock_output", decode_stakeable_lock_out);

        let mut inputs = Registry::new();
        inputs.register("secp256k1.transfer_input", decode_transfer_input);
        inputs.register("stakeable.lock_input", decode_stakeable_lock_in);

        let mut creds = Registry::new();
        creds.register("secp256k1.credential", decode_secp_cred);
        creds.register("nft.credential", decode_nft_cred);
        creds.register("property.credential", decode_property_cred);

        let mut txs = Registry::new();
        txs.register("tx.base", decode_base_tx);
        txs.register("tx.create_asset", decode_create_asset_tx);
        txs.register("tx.operation", decode_operation_tx);
        txs.register("tx.import", decode_import_tx);
        txs.register("tx.export", decode_export_tx);
        txs.register("tx.add_validator", decode_add_validator_tx);
        txs.register("tx.add_delegator", decode_add_delegator_tx);
        txs.register("tx.add_subnet_validator", decode_add_subnet_validator_tx);
        txs.register("tx.create_chain", decode_create_chain_tx);
        txs.register("tx.create_subnet", decode_create_subnet_tx);
        txs.register("tx.advance_time", decode_advance_time_tx);
        txs.register("tx.reward_validator", decode_reward_validator_tx);

        TxCodec {
            outputs,
            inputs,
            creds,
            txs,
        }
    }

    /// Build a signed transaction, computing its canonical bytes and ID.
    pub fn build_tx(&self, unsigned: UnsignedTx, creds: Vec<Credential>) -> Result<Tx, CodecError> {
        let mut w = Writer::new();
        self.txs.write_tag(&mut w, unsigned.type_name())?;
        self.write_unsigned_body(&mut w, &unsigned)?;
        let unsigned_len = w.len();

        w.write_len(creds.len());
        for cred in &creds {
            self.write_credential(&mut w, cred)?;
        }

        let bytes = w.into_bytes();
        let unsigned_bytes = bytes[..unsigned_len].to_vec();
        let id = Id(hash256(&bytes));
        Ok(Tx {
            unsigned,
            creds,
            id,
            bytes,
            unsigned_bytes,
            syntactic_ok: AtomicBool::new(false),
        })
    }

    /// Parse a transaction from its canonical bytes. The whole slice must be
    /// consumed.
    pub fn parse_tx(&self, bytes: &[u8]) -> Result<Tx, CodecError> {
        let mut r = Reader::new(bytes)?;
        let unsigned = self.txs.decode(&mut r, self)?;
        let unsigned_len = bytes.len() - r.remaining();

        let n = r.read_len()?;
        let mut creds = Vec::with_capacity(n);
        for _ in 0..n {
            creds.push(self.creds.decode(&mut r, self)?);
        }
        r.done()?;

        Ok(Tx {
            unsigned,
            creds,
            id: Id(hash256(bytes)),
            bytes: bytes.to_vec(),
            unsigned_bytes: bytes[..unsigned_len].to_vec(),
            syntactic_ok: AtomicBool::new(false),
        })
    }

    /// Encode a lone output (used by the UTXO store's value format).
    pub fn encode_output(&self, out: &Output) -> Result<Vec<u8>, CodecError> {
        let mut w = Writer::bare();
        self.write_output(&mut w, out)?;
        Ok(w.into_bytes())
    }

    pub fn decode_output(&self, r: &mut Reader<'_>) -> Result<Output, CodecError> {
        self.outputs.decode(r, self)
    }

    pub fn write_output(&self, w: &mut Writer, out: &Output) -> Result<(), CodecError> {
        self.outputs.write_tag(w, out.type_name())?;
        match out {
            Output::Transfer(o) => {
                w.write_u64(o.amount);
                o.owners.write(w);
            }
            Output::Nft(o) => {
                w.write_u32(o.group_id);
                w.write_bytes(&o.payload);
                o.owners.write(w);
            }
            Output::Property(o) => {
                w.write_bytes(&o.payload);
                o.owners.write(w);
            }
            Output::StakeableLock(s) => {
                w.write_u64(s.locktime);
                self.write_output(w, &s.out)?;
            }
        }
        Ok(())
    }

    fn write_input(&self, w: &mut Writer, input: &Input) -> Result<(), CodecError> {
        self.inputs.write_tag(w, input.type_name())?;
        match input {
            Input::Transfer(i) => {
                w.write_u64(i.amount);
                w.write_len(i.sig_indices.len());
                for idx in &i.sig_indices {
                    w.write_u32(*idx);
                }
            }
            Input::StakeableLock(s) => {
                w.write_u64(s.locktime);
                self.write_input(w, &s.input)?;
            }
        }
        Ok(())
    }

    fn write_credential(&self, w: &mut Writer, cred: &Credential) -> Result<(), CodecError> {
        self.creds.write_tag(w, cred.type_name())?;
        let sigs = cred.sigs();
        w.write_len(sigs.len());
        for sig in sigs {
            w.write_fixed(sig);
        }
        Ok(())
    }

    fn write_transferable_output(
        &self,
        w: &mut Writer,
        out: &TransferableOutput,
    ) -> Result<(), CodecError> {
        w.write_id(&out.asset_id);
        self.write_output(w, &out.out)
    }

    fn write_transferable_input(
        &self,
        w: &mut Writer,
        input: &TransferableInput,
    ) -> Result<(), CodecError> {
        w.write_id(&input.utxo_id.tx_id);
        w.write_u32(input.utxo_id.output_index);
        w.write_id(&input.asset_id);
        self.write_input(w, &input.input)
    }

    fn write_base(&self, w: &mut Writer, base: &BaseTx) -> Result<(), CodecError> {
        w.write_u32(base.network_id);
        w.write_id(&base.chain_id);
        w.write_len(base.outs.len());
        for out in &base.outs {
            self.write_transferable_output(w, out)?;
        }
        w.write_len(base.ins.len());
        for input in &base.ins {
            self.write_transferable_input(w, input)?;
        }
        w.write_bytes(&base.memo);
        Ok(())
    }

    fn write_staker(&self, w: &mut Writer, staker: &Staker) {
        w.write_short_id(&staker.node_id);
        w.write_u64(staker.start_time);
        w.write_u64(staker.end_time);
        w.write_u64(staker.weight);
    }

    fn write_subnet_auth(&self, w: &mut Writer, auth: &SubnetAuth) {
        w.write_len(auth.sig_indices.len());
        for idx in &auth.sig_indices {
            w.write_u32(*idx);
        }
    }

    fn write_unsigned_body(&self, w: &mut Writer, unsigned: &UnsignedTx) -> Result<(), CodecError> {
        match unsigned {
            UnsignedTx::Base(base) => self.write_base(w, base)?,
            UnsignedTx::CreateAsset(t) => {
                self.write_base(w, &t.base)?;
                w.write_str(&t.name);
                w.write_str(&t.symbol);
                w.write_u8(t.denomination);
                w.write_len(t.states.len());
                for state in &t.states {
                    match state {
                        InitialState::FixedCap(holders) => {
                            w.write_u32(0);
                            w.write_len(holders.len());
                            for holder in holders {
                                w.write_u64(holder.amount);
                                w.write_short_id(&holder.address);
                            }
                        }
                        InitialState::VariableCap(owners) => {
                            w.write_u32(1);
                            w.write_len(owners.len());
                            for owner in owners {
                                owner.write(w);
                            }
                        }
                    }
                }
            }
            UnsignedTx::Operation(t) => {
                self.write_base(w, &t.base)?;
                w.write_len(t.ops.len());
                for op in &t.ops {
                    w.write_id(&op.asset_id);
                    w.write_len(op.utxo_ids.len());
                    for utxo_id in &op.utxo_ids {
                        w.write_id(&utxo_id.tx_id);
                        w.write_u32(utxo_id.output_index);
                    }
                    w.write_len(op.outputs.len());
                    for out in &op.outputs {
                        self.write_output(w, out)?;
                    }
                }
            }
            UnsignedTx::Import(t) => {
                self.write_base(w, &t.base)?;
                w.write_id(&t.source_chain);
                w.write_len(t.imported_ins.len());
                for input in &t.imported_ins {
                    self.write_transferable_input(w, input)?;
                }
            }
            UnsignedTx::Export(t) => {
                self.write_base(w, &t.base)?;
                w.write_id(&t.dest_chain);
                w.write_len(t.exported_outs.len());
                for out in &t.exported_outs {
                    self.write_transferable_output(w, out)?;
                }
            }
            UnsignedTx::AddValidator(t) => {
                self.write_base(w, &t.base)?;
                self.write_staker(w, &t.staker);
                w.write_len(t.stake.len());
                for out in &t.stake {
                    self.write_transferable_output(w, out)?;
                }
                t.reward_owner.write(w);
                w.write_u32(t.delegation_shares);
            }
            UnsignedTx::AddDelegator(t) => {
                self.write_base(w, &t.base)?;
                self.write_staker(w, &t.staker);
                w.write_len(t.stake.len());
                for out in &t.stake {
                    self.write_transferable_output(w, out)?;
                }
                t.reward_owner.write(w);
            }
            UnsignedTx::AddSubnetValidator(t) => {
                self.write_base(w, &t.base)?;
                self.write_staker(w, &t.staker);
                w.write_id(&t.subnet_id);
                self.write_subnet_auth(w, &t.subnet_auth);
            }
            UnsignedTx::CreateChain(t) => {
                self.write_base(w, &t.base)?;
                w.write_id(&t.subnet_id);
                w.write_str(&t.chain_name);
                w.write_id(&t.vm_id);
                w.write_len(t.fx_ids.len());
                for fx_id in &t.fx_ids {
                    w.write_id(fx_id);
                }
                w.write_bytes(&t.genesis_data);
                self.write_subnet_auth(w, &t.subnet_auth);
            }
            UnsignedTx::CreateSubnet(t) => {
                self.write_base(w, &t.base)?;
                t.owner.write(w);
            }
            UnsignedTx::Advance(t) => {
                w.write_u64(t.time);
            }
            UnsignedTx::Reward(t) => {
                w.write_id(&t.tx_id);
            }
        }
        Ok(())
    }
}

// ── Decode constructors (registered in TxCodec::new) ──

fn decode_transfer_output(r: &mut Reader<'_>, _c: &TxCodec) -> Result<Output, CodecError> {
    let amount = r.read_u64()?;
    let owners = OutputOwners::read(r)?;
    Ok(Output::Transfer(TransferOutput { amount, owners }))
}

fn decode_nft_output(r: &mut Reader<'_>, _c: &TxCodec) -> Result<Output, CodecError> {
    let group_id = r.read_u32()?;
    let payload = r.read_bytes()?.to_vec();
    let owners = OutputOwners::read(r)?;
    Ok(Output::Nft(NftTransferOutput {
        group_id,
        payload,
        owners,
    }))
}

fn decode_property_output(r: &mut Reader<'_>, _c: &TxCodec) -> Result<Output, CodecError> {
    let payload = r.read_bytes()?.to_vec();
    let owners = OutputOwners::read(r)?;
    Ok(Output::Property(PropertyOutput { payload, owners }))
}

fn decode_stakeable_lock_out(r: &mut Reader<'_>, c: &TxCodec) -> Result<Output, CodecError> {
    let locktime = r.read_u64()?;
    let out = c.outputs.decode(r, c)?;
    Ok(Output::StakeableLock(StakeableLockOut {
        locktime,
        out: Box::new(out),
    }))
}

fn decode_transfer_input(r: &mut Reader<'_>, _c: &TxCodec) -> Result<Input, CodecError> {
    let amount = r.read_u64()?;
    let n = r.read_len()?;
    let mut sig_indices = Vec::with_capacity(n);
    for _ in 0..n {
        sig_indices.push(r.read_u32()?);
    }
    Ok(Input::Transfer(TransferInput {
        amount,
        sig_indices,
    }))
}

fn decode_stakeable_lock_in(r: &mut Reader<'_>, c: &TxCodec) -> Result<Input, CodecError> {
    let locktime = r.read_u64()?;
    let input = c.inputs.decode(r, c)?;
    Ok(Input::StakeableLock(StakeableLockIn {
        locktime,
        input: Box::new(input),
    }))
}

fn decode_sigs(r: &mut Reader<'_>) -> Result<SecpCredential, CodecError> {
    let n = r.read_len()?;
    let mut sigs = Vec::with_capacity(n);
    for _ in 0..n {
        let raw = r.read_fixed(65)?;
        sigs.push(raw.try_into().unwrap());
    }
    Ok(SecpCredential { sigs })
}

fn decode_secp_cred(r: &mut Reader<'_>, _c: &TxCodec) -> Result<Credential, CodecError> {
    Ok(Credential::Secp256k1(decode_sigs(r)?))
}

fn decode_nft_cred(r: &mut Reader<'_>, _c: &TxCodec) -> Result<Credential, CodecError> {
    Ok(Credential::Nft(decode_sigs(r)?))
}

fn decode_property_cred(r: &mut Reader<'_>, _c: &TxCodec) -> Result<Credential, CodecError> {
    Ok(Credential::Property(decode_sigs(r)?))
}

fn decode_transferable_output(
    r: &mut Reader<'_>,
    c: &TxCodec,
) -> Result<TransferableOutput, CodecError> {
    let asset_id = r.read_id()?;
    let out = c.outputs.decode(r, c)?;
    Ok(TransferableOutput { asset_id, out })
}

fn decode_transferable_input(
    r: &mut Reader<'_>,
    c: &TxCodec,
) -> Result<TransferableInput, CodecError> {
    let tx_id = r.read_id()?;
    let output_index = r.read_u32()?;
    let asset_id = r.read_id()?;
    let input = c.inputs.decode(r, c)?;
    Ok(TransferableInput {
        utxo_id: UtxoId {
            tx_id,
            output_index,
        },
        asset_id,
        input,
    })
}

fn decode_base(r: &mut Reader<'_>, c: &TxCodec) -> Result<BaseTx, CodecError> {
    let network_id = r.read_u32()?;
    let chain_id = r.read_id()?;
    let n = r.read_len()?;
    let mut outs = Vec::with_capacity(n);
    for _ in 0..n {
        outs.push(decode_transferable_output(r, c)?);
    }
    let n = r.read_len()?;
    let mut ins = Vec::with_capacity(n);
    for _ in 0..n {
        ins.push(decode_transferable_input(r, c)?);
    }
    let memo = r.read_bytes()?.to_vec();
    Ok(BaseTx {
        network_id,
        chain_id,
        outs,
        ins,
        memo,
    })
}

fn decode_staker(r: &mut Reader<'_>) -> Result<Staker, CodecError> {
    Ok(Staker {
        node_id: r.read_short_id()?,
        start_time: r.read_u64()?,
        end_time: r.read_u64()?,
        weight: r.read_u64()?,
    })
}

fn decode_subnet_auth(r: &mut Reader<'_>) -> Result<SubnetAuth, CodecError> {
    let n = r.read_len()?;
    let mut sig_indices = Vec::with_capacity(n);
    for _ in 0..n {
        sig_indices.push(r.read_u32()?);
    }
    Ok(SubnetAuth { sig_indices })
}

fn decode_base_tx(r: &mut Reader<'_>, c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    Ok(UnsignedTx::Base(decode_base(r, c)?))
}

fn decode_create_asset_tx(r: &mut Reader<'_>, c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    let base = decode_base(r, c)?;
    let name = r.read_str()?;
    let symbol = r.read_str()?;
    let denomination = r.read_u8()?;
    let n = r.read_len()?;
    let mut states = Vec::with_capacity(n);
    for _ in 0..n {
        let tag = r.read_u32()?;
        states.push(match tag {
            0 => {
                let n = r.read_len()?;
                let mut holders = Vec::with_capacity(n);
                for _ in 0..n {
                    holders.push(Holder {
                        amount: r.read_u64()?,
                        address: r.read_short_id()?,
                    });
                }
                InitialState::FixedCap(holders)
            }
            1 => {
                let n = r.read_len()?;
                let mut owners = Vec::with_capacity(n);
                for _ in 0..n {
                    owners.push(OutputOwners::read(r)?);
                }
                InitialState::VariableCap(owners)
            }
            other => return Err(CodecError::UnknownType(other)),
        });
    }
    Ok(UnsignedTx::CreateAsset(CreateAssetTx {
        base,
        name,
        symbol,
        denomination,
        states,
    }))
}

fn decode_operation_tx(r: &mut Reader<'_>, c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    let base = decode_base(r, c)?;
    let n = r.read_len()?;
    let mut ops = Vec::with_capacity(n);
    for _ in 0..n {
        let asset_id = r.read_id()?;
        let n = r.read_len()?;
        let mut utxo_ids = Vec::with_capacity(n);
        for _ in 0..n {
            utxo_ids.push(UtxoId {
                tx_id: r.read_id()?,
                output_index: r.read_u32()?,
            });
        }
        let n = r.read_len()?;
        let mut outputs = Vec::with_capacity(n);
        for _ in 0..n {
            outputs.push(c.outputs.decode(r, c)?);
        }
        ops.push(Operation {
            asset_id,
            utxo_ids,
            outputs,
        });
    }
    Ok(UnsignedTx::Operation(OperationTx { base, ops }))
}

fn decode_import_tx(r: &mut Reader<'_>, c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    let base = decode_base(r, c)?;
    let source_chain = r.read_id()?;
    let n = r.read_len()?;
    let mut imported_ins = Vec::with_capacity(n);
    for _ in 0..n {
        imported_ins.push(decode_transferable_input(r, c)?);
    }
    Ok(UnsignedTx::Import(ImportTx {
        base,
        source_chain,
        imported_ins,
    }))
}

fn decode_export_tx(r: &mut Reader<'_>, c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    let base = decode_base(r, c)?;
    let dest_chain = r.read_id()?;
    let n = r.read_len()?;
    let mut exported_outs = Vec::with_capacity(n);
    for _ in 0..n {
        exported_outs.push(decode_transferable_output(r, c)?);
    }
    Ok(UnsignedTx::Export(ExportTx {
        base,
        dest_chain,
        exported_outs,
    }))
}

fn decode_stake_outs(
    r: &mut Reader<'_>,
    c: &TxCodec,
) -> Result<Vec<TransferableOutput>, CodecError> {
    let n = r.read_len()?;
    let mut stake = Vec::with_capacity(n);
    for _ in 0..n {
        stake.push(decode_transferable_output(r, c)?);
    }
    Ok(stake)
}

fn decode_add_validator_tx(r: &mut Reader<'_>, c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    let base = decode_base(r, c)?;
    let staker = decode_staker(r)?;
    let stake = decode_stake_outs(r, c)?;
    let reward_owner = OutputOwners::read(r)?;
    let delegation_shares = r.read_u32()?;
    Ok(UnsignedTx::AddValidator(AddValidatorTx {
        base,
        staker,
        stake,
        reward_owner,
        delegation_shares,
    }))
}

fn decode_add_delegator_tx(r: &mut Reader<'_>, c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    let base = decode_base(r, c)?;
    let staker = decode_staker(r)?;
    let stake = decode_stake_outs(r, c)?;
    let reward_owner = OutputOwners::read(r)?;
    Ok(UnsignedTx::AddDelegator(AddDelegatorTx {
        base,
        staker,
        stake,
        reward_owner,
    }))
}

fn decode_add_subnet_validator_tx(
    r: &mut Reader<'_>,
    c: &TxCodec,
) -> Result<UnsignedTx, CodecError> {
    let base = decode_base(r, c)?;
    let staker = decode_staker(r)?;
    let subnet_id = r.read_id()?;
    let subnet_auth = decode_subnet_auth(r)?;
    Ok(UnsignedTx::AddSubnetValidator(AddSubnetValidatorTx {
        base,
        staker,
        subnet_id,
        subnet_auth,
    }))
}

fn decode_create_chain_tx(r: &mut Reader<'_>, c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    let base = decode_base(r, c)?;
    let subnet_id = r.read_id()?;
    let chain_name = r.read_str()?;
    let vm_id = r.read_id()?;
    let n = r.read_len()?;
    let mut fx_ids = Vec::with_capacity(n);
    for _ in 0..n {
        fx_ids.push(r.read_id()?);
    }
    let genesis_data = r.read_bytes()?.to_vec();
    let subnet_auth = decode_subnet_auth(r)?;
    Ok(UnsignedTx::CreateChain(CreateChainTx {
        base,
        subnet_id,
        chain_name,
        vm_id,
        fx_ids,
        genesis_data,
        subnet_auth,
    }))
}

fn decode_create_subnet_tx(r: &mut Reader<'_>, c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    let base = decode_base(r, c)?;
    let owner = OutputOwners::read(r)?;
    Ok(UnsignedTx::CreateSubnet(CreateSubnetTx { base, owner }))
}

fn decode_advance_time_tx(r: &mut Reader<'_>, _c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    Ok(UnsignedTx::Advance(AdvanceTimeTx {
        time: r.read_u64()?,
    }))
}

fn decode_reward_validator_tx(r: &mut Reader<'_>, _c: &TxCodec) -> Result<UnsignedTx, CodecError> {
    Ok(UnsignedTx::Reward(RewardValidatorTx {
        tx_id: r.read_id()?,
    }))
}
