//! Transaction assembly and finalization
//!
//! Supported inputs:
//! - Legacy P2PKH (`44'`): `script_sig = <sig> <pubkey>`
//! - Nested P2SH-P2WPKH (`49'`): `script_sig = <redeem>`, witness `[<sig>, <pubkey>]`
//! - Native P2WPKH (`84'`): witness `[<sig>, <pubkey>]`
//! - Vault P2WSH: the matured or rushed witness of the vault script
//!
//! Each input carries its full previous transaction in the PSBT so external
//! signers can check input values.

use crate::signer::{InputSigner, SignerFactory};
use crate::BuildError;
use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    ecdsa, Address, Amount, CompressedPublicKey, Network, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Witness,
};
use farvault_core::{PublicKeyResolver, Purpose, Utxo};
use farvault_vault::{Branch, VaultScript};

/// A payment, or with no value, the destination of all remaining funds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: Address,
    pub value: Option<Amount>,
}

impl Target {
    pub fn new(address: Address, value: Amount) -> Self {
        Self {
            address,
            value: Some(value),
        }
    }

    /// Send everything not claimed by other targets here
    pub fn sweep(address: Address) -> Self {
        Self {
            address,
            value: None,
        }
    }
}

/// How one input is unlocked
#[derive(Debug, Clone)]
enum InputKind {
    Legacy,
    NestedSegwit { redeem_script: ScriptBuf },
    NativeSegwit,
    Vault { vault: VaultScript, branch: Branch },
}

#[derive(Debug, Clone)]
struct PreparedInput {
    public_key: PublicKey,
    kind: InputKind,
    sequence: Sequence,
    txout: TxOut,
}

/// Builds and finalizes transactions
pub struct TxBuilder {
    secp: Secp256k1<VerifyOnly>,
}

impl Default for TxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TxBuilder {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::verification_only(),
        }
    }

    /// Match a UTXO to the key this wallet holds for it.
    async fn prepare_input(
        &self,
        utxo: &Utxo,
        keys: &dyn PublicKeyResolver,
        network: Network,
    ) -> Result<PreparedInput, BuildError> {
        let outpoint = utxo.outpoint();
        let txout = utxo
            .txout()
            .cloned()
            .ok_or(BuildError::MissingOutput(outpoint))?;
        if !utxo.path.matches_network(network) {
            return Err(BuildError::WrongNetwork {
                path: utxo.path,
                network,
            });
        }
        let public_key = keys
            .public_key(&utxo.path, network)
            .await
            .map_err(BuildError::Signer)?;
        let compressed = CompressedPublicKey(public_key);
        let default_sequence = utxo.sequence.unwrap_or(Sequence::ENABLE_RBF_NO_LOCKTIME);

        let (kind, expected, sequence) = match &utxo.witness_script {
            Some(witness_script) => {
                let vault = VaultScript::parse(witness_script)?;
                let branch = vault
                    .branch_for(&public_key)
                    .map_err(|_| BuildError::KeyMismatch(outpoint))?;
                let sequence = match branch {
                    Branch::Matured => vault.matured_sequence(),
                    Branch::Rushed => default_sequence,
                };
                (
                    InputKind::Vault { vault, branch },
                    witness_script.to_p2wsh(),
                    sequence,
                )
            }
            None => match utxo.path.purpose() {
                Purpose::Legacy => (
                    InputKind::Legacy,
                    ScriptBuf::new_p2pkh(&compressed.pubkey_hash()),
                    default_sequence,
                ),
                Purpose::NestedSegwit => {
                    let redeem_script = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
                    let expected = redeem_script.to_p2sh();
                    (
                        InputKind::NestedSegwit { redeem_script },
                        expected,
                        default_sequence,
                    )
                }
                Purpose::NativeSegwit => (
                    InputKind::NativeSegwit,
                    ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()),
                    default_sequence,
                ),
            },
        };

        if txout.script_pubkey != expected {
            return Err(BuildError::KeyMismatch(outpoint));
        }
        if let Some(supplied) = &utxo.redeem_script {
            match &kind {
                InputKind::NestedSegwit { redeem_script } if redeem_script == supplied => {}
                _ => return Err(BuildError::KeyMismatch(outpoint)),
            }
        }
        Ok(PreparedInput {
            public_key,
            kind,
            sequence,
            txout,
        })
    }

    /// Resolve targets to outputs.
    fn outputs(&self, targets: &[Target], total_in: Amount, network: Network) -> Result<Vec<TxOut>, BuildError> {
        if targets.is_empty() {
            return Err(BuildError::NoTargets);
        }
        if targets.iter().filter(|t| t.value.is_none()).count() > 1 {
            return Err(BuildError::MultipleSweepTargets);
        }
        let fixed = targets
            .iter()
            .filter_map(|t| t.value)
            .try_fold(Amount::ZERO, |acc, v| acc.checked_add(v))
            .ok_or(BuildError::AmountOverflow)?;
        let remainder = total_in
            .checked_sub(fixed)
            .ok_or(BuildError::InsufficientFunds {
                available: total_in,
                required: fixed,
            })?;

        targets
            .iter()
            .map(|target| {
                if !target.address.as_unchecked().is_valid_for_network(network) {
                    return Err(BuildError::WrongAddressNetwork {
                        address: target.address.to_string(),
                        network,
                    });
                }
                let script_pubkey = target.address.script_pubkey();
                let value = target.value.unwrap_or(remainder);
                if value < script_pubkey.minimal_non_dust() {
                    return Err(BuildError::DustOutput {
                        address: target.address.to_string(),
                        value,
                    });
                }
                Ok(TxOut {
                    value,
                    script_pubkey,
                })
            })
            .collect()
    }

    /// Assemble, sign and finalize a transaction spending every UTXO.
    ///
    /// Targets with a value are paid exactly; a single target without a
    /// value receives what is left, leaving no fee.
    pub async fn build(
        &self,
        utxos: &[Utxo],
        targets: &[Target],
        signer: &dyn SignerFactory,
        keys: &dyn PublicKeyResolver,
        network: Network,
    ) -> Result<Transaction, BuildError> {
        if utxos.is_empty() {
            return Err(BuildError::NoInputs);
        }

        let mut inputs = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            inputs.push(self.prepare_input(utxo, keys, network).await?);
        }
        let total_in = inputs
            .iter()
            .try_fold(Amount::ZERO, |acc, input| acc.checked_add(input.txout.value))
            .ok_or(BuildError::AmountOverflow)?;

        let unsigned = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: utxos
                .iter()
                .zip(&inputs)
                .map(|(utxo, input)| TxIn {
                    previous_output: utxo.outpoint(),
                    script_sig: ScriptBuf::new(),
                    sequence: input.sequence,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs(targets, total_in, network)?,
        };

        let mut psbt =
            Psbt::from_unsigned_tx(unsigned.clone()).map_err(|e| BuildError::Psbt(e.to_string()))?;
        for ((psbt_input, utxo), input) in psbt.inputs.iter_mut().zip(utxos).zip(&inputs) {
            psbt_input.non_witness_utxo = Some(utxo.tx.clone());
            match &input.kind {
                InputKind::NestedSegwit { redeem_script } => {
                    psbt_input.redeem_script = Some(redeem_script.clone());
                }
                InputKind::Vault { vault, .. } => {
                    psbt_input.witness_script = Some(vault.compile());
                }
                InputKind::Legacy | InputKind::NativeSegwit => {}
            }
        }

        let signers = signer
            .create_signers(&psbt, utxos, network)
            .await
            .map_err(BuildError::Signer)?;
        if signers.len() != utxos.len() {
            return Err(BuildError::SignerCount {
                expected: utxos.len(),
                got: signers.len(),
            });
        }

        let signatures = self.sign_all(&mut psbt, &unsigned, &inputs, &signers)?;
        self.finalize(&mut psbt, &inputs, &signatures)?;

        let tx = psbt.extract_tx_unchecked_fee_rate();
        log::info!(
            "Built transaction {} with {} inputs, {} outputs, {} vB",
            tx.compute_txid(),
            tx.input.len(),
            tx.output.len(),
            tx.vsize()
        );
        Ok(tx)
    }

    /// Sign every input, record the partial signatures, then verify them all.
    fn sign_all(
        &self,
        psbt: &mut Psbt,
        unsigned: &Transaction,
        inputs: &[PreparedInput],
        signers: &[InputSigner],
    ) -> Result<Vec<ecdsa::Signature>, BuildError> {
        let mut cache = SighashCache::new(unsigned);
        let mut messages: Vec<Message> = Vec::with_capacity(inputs.len());
        let mut signatures = Vec::with_capacity(inputs.len());

        for (index, (input, signer)) in inputs.iter().zip(signers).enumerate() {
            if signer.public_key != input.public_key {
                return Err(BuildError::KeyMismatch(unsigned.input[index].previous_output));
            }
            let (message, sighash_type) = psbt
                .sighash_ecdsa(index, &mut cache)
                .map_err(|e| BuildError::Sighash(e.to_string()))?;
            let signature = (signer.sign)(&message).map_err(BuildError::Signer)?;
            messages.push(message);
            signatures.push(ecdsa::Signature {
                signature,
                sighash_type,
            });
        }

        for ((psbt_input, input), signature) in psbt.inputs.iter_mut().zip(inputs).zip(&signatures) {
            psbt_input
                .partial_sigs
                .insert(bitcoin::PublicKey::new(input.public_key), *signature);
        }

        for (index, ((message, signature), input)) in
            messages.iter().zip(&signatures).zip(inputs).enumerate()
        {
            self.secp
                .verify_ecdsa(message, &signature.signature, &input.public_key)
                .map_err(|_| BuildError::InvalidSignature(index))?;
        }
        Ok(signatures)
    }

    /// Write the final script_sig / witness of each input.
    fn finalize(
        &self,
        psbt: &mut Psbt,
        inputs: &[PreparedInput],
        signatures: &[ecdsa::Signature],
    ) -> Result<(), BuildError> {
        for ((psbt_input, input), signature) in psbt.inputs.iter_mut().zip(inputs).zip(signatures) {
            match &input.kind {
                InputKind::Legacy => {
                    psbt_input.final_script_sig = Some(
                        Builder::new()
                            .push_slice(signature.serialize())
                            .push_key(&bitcoin::PublicKey::new(input.public_key))
                            .into_script(),
                    );
                }
                InputKind::NestedSegwit { redeem_script } => {
                    let redeem = PushBytesBuf::try_from(redeem_script.to_bytes())
                        .map_err(|e| BuildError::Psbt(e.to_string()))?;
                    psbt_input.final_script_sig = Some(Builder::new().push_slice(redeem).into_script());
                    psbt_input.final_script_witness =
                        Some(Witness::p2wpkh(signature, &input.public_key));
                }
                InputKind::NativeSegwit => {
                    psbt_input.final_script_witness =
                        Some(Witness::p2wpkh(signature, &input.public_key));
                }
                InputKind::Vault { vault, branch } => {
                    psbt_input.final_script_witness = Some(vault.witness(*branch, signature));
                }
            }
            psbt_input.partial_sigs.clear();
            psbt_input.sighash_type = None;
            psbt_input.redeem_script = None;
            psbt_input.witness_script = None;
            psbt_input.bip32_derivation.clear();
        }
        Ok(())
    }
}
