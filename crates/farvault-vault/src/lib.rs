//! FarVault Vault
//!
//! A P2WSH vault with two keys:
//!
//! ```text
//! <MATURED> CHECKSIG NOTIF <RUSHED> CHECKSIG ELSE <N> CSV ENDIF
//! ```
//!
//! **Matured path**: spendable by the matured key once the output is `N`
//! (BIP-68 encoded) old.
//!   - Witness: `[<sig_matured>, <witness_script>]`
//!   - CHECKSIG succeeds → NOTIF skips the rushed block → CSV leaves `N`
//!     on the stack, which is why `N` can never be zero.
//!
//! **Rushed path**: spendable by the rushed key at any time.
//!   - Witness: `[<sig_rushed>, <empty>, <witness_script>]`
//!   - CHECKSIG with the empty signature → 0 → NOTIF enters the rushed block.
//!
//! Scripts are canonical: [`VaultScript::parse`] only accepts bytes that
//! [`VaultScript::compile`] would reproduce exactly.

use bitcoin::blockdata::opcodes::all::{OP_CHECKSIG, OP_CSV, OP_ELSE, OP_ENDIF, OP_NOTIF};
use bitcoin::relative;
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{ecdsa, Address, Network, Script, ScriptBuf, Sequence, Witness};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// BIP-68 type flag (time-based lock when set)
const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;
/// BIP-68 lock value bits
const SEQUENCE_VALUE_MASK: u32 = 0x0000_ffff;

const COMPRESSED_KEY_LEN: usize = 33;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid relative lock time {0:#x}: must be a non-zero BIP-68 value")]
    InvalidLockTime(u32),

    #[error("Not a vault script")]
    NotAVaultScript,

    #[error("Public key is neither the matured nor the rushed key of this vault")]
    KeyNotInScript,
}

/// Which key of a vault spends it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Branch {
    /// Spent after the relative lock time elapsed
    Matured,
    /// Spent immediately by the rushed key
    Rushed,
}

/// Parameters of a vault locking script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultScript {
    matured: PublicKey,
    rushed: PublicKey,
    lock_time: u32,
}

fn validate_lock_time(lock_time: u32) -> Result<(), VaultError> {
    if lock_time == 0 || lock_time & !(SEQUENCE_TYPE_FLAG | SEQUENCE_VALUE_MASK) != 0 {
        return Err(VaultError::InvalidLockTime(lock_time));
    }
    Ok(())
}

fn parse_key(bytes: &[u8]) -> Result<PublicKey, VaultError> {
    if bytes.len() != COMPRESSED_KEY_LEN {
        return Err(VaultError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            COMPRESSED_KEY_LEN,
            bytes.len()
        )));
    }
    PublicKey::from_slice(bytes).map_err(|e| VaultError::InvalidPublicKey(e.to_string()))
}

impl VaultScript {
    /// `lock_time` is the BIP-68 encoded value CSV compares against.
    pub fn new(matured: PublicKey, rushed: PublicKey, lock_time: u32) -> Result<Self, VaultError> {
        validate_lock_time(lock_time)?;
        Ok(Self {
            matured,
            rushed,
            lock_time,
        })
    }

    /// Build from serialized 33-byte compressed keys.
    pub fn from_slices(matured: &[u8], rushed: &[u8], lock_time: u32) -> Result<Self, VaultError> {
        Self::new(parse_key(matured)?, parse_key(rushed)?, lock_time)
    }

    /// Vault locked for `blocks` blocks
    pub fn with_block_delay(matured: PublicKey, rushed: PublicKey, blocks: u16) -> Result<Self, VaultError> {
        Self::new(matured, rushed, relative::LockTime::from_height(blocks).to_consensus_u32())
    }

    pub fn matured_key(&self) -> PublicKey {
        self.matured
    }

    pub fn rushed_key(&self) -> PublicKey {
        self.rushed
    }

    /// BIP-68 encoded relative lock time
    pub fn lock_time(&self) -> u32 {
        self.lock_time
    }

    pub fn relative_lock_time(&self) -> Result<relative::LockTime, VaultError> {
        relative::LockTime::from_consensus(self.lock_time)
            .map_err(|_| VaultError::InvalidLockTime(self.lock_time))
    }

    /// Input sequence required to spend the matured branch
    pub fn matured_sequence(&self) -> Sequence {
        Sequence::from_consensus(self.lock_time)
    }

    /// Emit the locking script.
    pub fn compile(&self) -> ScriptBuf {
        Builder::new()
            .push_slice(self.matured.serialize())
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_NOTIF)
            .push_slice(self.rushed.serialize())
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_int(i64::from(self.lock_time))
            .push_opcode(OP_CSV)
            .push_opcode(OP_ENDIF)
            .into_script()
    }

    /// Recognize a vault script, rejecting anything not in canonical form.
    pub fn parse(script: &Script) -> Result<Self, VaultError> {
        let instructions = script
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VaultError::NotAVaultScript)?;

        let [
            Instruction::PushBytes(matured),
            Instruction::Op(check_matured),
            Instruction::Op(notif),
            Instruction::PushBytes(rushed),
            Instruction::Op(check_rushed),
            Instruction::Op(op_else),
            lock,
            Instruction::Op(csv),
            Instruction::Op(endif),
        ] = instructions.as_slice()
        else {
            return Err(VaultError::NotAVaultScript);
        };

        if *check_matured != OP_CHECKSIG
            || *notif != OP_NOTIF
            || *check_rushed != OP_CHECKSIG
            || *op_else != OP_ELSE
            || *csv != OP_CSV
            || *endif != OP_ENDIF
        {
            return Err(VaultError::NotAVaultScript);
        }

        let lock_time = lock
            .script_num()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(VaultError::NotAVaultScript)?;
        let (Ok(matured), Ok(rushed)) = (parse_key(matured.as_bytes()), parse_key(rushed.as_bytes())) else {
            return Err(VaultError::NotAVaultScript);
        };
        let vault = Self::new(matured, rushed, lock_time)?;

        if vault.compile().as_script() != script {
            return Err(VaultError::NotAVaultScript);
        }
        Ok(vault)
    }

    /// Which branch `key` can spend.
    pub fn branch_for(&self, key: &PublicKey) -> Result<Branch, VaultError> {
        if *key == self.matured {
            Ok(Branch::Matured)
        } else if *key == self.rushed {
            Ok(Branch::Rushed)
        } else {
            Err(VaultError::KeyNotInScript)
        }
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.compile().to_p2wsh()
    }

    pub fn address(&self, network: Network) -> Address {
        Address::p2wsh(&self.compile(), network)
    }

    pub fn matured_witness(&self, signature: &ecdsa::Signature) -> Witness {
        let mut witness = Witness::new();
        witness.push(signature.to_vec());
        witness.push(self.compile().as_bytes());
        witness
    }

    pub fn rushed_witness(&self, signature: &ecdsa::Signature) -> Witness {
        let mut witness = Witness::new();
        witness.push(signature.to_vec());
        witness.push(Vec::<u8>::new());
        witness.push(self.compile().as_bytes());
        witness
    }

    pub fn witness(&self, branch: Branch, signature: &ecdsa::Signature) -> Witness {
        match branch {
            Branch::Matured => self.matured_witness(signature),
            Branch::Rushed => self.rushed_witness(signature),
        }
    }
}

/// Classify an observed vault spend from its witness.
///
/// Returns `None` when the witness script is not a vault or the stack
/// matches neither branch.
pub fn detect_branch(witness: &Witness) -> Option<(VaultScript, Branch)> {
    let items: Vec<&[u8]> = witness.iter().collect();
    let (script, stack) = items.split_last()?;
    let vault = VaultScript::parse(Script::from_bytes(script)).ok()?;
    match stack {
        [sig] if !sig.is_empty() => Some((vault, Branch::Matured)),
        [sig, dummy] if !sig.is_empty() && dummy.is_empty() => Some((vault, Branch::Rushed)),
        _ => None,
    }
}
