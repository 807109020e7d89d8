//! Spendable outputs tied to a wallet path

use crate::paths::DerivationPath;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxOut};
use serde::{Deserialize, Serialize};

/// An unspent output together with everything needed to spend it.
///
/// The full previous transaction is kept so signers can verify input
/// values independently of the witness data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub tx: Transaction,
    pub vout: u32,
    pub path: DerivationPath,
    /// Vault locking script for P2WSH outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness_script: Option<ScriptBuf>,
    /// P2SH redeem script; must match the one derived from the path's key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<ScriptBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
}

impl Utxo {
    pub fn new(tx: Transaction, vout: u32, path: DerivationPath) -> Self {
        Self {
            tx,
            vout,
            path,
            witness_script: None,
            redeem_script: None,
            sequence: None,
        }
    }

    pub fn with_witness_script(mut self, script: ScriptBuf) -> Self {
        self.witness_script = Some(script);
        self
    }

    pub fn with_redeem_script(mut self, script: ScriptBuf) -> Self {
        self.redeem_script = Some(script);
        self
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx.compute_txid(), self.vout)
    }

    /// The output being spent, if `vout` is in range
    pub fn txout(&self) -> Option<&TxOut> {
        self.tx.output.get(self.vout as usize)
    }

    pub fn value(&self) -> Option<Amount> {
        self.txout().map(|out| out.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;

    fn funding_tx(values: &[u64]) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: values
                .iter()
                .map(|v| TxOut {
                    value: Amount::from_sat(*v),
                    script_pubkey: ScriptBuf::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_outpoint_and_value() {
        let tx = funding_tx(&[1_000, 2_500]);
        let path: DerivationPath = "84'/1'/0'/0/0".parse().unwrap();
        let utxo = Utxo::new(tx.clone(), 1, path);
        assert_eq!(utxo.outpoint(), OutPoint::new(tx.compute_txid(), 1));
        assert_eq!(utxo.value(), Some(Amount::from_sat(2_500)));

        let missing = Utxo::new(tx, 2, path);
        assert_eq!(missing.value(), None);
    }

    #[test]
    fn test_serde_skips_empty_scripts() {
        let path: DerivationPath = "84'/1'/0'/0/0".parse().unwrap();
        let utxo = Utxo::new(funding_tx(&[5_000]), 0, path);
        let json = serde_json::to_value(&utxo).unwrap();
        assert!(json.get("witness_script").is_none());
        assert_eq!(json["path"], "84'/1'/0'/0/0");
        let restored: Utxo = serde_json::from_value(json).unwrap();
        assert_eq!(restored, utxo);
    }
}
