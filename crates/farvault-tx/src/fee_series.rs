//! One sweep transaction per candidate fee rate

use crate::builder::{Target, TxBuilder};
use crate::signer::SignerFactory;
use crate::BuildError;
use bitcoin::{Address, Amount, Network, Transaction};
use farvault_core::{PublicKeyResolver, Utxo};

/// Rebuilds allowed when a signature comes out longer than in the probe
const MAX_RESIZE_ATTEMPTS: usize = 3;

/// A signed sweep paying `fee`
#[derive(Debug, Clone)]
pub struct FeeSeriesEntry {
    pub tx: Transaction,
    pub fee: Amount,
    /// Realized rate in sat/vB
    pub fee_rate: f64,
    pub requested_fee_rate: f64,
}

fn fee_for(vsize: usize, rate: f64) -> Result<Amount, BuildError> {
    let fee = (vsize as f64 * rate).ceil();
    if !fee.is_finite() || fee < 0.0 || fee > Amount::MAX_MONEY.to_sat() as f64 {
        return Err(BuildError::InvalidFeeRate(rate));
    }
    Ok(Amount::from_sat(fee as u64))
}

/// Sweep `utxos` to `address` once per rate in `fee_rates` (sat/vB).
///
/// A zero-fee probe fixes the virtual size. Rates whose fee exceeds the
/// input total, or would leave a dust output, are left out of the series.
pub async fn build_fee_series(
    utxos: &[Utxo],
    address: &Address,
    signer: &dyn SignerFactory,
    keys: &dyn PublicKeyResolver,
    fee_rates: &[f64],
    network: Network,
) -> Result<Vec<FeeSeriesEntry>, BuildError> {
    if let Some(rate) = fee_rates.iter().find(|r| !r.is_finite() || **r < 0.0) {
        return Err(BuildError::InvalidFeeRate(*rate));
    }

    let builder = TxBuilder::new();
    let probe = builder
        .build(utxos, &[Target::sweep(address.clone())], signer, keys, network)
        .await?;
    let total: Amount = probe.output.iter().map(|o| o.value).sum();
    let dust = address.script_pubkey().minimal_non_dust();
    let probe_vsize = probe.vsize();
    log::debug!("Fee series probe: {} vB, {} in", probe_vsize, total);

    let mut series = Vec::new();
    for &rate in fee_rates {
        let mut vsize = probe_vsize;
        let mut attempts = 0;
        loop {
            let fee = fee_for(vsize, rate)?;
            let value = match total.checked_sub(fee) {
                Some(value) if value >= dust => value,
                _ => {
                    log::debug!("Skipping {} sat/vB: fee {} leaves no spendable output", rate, fee);
                    break;
                }
            };
            let tx = builder
                .build(utxos, &[Target::new(address.clone(), value)], signer, keys, network)
                .await?;
            let actual = tx.vsize();
            if actual > vsize && attempts < MAX_RESIZE_ATTEMPTS {
                attempts += 1;
                vsize = actual;
                continue;
            }
            series.push(FeeSeriesEntry {
                fee_rate: fee.to_sat() as f64 / actual as f64,
                requested_fee_rate: rate,
                fee,
                tx,
            });
            break;
        }
    }
    log::info!("Built fee series of {} transactions", series.len());
    Ok(series)
}
