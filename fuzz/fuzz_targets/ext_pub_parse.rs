#![no_main]

use bitcoin::Network;
use farvault_core::{ExtPub, Purpose};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(key) = s.parse::<ExtPub>() {
            let _ = key.purpose();
            let _ = key.account_number();
            for network in [Network::Bitcoin, Network::Testnet] {
                for purpose in Purpose::ALL {
                    let _ = key.set_prefix(purpose, network);
                }
            }
        }
    }
});
