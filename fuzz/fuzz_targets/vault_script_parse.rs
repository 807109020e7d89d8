#![no_main]

use bitcoin::Script;
use farvault_vault::VaultScript;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // parse must never panic, and only accepts canonical encodings
    if let Ok(vault) = VaultScript::parse(Script::from_bytes(data)) {
        assert_eq!(vault.compile().as_bytes(), data);
    }
});
