#![no_main]

use farvault_core::DerivationPath;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(path) = s.parse::<DerivationPath>() {
            // Anything accepted must serialize back to a parseable string
            let serialized = path.serialize().expect("parsed path serializes");
            let reparsed: DerivationPath = serialized.parse().expect("serialized path parses");
            assert_eq!(path, reparsed);
        }
    }
});
