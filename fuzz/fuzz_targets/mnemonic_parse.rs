#![no_main]

use libfuzzer_sys::fuzz_target;
use quorum_core::seed::parse_mnemonic;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a BIP-39 phrase. parse_mnemonic must never panic;
    // it always returns Ok or Err.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = parse_mnemonic(s);
    }
});
