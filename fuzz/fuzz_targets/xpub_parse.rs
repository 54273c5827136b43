#![no_main]

use libfuzzer_sys::fuzz_target;
use quorum_core::xpub::parse;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a SLIP-132 extended key. parse must never panic.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = parse(s, bitcoin::Network::Bitcoin);
        let _ = parse(s, bitcoin::Network::Testnet);
    }
});
