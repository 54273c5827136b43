#![no_main]

use libfuzzer_sys::fuzz_target;
use quorum_script::address::decode;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as an address string, against both networks.
    // decode must never panic.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = decode(s, bitcoin::Network::Bitcoin);
        let _ = decode(s, bitcoin::Network::Testnet);
    }
});
