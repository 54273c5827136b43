#![no_main]

use libfuzzer_sys::fuzz_target;
use quorum_psbt::PsbtEngine;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a text-encoded PSBT. import must never panic,
    // whichever encoding path it takes.
    if let Ok(s) = std::str::from_utf8(data) {
        let engine = PsbtEngine::new(bitcoin::Network::Testnet);
        let _ = engine.import(s);
    }
});
