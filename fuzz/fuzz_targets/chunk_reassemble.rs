#![no_main]

use libfuzzer_sys::fuzz_target;
use quorum_psbt::{reassemble_string, Chunk};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes as a JSON array of chunks. reassemble_string must
    // never panic on any index/total/txid combination.
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(chunks) = serde_json::from_str::<Vec<Chunk>>(s) {
            let _ = reassemble_string(&chunks);
        }
    }
});
