//! QR-sized chunk transport for PSBTs.
//!
//! A base64 export can exceed what one QR code comfortably holds, so it is
//! split into indexed chunks that each carry enough metadata to detect a
//! missing or foreign piece. Chunks are JSON records; reassembly demands a
//! complete, consistent set.

use bitcoin::psbt::Psbt;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{PsbtEngine, PsbtError};

/// Default split size, tuned for comfortably scannable QR codes.
pub const DEFAULT_CHUNK_BYTES: usize = 2500;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkError {
    #[error("No chunks to reassemble")]
    Empty,
    #[error("Chunk {index} of the sequence is missing")]
    ChunkMissing { index: u32 },
    #[error("Chunk {index} appears more than once")]
    Duplicate { index: u32 },
    #[error("Chunks disagree: {0}")]
    Mismatch(String),
    #[error("Reassembled data is not a valid transaction: {0}")]
    Payload(String),
}

/// One QR-sized piece of a serialized PSBT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 1-based position in the sequence.
    pub index: u32,
    pub total: u32,
    /// Unsigned-transaction id, so pieces of different transactions cannot
    /// be mixed.
    pub txid: String,
    /// Slice of the base64 serialization.
    pub data: String,
}

impl PsbtEngine {
    /// Split a PSBT's base64 form into chunks of at most `max_bytes`.
    pub fn chunk(&self, psbt: &Psbt, max_bytes: usize) -> Vec<Chunk> {
        let export = self.export(psbt);
        chunk_string(&export.base64, export.txid, max_bytes)
    }

    /// Rebuild a PSBT from a complete chunk set, in any order.
    pub fn reassemble(&self, chunks: &[Chunk]) -> Result<Psbt, ChunkError> {
        let base64 = reassemble_string(chunks)?;
        let import = self
            .import(&base64)
            .map_err(|e: PsbtError| ChunkError::Payload(e.to_string()))?;
        if import.txid.to_string() != chunks[0].txid {
            return Err(ChunkError::Mismatch(
                "reassembled transaction id differs from the chunk header".into(),
            ));
        }
        Ok(import.psbt)
    }
}

/// Split `data` into `⌈len / max_bytes⌉` chunks.
pub fn chunk_string(data: &str, txid: Txid, max_bytes: usize) -> Vec<Chunk> {
    let max_bytes = max_bytes.max(1);
    let pieces: Vec<&str> = data
        .as_bytes()
        .chunks(max_bytes)
        .map(|c| std::str::from_utf8(c).expect("base64 is ascii"))
        .collect();
    let total = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| Chunk {
            index: i as u32 + 1,
            total,
            txid: txid.to_string(),
            data: piece.to_string(),
        })
        .collect()
}

/// Validate a chunk set and concatenate its payload.
pub fn reassemble_string(chunks: &[Chunk]) -> Result<String, ChunkError> {
    let first = chunks.first().ok_or(ChunkError::Empty)?;
    let total = first.total;
    if total == 0 {
        return Err(ChunkError::Empty);
    }

    // Keyed by index rather than slot-allocated: `total` is attacker
    // controlled in transport and must not size an allocation.
    let mut slots = std::collections::BTreeMap::new();
    for chunk in chunks {
        if chunk.total != total {
            return Err(ChunkError::Mismatch(format!(
                "chunk {} claims a total of {}, expected {}",
                chunk.index, chunk.total, total
            )));
        }
        if chunk.txid != first.txid {
            return Err(ChunkError::Mismatch(format!(
                "chunk {} belongs to a different transaction",
                chunk.index
            )));
        }
        if chunk.index == 0 || chunk.index > total {
            return Err(ChunkError::Mismatch(format!(
                "chunk index {} is outside 1..={}",
                chunk.index, total
            )));
        }
        if slots.insert(chunk.index, chunk).is_some() {
            return Err(ChunkError::Duplicate { index: chunk.index });
        }
    }

    let mut data = String::new();
    for index in 1..=total {
        match slots.get(&index) {
            Some(chunk) => data.push_str(&chunk.data),
            None => return Err(ChunkError::ChunkMissing { index }),
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn txid() -> Txid {
        Txid::from_slice(&[0xAB; 32]).unwrap()
    }

    #[test]
    fn test_6200_bytes_make_three_chunks() {
        let data = "A".repeat(6200);
        let chunks = chunk_string(&data, txid(), DEFAULT_CHUNK_BYTES);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data.len(), 2500);
        assert_eq!(chunks[1].data.len(), 2500);
        assert_eq!(chunks[2].data.len(), 1200);
        assert!(chunks.iter().all(|c| c.total == 3));
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_reassemble_in_any_order() {
        let data = "QUORUM".repeat(1000);
        let mut chunks = chunk_string(&data, txid(), 1000);
        chunks.reverse();
        assert_eq!(reassemble_string(&chunks).unwrap(), data);
    }

    #[test]
    fn test_missing_chunk_named() {
        let data = "B".repeat(6200);
        let mut chunks = chunk_string(&data, txid(), DEFAULT_CHUNK_BYTES);
        chunks.remove(1);
        assert_eq!(
            reassemble_string(&chunks).unwrap_err(),
            ChunkError::ChunkMissing { index: 2 }
        );
    }

    #[test]
    fn test_duplicate_chunk_rejected() {
        let data = "C".repeat(5000);
        let mut chunks = chunk_string(&data, txid(), 2500);
        chunks.push(chunks[0].clone());
        assert_eq!(
            reassemble_string(&chunks).unwrap_err(),
            ChunkError::Duplicate { index: 1 }
        );
    }

    #[test]
    fn test_foreign_chunk_rejected() {
        let data = "D".repeat(5000);
        let mut chunks = chunk_string(&data, txid(), 2500);
        chunks[1].txid = Txid::from_slice(&[0x01; 32]).unwrap().to_string();
        assert!(matches!(
            reassemble_string(&chunks).unwrap_err(),
            ChunkError::Mismatch(_)
        ));
    }

    #[test]
    fn test_disagreeing_totals_rejected() {
        let data = "E".repeat(5000);
        let mut chunks = chunk_string(&data, txid(), 2500);
        chunks[1].total = 5;
        assert!(matches!(
            reassemble_string(&chunks).unwrap_err(),
            ChunkError::Mismatch(_)
        ));
    }

    #[test]
    fn test_small_payload_single_chunk() {
        let chunks = chunk_string("tiny", txid(), DEFAULT_CHUNK_BYTES);
        assert_eq!(chunks.len(), 1);
        assert_eq!(reassemble_string(&chunks).unwrap(), "tiny");
    }

    #[test]
    fn test_chunks_serialize_as_json() {
        let chunks = chunk_string("payload", txid(), 4);
        let json = serde_json::to_string(&chunks[0]).unwrap();
        let back: Chunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunks[0]);
        assert!(json.contains("\"index\":1"));
        assert!(json.contains("\"total\":2"));
    }
}
