//! Write-ahead log file format.
//!
//! The log begins with a fixed header (magic plus format version) followed by
//! a sequence of framed entries. Each frame is a little-endian payload length,
//! a CRC32 over the payload, and the payload itself: the JSON encoding of the
//! transaction id and its command list. Frames are only ever appended, and
//! the file is truncated back to the header at checkpoint.
//!
//! Scanning tolerates a damaged tail: a frame that is incomplete or fails its
//! checksum ends the scan at the last good frame, and the caller truncates
//! the file there. Damage anywhere before the tail is corruption.

use crate::error::{EngineError, Result};
use crate::model::TxId;
use crate::txn::command::TransactionRepresentation;
use serde::{Deserialize, Serialize};

pub const WAL_MAGIC: &[u8; 8] = b"VANTAWAL";
pub const WAL_VERSION: u16 = 1;
/// Magic plus version.
pub const HEADER_LEN: u64 = 10;

const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    tx_id: TxId,
    representation: TransactionRepresentation,
}

pub fn encode_header() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..8].copy_from_slice(WAL_MAGIC);
    header[8..].copy_from_slice(&WAL_VERSION.to_le_bytes());
    header
}

/// Encodes one committed transaction as a framed log entry.
pub fn encode_entry(tx_id: TxId, representation: &TransactionRepresentation) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(&WalEntry {
        tx_id,
        representation: representation.clone(),
    })
    .map_err(|e| EngineError::Serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Result of scanning a log image.
#[derive(Debug)]
pub struct ScanOutcome {
    pub entries: Vec<(TxId, TransactionRepresentation)>,
    /// Byte offset just past the last good frame.
    pub valid_len: u64,
    /// Whether bytes past `valid_len` must be truncated away.
    pub truncated_tail: bool,
}

/// Scans a complete log image, decoding every intact frame in order.
pub fn scan(bytes: &[u8]) -> Result<ScanOutcome> {
    if bytes.is_empty() {
        return Ok(ScanOutcome {
            entries: Vec::new(),
            valid_len: 0,
            truncated_tail: false,
        });
    }
    if bytes.len() < HEADER_LEN as usize || &bytes[..8] != WAL_MAGIC {
        return Err(EngineError::Corruption("log header mismatch".into()));
    }
    let version = u16::from_le_bytes([bytes[8], bytes[9]]);
    if version != WAL_VERSION {
        return Err(EngineError::Corruption(format!(
            "unsupported log format version {version}"
        )));
    }

    let mut entries = Vec::new();
    let mut offset = HEADER_LEN as usize;
    loop {
        if offset == bytes.len() {
            return Ok(ScanOutcome {
                entries,
                valid_len: offset as u64,
                truncated_tail: false,
            });
        }
        let Some(frame) = decode_frame(&bytes[offset..]) else {
            // Incomplete or checksum-failing tail, cut here.
            return Ok(ScanOutcome {
                entries,
                valid_len: offset as u64,
                truncated_tail: true,
            });
        };
        let (payload, frame_len) = frame;
        let entry: WalEntry = serde_json::from_slice(payload).map_err(|e| {
            EngineError::Corruption(format!("log entry at offset {offset}: {e}"))
        })?;
        entries.push((entry.tx_id, entry.representation));
        offset += frame_len;
    }
}

fn decode_frame(bytes: &[u8]) -> Option<(&[u8], usize)> {
    if bytes.len() < FRAME_HEADER_LEN {
        return None;
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let payload = bytes.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len)?;
    if crc32fast::hash(payload) != crc {
        return None;
    }
    Some((payload, FRAME_HEADER_LEN + len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::command::Command;

    fn representation(label: u32) -> TransactionRepresentation {
        TransactionRepresentation::new(vec![Command::NodeCounts { label, delta: 1 }], 0)
    }

    fn image(entries: &[(TxId, TransactionRepresentation)]) -> Vec<u8> {
        let mut bytes = encode_header().to_vec();
        for (id, rep) in entries {
            bytes.extend(encode_entry(*id, rep).unwrap());
        }
        bytes
    }

    #[test]
    fn scan_decodes_entries_in_order() {
        let bytes = image(&[(1, representation(7)), (2, representation(8))]);
        let outcome = scan(&bytes).unwrap();
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.entries[0].0, 1);
        assert_eq!(outcome.entries[1].0, 2);
        assert!(!outcome.truncated_tail);
        assert_eq!(outcome.valid_len, bytes.len() as u64);
    }

    #[test]
    fn partial_tail_is_cut_at_last_good_frame() {
        let mut bytes = image(&[(1, representation(7))]);
        let good_len = bytes.len() as u64;
        bytes.extend(encode_entry(2, &representation(8)).unwrap());
        bytes.truncate(bytes.len() - 3);

        let outcome = scan(&bytes).unwrap();
        assert_eq!(outcome.entries.len(), 1);
        assert!(outcome.truncated_tail);
        assert_eq!(outcome.valid_len, good_len);
    }

    #[test]
    fn corrupt_payload_is_cut_by_checksum() {
        let mut bytes = image(&[(1, representation(7)), (2, representation(8))]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let outcome = scan(&bytes).unwrap();
        assert_eq!(outcome.entries.len(), 1);
        assert!(outcome.truncated_tail);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = image(&[]);
        bytes[0] = b'x';
        assert!(matches!(
            scan(&bytes),
            Err(EngineError::Corruption(_))
        ));
    }

    #[test]
    fn empty_file_scans_clean() {
        let outcome = scan(&[]).unwrap();
        assert!(outcome.entries.is_empty());
        assert_eq!(outcome.valid_len, 0);
    }
}
