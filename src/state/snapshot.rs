//! Store snapshots and their wire format
//!
//! Format: [MAGIC "STKSNAP1"][PAYLOAD_LEN u64 LE][PAYLOAD][CRC32 u32 LE]
//!
//! The payload is the bincode encoding of the entries plus the delivery
//! digest they correspond to. The checksum covers the payload only.

use crate::common::{crc32, Error, Result};
use crate::transport::rpc::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SNAPSHOT_MAGIC: &[u8; 8] = b"STKSNAP1";
const HEADER_LEN: usize = 16;
const TRAILER_LEN: usize = 4;

/// Point-in-time copy of every entry, consumed once by a joining member
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    entries: BTreeMap<String, f64>,
    digest: Digest,
}

impl StoreSnapshot {
    pub fn new(entries: BTreeMap<String, f64>, digest: Digest) -> Self {
        Self { entries, digest }
    }

    pub fn entries(&self) -> &BTreeMap<String, f64> {
        &self.entries
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_parts(self) -> (BTreeMap<String, f64>, Digest) {
        (self.entries, self.digest)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&crc32(&payload).to_le_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + TRAILER_LEN {
            return Err(Error::Corrupted(format!(
                "snapshot too short ({} bytes)",
                bytes.len()
            )));
        }
        if &bytes[..8] != SNAPSHOT_MAGIC {
            return Err(Error::Corrupted("Invalid snapshot magic".into()));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[8..HEADER_LEN]);
        let declared = u64::from_le_bytes(len_bytes);
        let available = bytes.len() - HEADER_LEN - TRAILER_LEN;
        if u64::try_from(available).ok() != Some(declared) {
            return Err(Error::Corrupted(format!(
                "snapshot length mismatch: header says {} payload bytes, got {}",
                declared, available
            )));
        }
        let payload_len = available;

        let payload = &bytes[HEADER_LEN..HEADER_LEN + payload_len];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&bytes[HEADER_LEN + payload_len..]);
        let stored = u32::from_le_bytes(crc_bytes);
        let computed = crc32(payload);
        if stored != computed {
            return Err(Error::Corrupted(format!(
                "snapshot checksum mismatch: expected {:08x}, got {:08x}",
                stored, computed
            )));
        }

        bincode::deserialize(payload)
            .map_err(|e| Error::Corrupted(format!("snapshot payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::view::MemberId;

    fn sample() -> StoreSnapshot {
        let mut entries = BTreeMap::new();
        entries.insert("AAPL".to_string(), 150.0);
        entries.insert("GOOG".to_string(), 2800.0);
        let mut digest = Digest::new();
        digest.insert(MemberId::new("A", "mem://A"), 12);
        StoreSnapshot::new(entries, digest)
    }

    #[test]
    fn test_snapshot_preserves_entries_and_digest() {
        let snapshot = sample();
        let decoded = StoreSnapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.entries().get("GOOG"), Some(&2800.0));
        assert_eq!(decoded.digest().values().copied().collect::<Vec<_>>(), vec![12]);
    }

    #[test]
    fn test_corruption_detected() {
        let bytes = sample().encode().unwrap();

        let mut flipped = bytes.clone();
        flipped[HEADER_LEN + 3] ^= 0xff;
        assert!(matches!(
            StoreSnapshot::decode(&flipped),
            Err(Error::Corrupted(msg)) if msg.contains("checksum")
        ));

        assert!(StoreSnapshot::decode(&bytes[..bytes.len() - 1]).is_err());

        let mut oversized = SNAPSHOT_MAGIC.to_vec();
        oversized.extend_from_slice(&u64::MAX.to_le_bytes());
        oversized.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            StoreSnapshot::decode(&oversized),
            Err(Error::Corrupted(msg)) if msg.contains("length mismatch")
        ));

        let mut bad_magic = bytes;
        bad_magic[0] = b'X';
        assert!(StoreSnapshot::decode(&bad_magic).is_err());
    }
}
