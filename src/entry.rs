//! Log entry codec.
//!
//! Entries are serialized with `bincode`, which is length-deterministic: a truncated or
//! corrupted buffer fails to decode, and that failure is exactly the torn-frame signal the
//! recovery path relies on. The checksum binds the payload to the low byte of the LSN so two
//! identical payloads at different sequence numbers carry different checksums.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum Error {
    Encode(bincode::Error),
    Decode(bincode::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "entry encode failed: {e}"),
            Self::Decode(e) => write!(f, "entry decode failed: {e}"),
        }
    }
}

impl std::error::Error for Error {}

/// A single entry in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Sequence number assigned by the log; monotonically increasing across the
    /// lifetime of the log directory.
    pub lsn: u64,

    /// Caller-supplied bytes. Opaque to the log.
    pub payload: Vec<u8>,

    /// CRC-32 (IEEE) over the payload followed by the LSN's low byte.
    pub crc: u32,

    /// Set for every entry whose LSN is a multiple of the checkpoint frequency.
    /// The log treats checkpoint entries like any other; the flag is a recovery
    /// anchor for higher layers.
    pub is_checkpoint: bool,
}

/// The on-disk checksum rule. The LSN's low byte is appended to the payload
/// before hashing; readers across versions must reproduce this bit-for-bit.
pub(crate) fn checksum(payload: &[u8], lsn: u64) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.update(&[lsn as u8]);
    hasher.finalize()
}

impl Entry {
    pub(crate) fn new(lsn: u64, payload: Vec<u8>, is_checkpoint: bool) -> Self {
        let crc = checksum(&payload, lsn);
        Self { lsn, payload, crc, is_checkpoint }
    }

    /// Serializes the entry. Framing (the length prefix) is the log's concern,
    /// not the codec's.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        bincode::serialize(self).map_err(Error::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        bincode::deserialize(bytes).map_err(Error::Decode)
    }

    /// Recomputes the checksum and compares it with the stored one.
    #[must_use]
    pub fn verify_crc(&self) -> bool {
        self.crc == checksum(&self.payload, self.lsn)
    }
}
