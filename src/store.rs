//! Durable key-value store on top of the write-ahead log.
//!
//! The in-memory map is the read path; the log is the only durability mechanism. Every mutation
//! is logged before it is applied, so a failed append leaves the map untouched. Recovered state
//! is whatever replaying every entry still on disk produces: retention may have dropped a
//! whole-segment prefix, and with it the state it described.

use std::collections::HashMap;
use std::fmt;
use std::sync::{self, RwLock};

use serde::{Deserialize, Serialize};

use crate::map_err;
use crate::wal::{self, Config, Wal};

#[derive(Debug)]
pub enum Error {
    /// The underlying log rejected an operation.
    Wal(wal::Error),
    /// A key-value record could not be encoded or decoded.
    Codec(bincode::Error),
}

map_err!(Wal, wal::Error);
map_err!(Codec, bincode::Error);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wal(e) => write!(f, "wal: {e}"),
            Self::Codec(e) => write!(f, "record codec: {e}"),
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum Op {
    Set,
    Delete,
}

/// The logged form of one mutation. Deletes carry an empty value.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    op: Op,
    key: String,
    value: Vec<u8>,
}

/// A single-writer key-value store whose sole durability mechanism is the
/// write-ahead log it owns.
///
/// Writers serialize on the write half of an internal lease; readers share
/// the other half and never block each other. The lease is never held across
/// log I/O beyond the one append a mutation needs.
///
/// # Examples
///
/// ```no_run
/// use narwal::{Config, Store};
///
/// let store = Store::open(Config::default()).unwrap();
/// store.put("name", b"walrus").unwrap();
/// store.sync().unwrap();
///
/// assert_eq!(store.get("name").as_deref(), Some(&b"walrus"[..]));
/// ```
pub struct Store {
    wal: Wal,
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl Store {
    /// Opens the log at `config.directory` and seeds the map by replaying
    /// every entry still on disk in LSN order: sets overwrite, deletes
    /// remove.
    pub fn open(config: Config) -> Result<Self, Error> {
        let wal = Wal::open(config)?;

        let entries = wal.replay()?;
        let replayed = entries.len();

        let mut map = HashMap::new();
        for entry in entries {
            let record: Record = bincode::deserialize(&entry.payload)?;
            match record.op {
                Op::Set => {
                    map.insert(record.key, record.value);
                }
                Op::Delete => {
                    map.remove(&record.key);
                }
            }
        }

        log::info!("store opened: {replayed} entries replayed, {} keys live", map.len());

        Ok(Self { wal, map: RwLock::new(map) })
    }

    /// Sets `key` to `value`. The mutation is logged first; the map changes
    /// only after the log accepted the record.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut map = self.map.write().unwrap_or_else(sync::PoisonError::into_inner);

        let payload = encode_record(Op::Set, key, value)?;
        self.wal.append(&payload)?;

        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Removes `key`. Removing an absent key still logs a delete record.
    pub fn delete(&self, key: &str) -> Result<(), Error> {
        let mut map = self.map.write().unwrap_or_else(sync::PoisonError::into_inner);

        let payload = encode_record(Op::Delete, key, &[])?;
        self.wal.append(&payload)?;

        map.remove(key);
        Ok(())
    }

    /// Looks up `key`. A miss is `None`, not a failure.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let map = self.map.read().unwrap_or_else(sync::PoisonError::into_inner);
        map.get(key).cloned()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let map = self.map.read().unwrap_or_else(sync::PoisonError::into_inner);
        map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every acknowledged mutation durable.
    pub fn sync(&self) -> Result<(), Error> {
        self.wal.sync()?;
        Ok(())
    }

    /// Closes the underlying log. Later mutations fail; reads keep serving
    /// from the in-memory map.
    pub fn close(&self) -> Result<(), Error> {
        self.wal.close()?;
        Ok(())
    }

    /// Counter snapshot of the underlying log.
    pub fn wal_stats(&self) -> Result<wal::WalStats, Error> {
        Ok(self.wal.stats()?)
    }
}

fn encode_record(op: Op, key: &str, value: &[u8]) -> Result<Vec<u8>, Error> {
    let record = Record { op, key: key.to_string(), value: value.to_vec() };
    bincode::serialize(&record).map_err(Error::Codec)
}
