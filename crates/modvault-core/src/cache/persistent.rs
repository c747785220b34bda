//! Disk-backed key/value cache with pluggable codecs.
//!
//! Each cache is an append-only journal: a magic header followed by
//! `(key blob, value blob)` records. The journal is replayed into memory the
//! first time the cache is touched; the last record for a key wins.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use modvault_schema::{Codec, CodecError, Decoder, Encoder};

use super::{CacheAccess, CacheError};

const MAGIC: &[u8; 4] = b"MVJ1";

/// One journal, keyed by the encoded key bytes.
pub struct PersistentIndexedCache<K, V> {
    name: String,
    access: Arc<CacheAccess>,
    key_codec: Box<dyn Codec<K>>,
    value_codec: Box<dyn Codec<V>>,
    journal: Mutex<Option<Journal>>,
}

impl<K, V> PersistentIndexedCache<K, V> {
    /// Bind to `<dir>/<name>.bin`. Nothing is read until first use.
    pub fn new(
        access: Arc<CacheAccess>,
        name: impl Into<String>,
        key_codec: impl Codec<K> + 'static,
        value_codec: impl Codec<V> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            access,
            key_codec: Box::new(key_codec),
            value_codec: Box::new(value_codec),
            journal: Mutex::new(None),
        }
    }

    /// Journal file.
    pub fn path(&self) -> PathBuf {
        self.access.dir().join(format!("{}.bin", self.name))
    }

    /// Look up `key`.
    ///
    /// # Errors
    ///
    /// Fails if the journal cannot be opened or a stored value cannot be
    /// decoded; both mean the cache directory is broken.
    pub fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        let key = self.key_codec.to_bytes(key)?;
        self.with_journal(|journal| {
            journal
                .index
                .get(&key)
                .map(|bytes| self.value_codec.from_bytes(bytes))
                .transpose()
                .map_err(CacheError::from)
        })
    }

    /// Store `value` under `key`, superseding any earlier value.
    ///
    /// # Errors
    ///
    /// Fails on encoding or I/O errors.
    pub fn put(&self, key: &K, value: &V) -> Result<(), CacheError> {
        let key = self.key_codec.to_bytes(key)?;
        let value = self.value_codec.to_bytes(value)?;
        self.with_journal(|journal| journal.append(key, value))
    }

    /// Number of live keys.
    ///
    /// # Errors
    ///
    /// Fails if the journal cannot be opened.
    pub fn len(&self) -> Result<usize, CacheError> {
        self.with_journal(|journal| Ok(journal.index.len()))
    }

    /// Compact the journal if it is mostly superseded records, then close it.
    ///
    /// # Errors
    ///
    /// Fails if the compacted journal cannot be written.
    pub fn close(&self) -> Result<(), CacheError> {
        self.access.with_lock(|| {
            let mut guard = self.journal.lock().map_err(|_| CacheError::Poisoned)?;
            if let Some(mut journal) = guard.take() {
                journal.compact_if_needed()?;
            }
            Ok(())
        })
    }

    fn with_journal<T>(
        &self,
        f: impl FnOnce(&mut Journal) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        self.access.with_lock(|| {
            let mut guard = self.journal.lock().map_err(|_| CacheError::Poisoned)?;
            let journal = match guard.take() {
                Some(journal) => journal,
                None => Journal::open(self.path())?,
            };
            f(guard.insert(journal))
        })
    }
}

impl<K, V> std::fmt::Debug for PersistentIndexedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentIndexedCache")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct Journal {
    path: PathBuf,
    file: File,
    index: HashMap<Vec<u8>, Vec<u8>>,
    records: usize,
}

impl Journal {
    fn open(path: PathBuf) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| CacheError::io(&path, e))?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| CacheError::io(&path, e))?;

        let mut journal = Self {
            path,
            file,
            index: HashMap::new(),
            records: 0,
        };
        if contents.is_empty() {
            journal
                .file
                .write_all(MAGIC)
                .map_err(|e| CacheError::io(&journal.path, e))?;
        } else {
            journal.replay(&contents)?;
        }
        tracing::debug!(
            "Opened cache journal {} ({} keys, {} records)",
            journal.path.display(),
            journal.index.len(),
            journal.records
        );
        Ok(journal)
    }

    fn replay(&mut self, contents: &[u8]) -> Result<(), CacheError> {
        let Some(body) = contents.strip_prefix(MAGIC.as_slice()) else {
            return Err(self.corrupt("bad header"));
        };
        let mut decoder = Decoder::new(body);
        while decoder.remaining() > 0 {
            let record = read_record(&mut decoder);
            let (key, value) = record.map_err(|e| self.corrupt(&format!("record {}: {e}", self.records)))?;
            self.index.insert(key, value);
            self.records += 1;
        }
        Ok(())
    }

    fn append(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), CacheError> {
        if self.index.get(&key) == Some(&value) {
            return Ok(());
        }
        let mut encoder = Encoder::new();
        encoder.write_binary(&key);
        encoder.write_binary(&value);
        self.file
            .write_all(&encoder.into_bytes())
            .map_err(|e| CacheError::io(&self.path, e))?;
        self.index.insert(key, value);
        self.records += 1;
        Ok(())
    }

    fn compact_if_needed(&mut self) -> Result<(), CacheError> {
        let live = self.index.len();
        if self.records - live <= live {
            return Ok(());
        }
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;

        let mut entries: Vec<_> = self.index.iter().collect();
        entries.sort();
        let mut encoder = Encoder::new();
        for (key, value) in entries {
            encoder.write_binary(key);
            encoder.write_binary(value);
        }
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&encoder.into_bytes());
        tmp.write_all(&bytes)
            .map_err(|e| CacheError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| CacheError::io(&self.path, e.error))?;

        tracing::debug!(
            "Compacted cache journal {} from {} to {live} records",
            self.path.display(),
            self.records
        );
        self.records = live;
        Ok(())
    }

    fn corrupt(&self, reason: &str) -> CacheError {
        CacheError::Corrupt {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

fn read_record(decoder: &mut Decoder<'_>) -> Result<(Vec<u8>, Vec<u8>), CodecError> {
    Ok((decoder.read_binary()?, decoder.read_binary()?))
}
