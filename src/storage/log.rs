//! File-backed transaction log sidecar.
//!
//! One append-only `<store>.txlog` file per store under a sidecar directory,
//! with crc-checked frames, plus a `catalog.json` naming the stores present.
//! An exclusive lock file keeps two master processes from writing the same
//! sidecar.

use super::TransactionStore;
use crate::error::{HelmError, Result};
use crate::types::{CommittedTransaction, Epoch, TxOrdinal};
use byteorder::{LittleEndian, ReadBytesExt};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

const FRAME_MAGIC: &[u8; 4] = b"HTX1";
const FRAME_HEADER_BYTES: usize = 28;
const CATALOG_FILE_NAME: &str = "catalog.json";
const SIDECAR_LOCK_FILE_NAME: &str = "master.lock";
const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LogCatalog {
  version: u32,
  stores: Vec<String>,
}

#[derive(Debug)]
pub struct SegmentLog {
  dir: PathBuf,
  tails: Mutex<HashMap<String, TxOrdinal>>,
  catalog_lock: Mutex<()>,
  _lock_file: File,
}

impl SegmentLog {
  /// Open (or create) a sidecar directory and take its exclusive writer
  /// lock. Fails if another process already holds the sidecar.
  pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    fs::create_dir_all(&dir)?;

    let lock_file = OpenOptions::new()
      .create(true)
      .read(true)
      .write(true)
      .open(dir.join(SIDECAR_LOCK_FILE_NAME))?;
    lock_file.try_lock_exclusive().map_err(|_| {
      HelmError::Internal(format!(
        "transaction log sidecar is locked by another process: {}",
        dir.display()
      ))
    })?;

    let log = Self {
      dir,
      tails: Mutex::new(HashMap::new()),
      catalog_lock: Mutex::new(()),
      _lock_file: lock_file,
    };
    log.read_catalog()?;
    Ok(log)
  }

  /// Store names recorded in the sidecar catalog.
  pub fn stores(&self) -> Result<Vec<String>> {
    Ok(self.read_catalog()?.stores)
  }

  fn catalog_path(&self) -> PathBuf {
    self.dir.join(CATALOG_FILE_NAME)
  }

  fn store_path(&self, store: &str) -> Result<PathBuf> {
    validate_store_name(store)?;
    Ok(self.dir.join(format!("{store}.txlog")))
  }

  fn read_catalog(&self) -> Result<LogCatalog> {
    let path = self.catalog_path();
    if !path.exists() {
      return Ok(LogCatalog {
        version: CATALOG_VERSION,
        stores: Vec::new(),
      });
    }

    let bytes = fs::read(&path)?;
    let catalog: LogCatalog = serde_json::from_slice(&bytes)
      .map_err(|error| HelmError::Serialization(format!("decode log catalog: {error}")))?;

    if catalog.version != CATALOG_VERSION {
      return Err(HelmError::VersionMismatch {
        required: catalog.version,
        current: CATALOG_VERSION,
      });
    }

    Ok(catalog)
  }

  fn record_store(&self, store: &str) -> Result<()> {
    let _guard = self.catalog_lock.lock();
    let mut catalog = self.read_catalog()?;
    if catalog.stores.iter().any(|name| name == store) {
      return Ok(());
    }
    catalog.stores.push(store.to_string());
    catalog.stores.sort();

    let bytes = serde_json::to_vec(&catalog)
      .map_err(|error| HelmError::Serialization(format!("encode log catalog: {error}")))?;

    let path = self.catalog_path();
    let temp_path = path.with_extension("json.tmp");
    let mut temp_file = OpenOptions::new()
      .create(true)
      .truncate(true)
      .write(true)
      .open(&temp_path)?;
    temp_file.write_all(&bytes)?;
    temp_file.sync_all()?;
    fs::rename(&temp_path, &path)?;
    sync_parent_dir(path.parent())?;
    Ok(())
  }

  fn tail(&self, store: &str) -> Result<TxOrdinal> {
    if let Some(tail) = self.tails.lock().get(store) {
      return Ok(*tail);
    }
    let tail = self
      .scan(store)?
      .last()
      .map(|frame| frame.ordinal)
      .unwrap_or(0);
    self.tails.lock().insert(store.to_string(), tail);
    Ok(tail)
  }

  fn scan(&self, store: &str) -> Result<Vec<CommittedTransaction>> {
    let path = self.store_path(store)?;
    if !path.exists() {
      return Ok(Vec::new());
    }

    let bytes = fs::read(&path)?;
    let mut frames = Vec::new();
    let mut offset = 0usize;
    let mut previous: TxOrdinal = 0;

    while offset < bytes.len() {
      if offset + FRAME_HEADER_BYTES > bytes.len() {
        return Err(HelmError::Serialization(format!(
          "truncated frame header in {store} log at byte {offset}"
        )));
      }
      if &bytes[offset..offset + 4] != FRAME_MAGIC {
        return Err(HelmError::Serialization(format!(
          "invalid frame magic in {store} log at byte {offset}"
        )));
      }

      let mut cursor = Cursor::new(&bytes[offset + 4..offset + FRAME_HEADER_BYTES]);
      let epoch = cursor.read_u64::<LittleEndian>()?;
      let ordinal = cursor.read_u64::<LittleEndian>()?;
      let payload_len = cursor.read_u32::<LittleEndian>()? as usize;
      let stored_crc = cursor.read_u32::<LittleEndian>()?;

      let payload_start = offset + FRAME_HEADER_BYTES;
      let payload_end = payload_start.checked_add(payload_len).ok_or_else(|| {
        HelmError::Serialization(format!("frame payload overflow in {store} log"))
      })?;
      if payload_end > bytes.len() {
        return Err(HelmError::Serialization(format!(
          "truncated frame payload in {store} log at byte {offset}"
        )));
      }

      let payload = &bytes[payload_start..payload_end];
      let computed = crc32fast::hash(payload);
      if computed != stored_crc {
        return Err(HelmError::CrcMismatch {
          stored: stored_crc,
          computed,
        });
      }

      if ordinal != previous + 1 {
        return Err(HelmError::Serialization(format!(
          "non-contiguous ordinal {ordinal} after {previous} in {store} log"
        )));
      }
      previous = ordinal;

      frames.push(CommittedTransaction {
        store: store.to_string(),
        ordinal,
        epoch,
        payload: payload.to_vec(),
      });
      offset = payload_end;
    }

    Ok(frames)
  }
}

impl TransactionStore for SegmentLog {
  fn append(&self, store: &str, ordinal: TxOrdinal, epoch: Epoch, payload: &[u8]) -> Result<()> {
    let path = self.store_path(store)?;
    let tail = self.tail(store)?;
    if ordinal != tail + 1 {
      return Err(HelmError::Internal(format!(
        "non-contiguous append to {store}: ordinal {ordinal}, expected {}",
        tail + 1
      )));
    }

    let payload_len = u32::try_from(payload.len())
      .map_err(|_| HelmError::Serialization(format!("frame payload too large: {}", payload.len())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(FRAME_MAGIC);
    frame.extend_from_slice(&epoch.to_le_bytes());
    frame.extend_from_slice(&ordinal.to_le_bytes());
    frame.extend_from_slice(&payload_len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);

    self.record_store(store)?;

    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    file.write_all(&frame)?;
    file.sync_all()?;

    self.tails.lock().insert(store.to_string(), ordinal);
    Ok(())
  }

  fn read_from(&self, store: &str, from: TxOrdinal) -> Result<Vec<CommittedTransaction>> {
    Ok(
      self
        .scan(store)?
        .into_iter()
        .filter(|frame| frame.ordinal >= from)
        .collect(),
    )
  }

  fn head(&self, store: &str) -> Result<Option<TxOrdinal>> {
    let tail = self.tail(store)?;
    Ok(if tail == 0 { None } else { Some(tail) })
  }
}

fn validate_store_name(store: &str) -> Result<()> {
  let valid = !store.is_empty()
    && store
      .bytes()
      .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b'_'));
  if !valid {
    return Err(HelmError::Internal(format!("invalid store name: {store}")));
  }
  Ok(())
}

fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    if let Some(parent) = parent {
      File::open(parent)?.sync_all()?;
    }
  }

  #[cfg(not(unix))]
  {
    let _ = parent;
  }

  Ok(())
}
