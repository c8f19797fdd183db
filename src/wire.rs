//! Transport-agnostic framing for coordinator calls and replies.
//!
//! The coordinator is agnostic to the transport carrying it; this module
//! fixes the byte layout every transport shares: a request header of
//! (operation tag, session context) followed by operation-specific
//! arguments, and the crc-checked update frames piggybacked on replies.

use crate::error::{HelmError, Result};
use crate::types::{CommittedTransaction, SessionContext, TxOrdinal};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

const REQUEST_MAGIC: &[u8; 4] = b"HLM1";
const UPDATE_BATCH_MAGIC: &[u8; 4] = b"HLU1";

/// Operation tags for the externally observable master calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpTag {
  AllocateIds = 1,
  CreateRelationshipType = 2,
  AcquireNodeWriteLock = 3,
  AcquireNodeReadLock = 4,
  AcquireRelationshipWriteLock = 5,
  AcquireRelationshipReadLock = 6,
  Commit = 7,
  Finish = 8,
  PullUpdates = 9,
  MasterOrdinalLookup = 10,
}

impl OpTag {
  pub const fn code(self) -> u8 {
    self as u8
  }

  pub const fn from_code(code: u8) -> Option<OpTag> {
    match code {
      1 => Some(OpTag::AllocateIds),
      2 => Some(OpTag::CreateRelationshipType),
      3 => Some(OpTag::AcquireNodeWriteLock),
      4 => Some(OpTag::AcquireNodeReadLock),
      5 => Some(OpTag::AcquireRelationshipWriteLock),
      6 => Some(OpTag::AcquireRelationshipReadLock),
      7 => Some(OpTag::Commit),
      8 => Some(OpTag::Finish),
      9 => Some(OpTag::PullUpdates),
      10 => Some(OpTag::MasterOrdinalLookup),
      _ => None,
    }
  }
}

/// Encode the header every call starts with: magic, operation tag, session
/// id, then the caller's per-store watermark entries. Operation arguments
/// follow the header.
pub fn encode_request_header(tag: OpTag, ctx: &SessionContext) -> Result<Vec<u8>> {
  let entry_count = u16::try_from(ctx.last_applied.len()).map_err(|_| {
    HelmError::Serialization(format!(
      "too many watermark entries: {}",
      ctx.last_applied.len()
    ))
  })?;

  let mut bytes = Vec::with_capacity(16);
  bytes.extend_from_slice(REQUEST_MAGIC);
  bytes.push(tag.code());
  bytes.extend_from_slice(&ctx.session_id.to_le_bytes());
  bytes.extend_from_slice(&entry_count.to_le_bytes());

  for (store, ordinal) in &ctx.last_applied {
    let name = store.as_bytes();
    let name_len = u16::try_from(name.len())
      .map_err(|_| HelmError::Serialization(format!("store name too long: {store}")))?;
    bytes.extend_from_slice(&name_len.to_le_bytes());
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(&ordinal.to_le_bytes());
  }

  Ok(bytes)
}

/// Decode a request header. Returns the tag, the reconstructed context, and
/// the number of bytes consumed (arguments start there).
pub fn decode_request_header(bytes: &[u8]) -> Result<(OpTag, SessionContext, usize)> {
  if bytes.len() < 4 || &bytes[..4] != REQUEST_MAGIC {
    return Err(HelmError::Serialization(
      "request header has invalid magic".to_string(),
    ));
  }

  let mut cursor = Cursor::new(&bytes[4..]);
  let tag_code = cursor.read_u8()?;
  let tag = OpTag::from_code(tag_code)
    .ok_or_else(|| HelmError::Serialization(format!("unknown operation tag: {tag_code}")))?;
  let session_id = cursor.read_u64::<LittleEndian>()?;
  let entry_count = cursor.read_u16::<LittleEndian>()?;

  let mut last_applied = Vec::with_capacity(entry_count as usize);
  for _ in 0..entry_count {
    let name_len = cursor.read_u16::<LittleEndian>()? as usize;
    let mut name = vec![0u8; name_len];
    cursor
      .read_exact(&mut name)
      .map_err(|_| HelmError::Serialization("request header truncated".to_string()))?;
    let store = String::from_utf8(name)
      .map_err(|_| HelmError::Serialization("store name is not utf-8".to_string()))?;
    let ordinal = cursor.read_u64::<LittleEndian>()?;
    last_applied.push((store, ordinal));
  }

  let consumed = 4 + cursor.position() as usize;
  Ok((
    tag,
    SessionContext {
      session_id,
      last_applied,
    },
    consumed,
  ))
}

/// Encode a reply's piggybacked update stream: batch magic and count, then
/// one crc-checked frame per committed transaction, in delivery order.
pub fn encode_update_batch(updates: &[CommittedTransaction]) -> Result<Vec<u8>> {
  let count = u32::try_from(updates.len())
    .map_err(|_| HelmError::Serialization(format!("update batch too large: {}", updates.len())))?;

  let mut bytes = Vec::new();
  bytes.extend_from_slice(UPDATE_BATCH_MAGIC);
  bytes.extend_from_slice(&count.to_le_bytes());

  for update in updates {
    let name = update.store.as_bytes();
    let name_len = u16::try_from(name.len())
      .map_err(|_| HelmError::Serialization(format!("store name too long: {}", update.store)))?;
    let payload_len = u32::try_from(update.payload.len()).map_err(|_| {
      HelmError::Serialization(format!("update payload too large: {}", update.payload.len()))
    })?;

    bytes.extend_from_slice(&update.ordinal.to_le_bytes());
    bytes.extend_from_slice(&update.epoch.to_le_bytes());
    bytes.extend_from_slice(&name_len.to_le_bytes());
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(&payload_len.to_le_bytes());
    bytes.extend_from_slice(&crc32fast::hash(&update.payload).to_le_bytes());
    bytes.extend_from_slice(&update.payload);
  }

  Ok(bytes)
}

/// Decode an update batch, verifying per-frame checksums and rejecting
/// trailing bytes.
pub fn decode_update_batch(bytes: &[u8]) -> Result<Vec<CommittedTransaction>> {
  if bytes.len() < 8 || &bytes[..4] != UPDATE_BATCH_MAGIC {
    return Err(HelmError::Serialization(
      "update batch has invalid magic".to_string(),
    ));
  }

  let mut cursor = Cursor::new(&bytes[4..]);
  let count = cursor.read_u32::<LittleEndian>()?;

  let mut updates = Vec::with_capacity(count as usize);
  for _ in 0..count {
    let ordinal: TxOrdinal = cursor.read_u64::<LittleEndian>()?;
    let epoch = cursor.read_u64::<LittleEndian>()?;
    let name_len = cursor.read_u16::<LittleEndian>()? as usize;

    let mut name = vec![0u8; name_len];
    cursor
      .read_exact(&mut name)
      .map_err(|_| HelmError::Serialization("update batch truncated".to_string()))?;
    let store = String::from_utf8(name)
      .map_err(|_| HelmError::Serialization("store name is not utf-8".to_string()))?;

    let payload_len = cursor.read_u32::<LittleEndian>()? as usize;
    let stored_crc = cursor.read_u32::<LittleEndian>()?;
    let mut payload = vec![0u8; payload_len];
    cursor
      .read_exact(&mut payload)
      .map_err(|_| HelmError::Serialization("update batch truncated".to_string()))?;

    let computed = crc32fast::hash(&payload);
    if computed != stored_crc {
      return Err(HelmError::CrcMismatch {
        stored: stored_crc,
        computed,
      });
    }

    updates.push(CommittedTransaction {
      store,
      ordinal,
      epoch,
      payload,
    });
  }

  if cursor.position() as usize != bytes.len() - 4 {
    return Err(HelmError::Serialization(
      "update batch contains unexpected trailing bytes".to_string(),
    ));
  }

  Ok(updates)
}
