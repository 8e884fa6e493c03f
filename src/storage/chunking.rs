//! Chunked value support: manifests, chunk keys, and the adapter that hides
//! chunk boundaries from the ingest loop.
//!
//! A value larger than the wire size limit is split by the producer into N
//! chunks plus a manifest. The manifest is stored under the logical key with
//! the reserved schema id [`MANIFEST_SCHEMA_ID`]; each chunk is stored under
//! a derived key with the reserved schema id [`CHUNK_SCHEMA_ID`]. RMD can be
//! chunked by the same mechanism, in the RMD column.
//!
//! Stored records carry a 4-byte big-endian schema-id header, which is how a
//! manifest is told apart from a plain value on read.
//!
//! # Key derivation
//!
//! `chunk_key(k, i) = k ++ 0x00 ++ i (u32 big-endian)`. Derivation is
//! deterministic so replays regenerate the same chunk keys.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::constants::{CHUNK_SCHEMA_ID, MANIFEST_SCHEMA_ID, SCHEMA_ID_HEADER_LEN};
use crate::error::{IngestionError, IngestionResult};
use crate::types::RecordKey;

use super::StorageEngine;

/// Manifest describing a chunked value (or chunked RMD).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedValueManifest {
    /// Schema id of the reassembled payload.
    pub schema_id: i32,
    pub chunk_keys: Vec<Bytes>,
    pub total_size: u32,
    /// CRC32 of the reassembled payload.
    pub checksum: u32,
}

impl ChunkedValueManifest {
    /// Serialize; all integers big-endian.
    pub fn encode(&self) -> Bytes {
        let keys_len: usize = self.chunk_keys.iter().map(|k| 4 + k.len()).sum();
        let mut buf = BytesMut::with_capacity(4 + 4 + keys_len + 8);
        buf.put_i32(self.schema_id);
        buf.put_u32(self.chunk_keys.len() as u32);
        for key in &self.chunk_keys {
            buf.put_u32(key.len() as u32);
            buf.put_slice(key);
        }
        buf.put_u32(self.total_size);
        buf.put_u32(self.checksum);
        buf.freeze()
    }

    pub fn decode(partition: u32, mut buf: &[u8]) -> IngestionResult<Self> {
        let corrupt = |message: String| IngestionError::ChunkCorrupt { partition, message };
        if buf.remaining() < 8 {
            return Err(corrupt("manifest header truncated".into()));
        }
        let schema_id = buf.get_i32();
        let chunk_count = buf.get_u32() as usize;
        let mut chunk_keys = Vec::with_capacity(chunk_count);
        for i in 0..chunk_count {
            if buf.remaining() < 4 {
                return Err(corrupt(format!("manifest truncated at chunk key {i}")));
            }
            let key_len = buf.get_u32() as usize;
            if buf.remaining() < key_len {
                return Err(corrupt(format!("manifest truncated inside chunk key {i}")));
            }
            chunk_keys.push(Bytes::copy_from_slice(&buf[..key_len]));
            buf.advance(key_len);
        }
        if buf.remaining() < 8 {
            return Err(corrupt("manifest trailer truncated".into()));
        }
        let total_size = buf.get_u32();
        let checksum = buf.get_u32();
        Ok(ChunkedValueManifest {
            schema_id,
            chunk_keys,
            total_size,
            checksum,
        })
    }
}

/// Derive the storage key of chunk `index` of `key`.
pub fn chunk_key(key: &RecordKey, index: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + 1 + 4);
    buf.put_slice(key.as_bytes());
    buf.put_u8(0);
    buf.put_u32(index);
    buf.freeze()
}

/// Split a payload into chunks of at most `chunk_size` bytes and build its
/// manifest. Performed by the producing layer; the adapter only stores the
/// pieces it is handed.
pub fn split_into_chunks(
    key: &RecordKey,
    schema_id: i32,
    payload: &[u8],
    chunk_size: usize,
) -> (Vec<(Bytes, Bytes)>, ChunkedValueManifest) {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    for (index, piece) in payload.chunks(chunk_size).enumerate() {
        chunks.push((
            chunk_key(key, index as u32),
            Bytes::copy_from_slice(piece),
        ));
    }
    let manifest = ChunkedValueManifest {
        schema_id,
        chunk_keys: chunks.iter().map(|(k, _)| k.clone()).collect(),
        total_size: payload.len() as u32,
        checksum: crc32fast::hash(payload),
    };
    (chunks, manifest)
}

/// Prefix a payload with its 4-byte big-endian schema id, as stored on disk.
pub fn prepend_schema_id(schema_id: i32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SCHEMA_ID_HEADER_LEN + payload.len());
    buf.put_i32(schema_id);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a stored record into its schema id and payload.
pub fn parse_schema_id_prefixed(partition: u32, stored: &Bytes) -> IngestionResult<(i32, Bytes)> {
    if stored.len() < SCHEMA_ID_HEADER_LEN {
        return Err(IngestionError::ChunkCorrupt {
            partition,
            message: format!("stored record shorter than schema header: {}", stored.len()),
        });
    }
    let mut header = [0u8; SCHEMA_ID_HEADER_LEN];
    header.copy_from_slice(&stored[..SCHEMA_ID_HEADER_LEN]);
    Ok((i32::from_be_bytes(header), stored.slice(SCHEMA_ID_HEADER_LEN..)))
}

/// A reassembled value read through the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRecord {
    pub value: Bytes,
    pub schema_id: i32,
    /// Present when the stored record was a manifest.
    pub manifest: Option<ChunkedValueManifest>,
}

/// A reassembled schema-id-prefixed RMD record read through the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmdRecord {
    /// Full RMD bytes including the value-schema-id header.
    pub prefixed_bytes: Bytes,
    pub manifest: Option<ChunkedValueManifest>,
}

/// Read/write facade over the storage engine that reassembles chunked
/// records and prefixes schema-id headers on the way down.
#[derive(Clone)]
pub struct ChunkingAdapter {
    storage: Arc<dyn StorageEngine>,
}

impl ChunkingAdapter {
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        ChunkingAdapter { storage }
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Fetch the value under `key`, reassembling if it is chunked.
    pub fn get_value(&self, partition: u32, key: &RecordKey) -> IngestionResult<Option<ValueRecord>> {
        let Some(stored) = self.storage.get(partition, key.as_bytes())? else {
            return Ok(None);
        };
        let (schema_id, payload) = parse_schema_id_prefixed(partition, &stored)?;
        if schema_id != MANIFEST_SCHEMA_ID {
            return Ok(Some(ValueRecord {
                value: payload,
                schema_id,
                manifest: None,
            }));
        }
        let manifest = ChunkedValueManifest::decode(partition, &payload)?;
        let value = self.reassemble(partition, &manifest, ChunkColumn::Value)?;
        Ok(Some(ValueRecord {
            value,
            schema_id: manifest.schema_id,
            manifest: Some(manifest),
        }))
    }

    /// Fetch the schema-id-prefixed RMD under `key`, reassembling if chunked.
    pub fn get_rmd(&self, partition: u32, key: &RecordKey) -> IngestionResult<Option<RmdRecord>> {
        let Some(stored) = self.storage.get_rmd(partition, key.as_bytes())? else {
            return Ok(None);
        };
        let (schema_id, payload) = parse_schema_id_prefixed(partition, &stored)?;
        if schema_id != MANIFEST_SCHEMA_ID {
            return Ok(Some(RmdRecord {
                prefixed_bytes: stored,
                manifest: None,
            }));
        }
        let manifest = ChunkedValueManifest::decode(partition, &payload)?;
        let prefixed = self.reassemble(partition, &manifest, ChunkColumn::Rmd)?;
        Ok(Some(RmdRecord {
            prefixed_bytes: prefixed,
            manifest: Some(manifest),
        }))
    }

    /// Store a value and its prefixed RMD together under the logical key.
    pub fn put_value_and_rmd(
        &self,
        partition: u32,
        key: &RecordKey,
        schema_id: i32,
        value: &[u8],
        rmd_prefixed: &[u8],
    ) -> IngestionResult<()> {
        let stored = prepend_schema_id(schema_id, value);
        self.storage
            .put_with_rmd(partition, key.as_bytes(), &stored, rmd_prefixed)
    }

    /// Store only the value column (batch records and chunk sub-records
    /// carry no RMD).
    pub fn put_value_only(
        &self,
        partition: u32,
        key: &RecordKey,
        schema_id: i32,
        value: &[u8],
    ) -> IngestionResult<()> {
        let stored = prepend_schema_id(schema_id, value);
        self.storage.put(partition, key.as_bytes(), &stored)
    }

    /// Store only the RMD column (chunked-RMD sub-records).
    pub fn put_rmd_only(
        &self,
        partition: u32,
        key: &RecordKey,
        rmd_prefixed: &[u8],
    ) -> IngestionResult<()> {
        self.storage.put_rmd(partition, key.as_bytes(), rmd_prefixed)
    }

    /// Store one value chunk under its derived key.
    pub fn put_chunk(&self, partition: u32, chunk_key: &[u8], payload: &[u8]) -> IngestionResult<()> {
        let stored = prepend_schema_id(CHUNK_SCHEMA_ID, payload);
        self.storage.put(partition, chunk_key, &stored)
    }

    /// Store one RMD chunk under its derived key.
    pub fn put_rmd_chunk(
        &self,
        partition: u32,
        chunk_key: &[u8],
        payload: &[u8],
    ) -> IngestionResult<()> {
        let stored = prepend_schema_id(CHUNK_SCHEMA_ID, payload);
        self.storage.put_rmd(partition, chunk_key, &stored)
    }

    /// Delete the logical key, any chunks its value or RMD manifests
    /// reference, and persist the tombstone RMD when one is given.
    pub fn delete(
        &self,
        partition: u32,
        key: &RecordKey,
        rmd_prefixed: Option<&[u8]>,
    ) -> IngestionResult<()> {
        if let Some(record) = self.get_value(partition, key)? {
            if let Some(manifest) = record.manifest {
                self.delete_chunks(partition, &manifest)?;
            }
        }
        if let Some(rmd) = self.get_rmd(partition, key)? {
            if let Some(manifest) = rmd.manifest {
                self.delete_chunks(partition, &manifest)?;
            }
        }
        match rmd_prefixed {
            Some(rmd) => self.storage.delete_with_rmd(partition, key.as_bytes(), rmd),
            None => self.storage.delete(partition, key.as_bytes()),
        }
    }

    fn delete_chunks(&self, partition: u32, manifest: &ChunkedValueManifest) -> IngestionResult<()> {
        for chunk_key in &manifest.chunk_keys {
            self.storage.delete(partition, chunk_key)?;
        }
        Ok(())
    }

    fn reassemble(
        &self,
        partition: u32,
        manifest: &ChunkedValueManifest,
        column: ChunkColumn,
    ) -> IngestionResult<Bytes> {
        let chunk_count = manifest.chunk_keys.len();
        let mut assembled = BytesMut::with_capacity(manifest.total_size as usize);
        for (chunk_index, chunk_key) in manifest.chunk_keys.iter().enumerate() {
            let stored = match column {
                ChunkColumn::Value => self.storage.get(partition, chunk_key)?,
                ChunkColumn::Rmd => self.storage.get_rmd(partition, chunk_key)?,
            };
            let Some(stored) = stored else {
                return Err(IngestionError::ChunkMissing {
                    partition,
                    chunk_index,
                    chunk_count,
                });
            };
            let (schema_id, payload) = parse_schema_id_prefixed(partition, &stored)?;
            if schema_id != CHUNK_SCHEMA_ID {
                return Err(IngestionError::ChunkCorrupt {
                    partition,
                    message: format!("chunk {chunk_index} has schema id {schema_id}"),
                });
            }
            assembled.put_slice(&payload);
        }
        if assembled.len() != manifest.total_size as usize {
            return Err(IngestionError::ChunkCorrupt {
                partition,
                message: format!(
                    "reassembled {} bytes, manifest says {}",
                    assembled.len(),
                    manifest.total_size
                ),
            });
        }
        let assembled = assembled.freeze();
        let checksum = crc32fast::hash(&assembled);
        if checksum != manifest.checksum {
            return Err(IngestionError::ChunkCorrupt {
                partition,
                message: format!(
                    "checksum mismatch: computed {checksum:#010x}, manifest {:#010x}",
                    manifest.checksum
                ),
            });
        }
        Ok(assembled)
    }
}

#[derive(Clone, Copy)]
enum ChunkColumn {
    Value,
    Rmd,
}
