//! Binary codec for replication metadata.
//!
//! On-disk and on-wire layout, all integers big-endian:
//!
//! ```text
//! [i32 value_schema_id]
//! [u8  layout tag: 0 = record-level, 1 = field-level]
//! record-level: [u64 timestamp]
//! field-level:  [u16 field_count][u64 * field_count]
//! [u16 region_count][u64 * region_count]
//! ```
//!
//! The value-schema id selects the RMD layout through the schema registry;
//! the codec verifies the payload against that layout on both encode and
//! decode, so a corrupted tag or a registry/payload mismatch surfaces as
//! [`IngestionError::MalformedRmd`] rather than silently misreading offsets.
//! The codec never inspects chunk boundaries; chunked RMD is reassembled by
//! the chunking adapter before it gets here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{IngestionError, IngestionResult};
use crate::schema::{RmdLayout, SchemaCache};

use super::{ReplicationMetadata, RmdTimestamp, RmdWithSchemaId};

const TAG_RECORD_LEVEL: u8 = 0;
const TAG_FIELD_LEVEL: u8 = 1;

/// Encoder/decoder for value-schema-id-prefixed RMD bytes.
#[derive(Debug, Clone)]
pub struct RmdSerde {
    schemas: SchemaCache,
    rmd_protocol_version: i32,
}

impl RmdSerde {
    pub fn new(schemas: SchemaCache, rmd_protocol_version: i32) -> Self {
        RmdSerde {
            schemas,
            rmd_protocol_version,
        }
    }

    pub fn rmd_protocol_version(&self) -> i32 {
        self.rmd_protocol_version
    }

    /// Serialize `rmd` prefixed with its value schema id.
    pub fn encode(&self, value_schema_id: i32, rmd: &ReplicationMetadata) -> IngestionResult<Bytes> {
        self.check_layout(value_schema_id, &rmd.timestamp)?;
        let mut buf = BytesMut::with_capacity(encoded_len(rmd));
        buf.put_i32(value_schema_id);
        match &rmd.timestamp {
            RmdTimestamp::Record(ts) => {
                buf.put_u8(TAG_RECORD_LEVEL);
                buf.put_u64(*ts);
            }
            RmdTimestamp::PerField(fields) => {
                buf.put_u8(TAG_FIELD_LEVEL);
                buf.put_u16(fields.len() as u16);
                for ts in fields {
                    buf.put_u64(*ts);
                }
            }
        }
        buf.put_u16(rmd.offset_vector.len() as u16);
        for offset in &rmd.offset_vector {
            buf.put_u64(*offset);
        }
        Ok(buf.freeze())
    }

    /// Parse value-schema-id-prefixed RMD bytes.
    pub fn decode(&self, bytes: &[u8]) -> IngestionResult<RmdWithSchemaId> {
        let mut buf = bytes;
        let value_schema_id = read_i32(&mut buf, "value schema id")?;
        let tag = read_u8(&mut buf, "layout tag")?;
        let timestamp = match tag {
            TAG_RECORD_LEVEL => RmdTimestamp::Record(read_u64(&mut buf, "timestamp")?),
            TAG_FIELD_LEVEL => {
                let field_count = read_u16(&mut buf, "field count")? as usize;
                let mut fields = Vec::with_capacity(field_count);
                for _ in 0..field_count {
                    fields.push(read_u64(&mut buf, "field timestamp")?);
                }
                RmdTimestamp::PerField(fields)
            }
            other => {
                return Err(IngestionError::MalformedRmd(format!(
                    "unknown layout tag {other}"
                )))
            }
        };
        let region_count = read_u16(&mut buf, "region count")? as usize;
        let mut offset_vector = Vec::with_capacity(region_count);
        for _ in 0..region_count {
            offset_vector.push(read_u64(&mut buf, "region offset")?);
        }
        if !buf.is_empty() {
            return Err(IngestionError::MalformedRmd(format!(
                "{} trailing bytes",
                buf.len()
            )));
        }
        self.check_layout(value_schema_id, &timestamp)?;
        Ok(RmdWithSchemaId {
            value_schema_id,
            rmd: ReplicationMetadata {
                timestamp,
                offset_vector,
            },
        })
    }

    fn check_layout(&self, value_schema_id: i32, timestamp: &RmdTimestamp) -> IngestionResult<()> {
        let layout = self.schemas.rmd_layout(value_schema_id)?;
        match (layout, timestamp) {
            (RmdLayout::RecordLevel, RmdTimestamp::Record(_)) => Ok(()),
            (RmdLayout::FieldLevel { field_count }, RmdTimestamp::PerField(fields))
                if fields.len() == field_count =>
            {
                Ok(())
            }
            (expected, _) => Err(IngestionError::MalformedRmd(format!(
                "payload does not match layout {expected:?} of value schema {value_schema_id}"
            ))),
        }
    }
}

fn encoded_len(rmd: &ReplicationMetadata) -> usize {
    let ts_len = match &rmd.timestamp {
        RmdTimestamp::Record(_) => 8,
        RmdTimestamp::PerField(fields) => 2 + fields.len() * 8,
    };
    4 + 1 + ts_len + 2 + rmd.offset_vector.len() * 8
}

fn read_u8(buf: &mut &[u8], what: &str) -> IngestionResult<u8> {
    if buf.remaining() < 1 {
        return Err(truncated(what));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut &[u8], what: &str) -> IngestionResult<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(what));
    }
    Ok(buf.get_u16())
}

fn read_i32(buf: &mut &[u8], what: &str) -> IngestionResult<i32> {
    if buf.remaining() < 4 {
        return Err(truncated(what));
    }
    Ok(buf.get_i32())
}

fn read_u64(buf: &mut &[u8], what: &str) -> IngestionResult<u64> {
    if buf.remaining() < 8 {
        return Err(truncated(what));
    }
    Ok(buf.get_u64())
}

fn truncated(what: &str) -> IngestionError {
    IngestionError::MalformedRmd(format!("truncated while reading {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StaticSchemaRepository;
    use std::sync::Arc;

    fn serde() -> RmdSerde {
        let repo = StaticSchemaRepository::new()
            .with_record_level(1)
            .with_field_level(2, 3);
        RmdSerde::new(SchemaCache::new(Arc::new(repo)), 1)
    }

    #[test]
    fn record_level_round_trip() {
        let serde = serde();
        let rmd = ReplicationMetadata::record_level(123_456, vec![10, 0, 7]);
        let bytes = serde.encode(1, &rmd).unwrap();
        let decoded = serde.decode(&bytes).unwrap();
        assert_eq!(decoded.value_schema_id, 1);
        assert_eq!(decoded.rmd, rmd);
    }

    #[test]
    fn field_level_round_trip() {
        let serde = serde();
        let rmd = ReplicationMetadata::field_level(vec![5, 9, 2], vec![1, 2]);
        let bytes = serde.encode(2, &rmd).unwrap();
        let decoded = serde.decode(&bytes).unwrap();
        assert_eq!(decoded.value_schema_id, 2);
        assert_eq!(decoded.rmd, rmd);
    }

    #[test]
    fn schema_id_prefix_is_big_endian() {
        let serde = serde();
        let rmd = ReplicationMetadata::record_level(0, vec![]);
        let bytes = serde.encode(1, &rmd).unwrap();
        assert_eq!(&bytes[..4], &1i32.to_be_bytes());
    }

    #[test]
    fn truncation_is_malformed() {
        let serde = serde();
        let rmd = ReplicationMetadata::record_level(42, vec![1, 2]);
        let bytes = serde.encode(1, &rmd).unwrap();
        for cut in [0, 3, 4, 5, 10, bytes.len() - 1] {
            let err = serde.decode(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err, IngestionError::MalformedRmd(_)),
                "cut at {cut} gave {err:?}"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let serde = serde();
        let rmd = ReplicationMetadata::record_level(42, vec![1]);
        let mut bytes = serde.encode(1, &rmd).unwrap().to_vec();
        bytes.push(0xff);
        assert!(matches!(
            serde.decode(&bytes),
            Err(IngestionError::MalformedRmd(_))
        ));
    }

    #[test]
    fn unknown_schema_id_is_rejected() {
        let serde = serde();
        let rmd = ReplicationMetadata::record_level(42, vec![1]);
        let err = serde.encode(99, &rmd).unwrap_err();
        assert!(matches!(err, IngestionError::UnknownRmdSchema { .. }));

        // Craft a payload claiming schema 99.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&99i32.to_be_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&42u64.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        let err = serde.decode(&bytes).unwrap_err();
        assert!(matches!(err, IngestionError::UnknownRmdSchema { .. }));
    }

    #[test]
    fn layout_mismatch_is_malformed() {
        let serde = serde();
        // Field-level payload under a record-level schema id.
        let rmd = ReplicationMetadata::field_level(vec![1, 2, 3], vec![]);
        let err = serde.encode(1, &rmd).unwrap_err();
        assert!(matches!(err, IngestionError::MalformedRmd(_)));

        // Wrong field count under a field-level schema id.
        let rmd = ReplicationMetadata::field_level(vec![1, 2], vec![]);
        let err = serde.encode(2, &rmd).unwrap_err();
        assert!(matches!(err, IngestionError::MalformedRmd(_)));
    }
}
