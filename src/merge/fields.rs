//! Field framing for partial-update stores.
//!
//! Values of a partial-update store are framed as a flat field list so the
//! resolver can merge at field granularity without knowing the schema
//! internals; the registry only contributes the field count. All integers
//! big-endian:
//!
//! ```text
//! value:  [u16 field_count][per field: u32 len][bytes]
//! update: [u16 entry_count][per entry: u16 field_index][u32 len][bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{IngestionError, IngestionResult};

/// Decode a framed field-level value into its fields.
pub fn decode_fields(value: &Bytes) -> IngestionResult<Vec<Bytes>> {
    let mut buf = &value[..];
    if buf.remaining() < 2 {
        return Err(invalid("field value header truncated"));
    }
    let field_count = buf.get_u16() as usize;
    let mut fields = Vec::with_capacity(field_count);
    for i in 0..field_count {
        if buf.remaining() < 4 {
            return Err(invalid(&format!("field {i} length truncated")));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(invalid(&format!("field {i} payload truncated")));
        }
        let consumed = value.len() - buf.remaining();
        fields.push(value.slice(consumed..consumed + len));
        buf.advance(len);
    }
    if !buf.is_empty() {
        return Err(invalid("trailing bytes after last field"));
    }
    Ok(fields)
}

/// Encode fields back into a framed value.
pub fn encode_fields(fields: &[Bytes]) -> Bytes {
    let payload_len: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut buf = BytesMut::with_capacity(2 + payload_len);
    buf.put_u16(fields.len() as u16);
    for field in fields {
        buf.put_u32(field.len() as u32);
        buf.put_slice(field);
    }
    buf.freeze()
}

/// One `(field_index, new_bytes)` entry of a partial update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEntry {
    pub field_index: usize,
    pub value: Bytes,
}

/// Decode a partial-update payload.
pub fn decode_update_entries(payload: &Bytes) -> IngestionResult<Vec<UpdateEntry>> {
    let mut buf = &payload[..];
    if buf.remaining() < 2 {
        return Err(invalid("update header truncated"));
    }
    let entry_count = buf.get_u16() as usize;
    let mut entries = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        if buf.remaining() < 6 {
            return Err(invalid(&format!("update entry {i} header truncated")));
        }
        let field_index = buf.get_u16() as usize;
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(invalid(&format!("update entry {i} payload truncated")));
        }
        let consumed = payload.len() - buf.remaining();
        entries.push(UpdateEntry {
            field_index,
            value: payload.slice(consumed..consumed + len),
        });
        buf.advance(len);
    }
    if !buf.is_empty() {
        return Err(invalid("trailing bytes after last update entry"));
    }
    Ok(entries)
}

/// Encode a partial-update payload; test and writer-side helper.
pub fn encode_update_entries(entries: &[UpdateEntry]) -> Bytes {
    let payload_len: usize = entries.iter().map(|e| 6 + e.value.len()).sum();
    let mut buf = BytesMut::with_capacity(2 + payload_len);
    buf.put_u16(entries.len() as u16);
    for entry in entries {
        buf.put_u16(entry.field_index as u16);
        buf.put_u32(entry.value.len() as u32);
        buf.put_slice(&entry.value);
    }
    buf.freeze()
}

fn invalid(message: &str) -> IngestionError {
    IngestionError::InvalidOperation(message.to_string())
}
