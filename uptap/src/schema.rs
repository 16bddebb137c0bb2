// Copyright 2026 Authors of uptap
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Event schemas and records.
//!
//! A schema names an event and lays out its fields as a packed sequence of
//! fixed-width integers in native byte order. Probes capture raw bytes in
//! that layout; `EventRecord::decode` turns them back into typed values.
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use byteorder::{NativeEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// Width and signedness of a single event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl FieldKind {
    pub fn width(self) -> usize {
        match self {
            FieldKind::U8 | FieldKind::I8 => 1,
            FieldKind::U16 | FieldKind::I16 => 2,
            FieldKind::U32 | FieldKind::I32 => 4,
            FieldKind::U64 | FieldKind::I64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    kind: FieldKind,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }
}

/// A named event layout: an ordered list of fields with no padding between
/// them. Two pipeline pieces agree on an event by agreeing on its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSchema {
    name: String,
    fields: Vec<Field>,
}

impl EventSchema {
    pub fn new(name: &str, fields: &[(&str, FieldKind)]) -> EventSchema {
        EventSchema {
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(name, kind)| Field {
                    name: name.to_string(),
                    kind: *kind,
                })
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Total size in bytes of one encoded record.
    pub fn byte_width(&self) -> usize {
        self.fields.iter().map(|f| f.kind.width()).sum()
    }
}

/// One decoded field value. Conversions widen, never truncate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl FieldValue {
    pub fn as_i64(self) -> i64 {
        match self {
            FieldValue::U8(v) => v as i64,
            FieldValue::U16(v) => v as i64,
            FieldValue::U32(v) => v as i64,
            FieldValue::U64(v) => v as i64,
            FieldValue::I8(v) => v as i64,
            FieldValue::I16(v) => v as i64,
            FieldValue::I32(v) => v as i64,
            FieldValue::I64(v) => v,
        }
    }

    pub fn as_u64(self) -> u64 {
        self.as_i64() as u64
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::U8(v) => write!(f, "{}", v),
            FieldValue::U16(v) => write!(f, "{}", v),
            FieldValue::U32(v) => write!(f, "{}", v),
            FieldValue::U64(v) => write!(f, "{}", v),
            FieldValue::I8(v) => write!(f, "{}", v),
            FieldValue::I16(v) => write!(f, "{}", v),
            FieldValue::I32(v) => write!(f, "{}", v),
            FieldValue::I64(v) => write!(f, "{}", v),
        }
    }
}

/// A decoded event: the schema it was captured under plus one value per
/// schema field, in schema order.
#[derive(Debug, Clone)]
pub struct EventRecord {
    schema: Arc<EventSchema>,
    values: Vec<FieldValue>,
}

impl EventRecord {
    /// Decodes `bytes` against `schema`. The byte slice must be exactly one
    /// record long; anything else is a malformed capture.
    pub fn decode(schema: &Arc<EventSchema>, bytes: &[u8]) -> Result<EventRecord> {
        if bytes.len() != schema.byte_width() {
            return Err(Error::Decode(format!(
                "event `{}` is {} bytes, got {}",
                schema.name(),
                schema.byte_width(),
                bytes.len()
            )));
        }
        let mut cursor = Cursor::new(bytes);
        let mut values = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            let value = match field.kind {
                FieldKind::U8 => FieldValue::U8(cursor.read_u8()?),
                FieldKind::U16 => FieldValue::U16(cursor.read_u16::<NativeEndian>()?),
                FieldKind::U32 => FieldValue::U32(cursor.read_u32::<NativeEndian>()?),
                FieldKind::U64 => FieldValue::U64(cursor.read_u64::<NativeEndian>()?),
                FieldKind::I8 => FieldValue::I8(cursor.read_i8()?),
                FieldKind::I16 => FieldValue::I16(cursor.read_i16::<NativeEndian>()?),
                FieldKind::I32 => FieldValue::I32(cursor.read_i32::<NativeEndian>()?),
                FieldKind::I64 => FieldValue::I64(cursor.read_i64::<NativeEndian>()?),
            };
            values.push(value);
        }
        Ok(EventRecord {
            schema: schema.clone(),
            values,
        })
    }

    pub fn schema(&self) -> &EventSchema {
        &self.schema
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Looks a value up by field name.
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        self.schema
            .fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| self.values[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn propose() -> Arc<EventSchema> {
        Arc::new(EventSchema::new(
            "propose",
            &[("id", FieldKind::I32), ("view", FieldKind::I32)],
        ))
    }

    #[test]
    fn byte_width_sums_field_widths() {
        assert_eq!(propose().byte_width(), 8);
        let mixed = EventSchema::new(
            "mixed",
            &[("a", FieldKind::U8), ("b", FieldKind::I64), ("c", FieldKind::U16)],
        );
        assert_eq!(mixed.byte_width(), 11);
    }

    #[test]
    fn decode_round_trips_native_order() {
        let schema = propose();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7i32.to_ne_bytes());
        bytes.extend_from_slice(&(-3i32).to_ne_bytes());
        let record = EventRecord::decode(&schema, &bytes).unwrap();
        assert_eq!(record.field("id"), Some(FieldValue::I32(7)));
        assert_eq!(record.field("view"), Some(FieldValue::I32(-3)));
        assert_eq!(record.field("missing"), None);
        assert_eq!(record.schema().name(), "propose");
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let schema = propose();
        assert!(EventRecord::decode(&schema, &[0u8; 7]).is_err());
        assert!(EventRecord::decode(&schema, &[0u8; 9]).is_err());
    }

    #[test]
    fn zero_field_schemas_mark_occurrences() {
        let schema = Arc::new(EventSchema::new("hit", &[]));
        assert_eq!(schema.byte_width(), 0);
        let record = EventRecord::decode(&schema, &[]).unwrap();
        assert!(record.values().is_empty());
        assert!(EventRecord::decode(&schema, &[0u8]).is_err());
    }

    #[test]
    fn values_display_as_decimal() {
        let schema = Arc::new(EventSchema::new("t", &[("id", FieldKind::I32)]));
        let record = EventRecord::decode(&schema, &(-42i32).to_ne_bytes()).unwrap();
        assert_eq!(record.field("id").unwrap().to_string(), "-42");
        assert_eq!(record.field("id").unwrap().as_i64(), -42);
    }
}
