//! TLV codec for the schema-driven data model.
//!
//! Each entry is a header byte `(typeTag:3)(index:5)` followed by a
//! type-specific value. Scalar widths are fixed; strings and structs
//! carry a 2-byte big-endian length prefix. Struct values recurse with
//! the struct's own member specs and a fresh index space.
//!
//! Encoding walks the caller's value map but emits entries in schema
//! declaration order, and returns the per-field chunks alongside the
//! flat buffer so the fragmentation layer can cut on field boundaries.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::schema::{DataTemplate, FieldSpec, TemplateSection, TlvType};

#[derive(Error, Debug)]
pub enum TlvError {
    #[error("field {id:?} is not declared in the template")]
    UnknownField { id: String },

    #[error("no template entry at index {index}")]
    SchemaIndexNotFound { index: u8 },

    #[error("index {index} declared {declared} but the wire carries tag {wire}")]
    TypeMismatch { index: u8, declared: TlvType, wire: u8 },

    #[error("field {id:?} expects {expected}, got {found}")]
    ValueTypeMismatch {
        id: String,
        expected: TlvType,
        found: TlvType,
    },

    #[error("value for {id:?} exceeds the 16-bit length prefix")]
    ValueTooLong { id: String },

    #[error("payload truncated while reading {what}")]
    Truncated { what: &'static str },

    #[error("string value is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A decoded or to-be-encoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum TlvValue {
    Bool(bool),
    Int(i32),
    Str(String),
    Float(f32),
    Enum(u16),
    Time(u32),
    Struct(ValueMap),
}

/// Field-id keyed value map.
pub type ValueMap = BTreeMap<String, TlvValue>;

impl TlvValue {
    pub fn ty(&self) -> TlvType {
        match self {
            TlvValue::Bool(_) => TlvType::Bool,
            TlvValue::Int(_) => TlvType::Int,
            TlvValue::Str(_) => TlvType::Str,
            TlvValue::Float(_) => TlvType::Float,
            TlvValue::Enum(_) => TlvType::Enum,
            TlvValue::Time(_) => TlvType::Time,
            TlvValue::Struct(_) => TlvType::Struct,
        }
    }
}

/// Encoder output: the flat byte sequence plus the per-field chunks the
/// fragmentation layer needs for its length accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub flat: Vec<u8>,
    pub chunks: Vec<Vec<u8>>,
}

/// Encode a value map against a template section.
pub fn encode_fields(section: &TemplateSection, values: &ValueMap) -> Result<Encoded, TlvError> {
    let mut slots: Vec<Option<Vec<u8>>> = vec![None; section.len()];

    for (id, value) in values {
        let index = section.index_of(id).ok_or_else(|| TlvError::UnknownField {
            id: id.clone(),
        })?;
        let spec = section
            .get(index)
            .ok_or(TlvError::SchemaIndexNotFound { index })?;
        slots[index as usize] = Some(encode_entry(spec, index, value)?);
    }

    let mut flat = Vec::new();
    let mut chunks = Vec::new();
    for slot in slots.into_iter().flatten() {
        flat.extend_from_slice(&slot);
        chunks.push(slot);
    }
    Ok(Encoded { flat, chunks })
}

fn encode_entry(spec: &FieldSpec, index: u8, value: &TlvValue) -> Result<Vec<u8>, TlvError> {
    if value.ty() != spec.ty {
        return Err(TlvError::ValueTypeMismatch {
            id: spec.id.clone(),
            expected: spec.ty,
            found: value.ty(),
        });
    }

    let mut out = vec![(spec.ty.tag() << 5) | (index & 0x1F)];
    match value {
        TlvValue::Bool(v) => out.push(*v as u8),
        TlvValue::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
        TlvValue::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
        TlvValue::Enum(v) => out.extend_from_slice(&v.to_be_bytes()),
        TlvValue::Time(v) => out.extend_from_slice(&v.to_be_bytes()),
        TlvValue::Str(v) => {
            let bytes = v.as_bytes();
            if bytes.len() > u16::MAX as usize {
                return Err(TlvError::ValueTooLong {
                    id: spec.id.clone(),
                });
            }
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        TlvValue::Struct(members) => {
            let nested = encode_members(&spec.members, members)?;
            if nested.len() > u16::MAX as usize {
                return Err(TlvError::ValueTooLong {
                    id: spec.id.clone(),
                });
            }
            out.extend_from_slice(&(nested.len() as u16).to_be_bytes());
            out.extend_from_slice(&nested);
        }
    }
    Ok(out)
}

fn encode_members(members: &[FieldSpec], values: &ValueMap) -> Result<Vec<u8>, TlvError> {
    let mut slots: Vec<Option<Vec<u8>>> = vec![None; members.len()];
    for (id, value) in values {
        let index = members
            .iter()
            .position(|m| m.id == *id)
            .ok_or_else(|| TlvError::UnknownField { id: id.clone() })?;
        slots[index] = Some(encode_entry(&members[index], index as u8, value)?);
    }
    Ok(slots.into_iter().flatten().flatten().collect())
}

/// Decode a TLV sequence against a template section.
pub fn decode_fields(section: &TemplateSection, bytes: &[u8]) -> Result<ValueMap, TlvError> {
    decode_entries(section.fields(), bytes)
}

fn decode_entries(specs: &[FieldSpec], bytes: &[u8]) -> Result<ValueMap, TlvError> {
    let mut values = ValueMap::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let head = bytes[pos];
        pos += 1;
        let wire_tag = head >> 5;
        let index = head & 0x1F;

        let spec = specs
            .get(index as usize)
            .ok_or(TlvError::SchemaIndexNotFound { index })?;
        if wire_tag != spec.ty.tag() {
            return Err(TlvError::TypeMismatch {
                index,
                declared: spec.ty,
                wire: wire_tag,
            });
        }

        let value = match spec.ty {
            TlvType::Bool => {
                let v = *bytes.get(pos).ok_or(TlvError::Truncated { what: "bool" })?;
                pos += 1;
                TlvValue::Bool(v != 0)
            }
            TlvType::Int => {
                let raw = take(bytes, &mut pos, 4, "int")?;
                TlvValue::Int(BigEndian::read_i32(raw))
            }
            TlvType::Float => {
                let raw = take(bytes, &mut pos, 4, "float")?;
                TlvValue::Float(BigEndian::read_f32(raw))
            }
            TlvType::Enum => {
                let raw = take(bytes, &mut pos, 2, "enum")?;
                TlvValue::Enum(BigEndian::read_u16(raw))
            }
            TlvType::Time => {
                let raw = take(bytes, &mut pos, 4, "time")?;
                TlvValue::Time(BigEndian::read_u32(raw))
            }
            TlvType::Str => {
                let len = BigEndian::read_u16(take(bytes, &mut pos, 2, "string length")?) as usize;
                let raw = take(bytes, &mut pos, len, "string")?;
                TlvValue::Str(String::from_utf8(raw.to_vec())?)
            }
            TlvType::Struct => {
                let len = BigEndian::read_u16(take(bytes, &mut pos, 2, "struct length")?) as usize;
                let raw = take(bytes, &mut pos, len, "struct")?;
                TlvValue::Struct(decode_entries(&spec.members, raw)?)
            }
        };
        values.insert(spec.id.clone(), value);
    }

    Ok(values)
}

fn take<'a>(
    bytes: &'a [u8],
    pos: &mut usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], TlvError> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or(TlvError::Truncated { what })?;
    let raw = &bytes[*pos..end];
    *pos = end;
    Ok(raw)
}

/// One decoded event-report segment.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    pub event_id: String,
    pub index: u8,
    pub params: ValueMap,
}

/// Decode `[eventIndex:1][params TLV]` against the template's events.
pub fn decode_event_report(template: &DataTemplate, bytes: &[u8]) -> Result<EventPayload, TlvError> {
    let (&index, params) = bytes
        .split_first()
        .ok_or(TlvError::Truncated { what: "event index" })?;
    let event = template
        .event(index)
        .ok_or(TlvError::SchemaIndexNotFound { index })?;
    Ok(EventPayload {
        event_id: event.id.clone(),
        index,
        params: decode_fields(&event.params, params)?,
    })
}

/// One decoded action-output payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutput {
    pub action_id: String,
    pub index: u8,
    pub params: ValueMap,
}

/// Decode `[actionIndex:1][output TLV]` against the template's actions.
pub fn decode_action_output(
    template: &DataTemplate,
    bytes: &[u8],
) -> Result<ActionOutput, TlvError> {
    let (&index, output) = bytes
        .split_first()
        .ok_or(TlvError::Truncated { what: "action index" })?;
    let action = template
        .action(index)
        .ok_or(TlvError::SchemaIndexNotFound { index })?;
    Ok(ActionOutput {
        action_id: action.id.clone(),
        index,
        params: decode_fields(&action.output, output)?,
    })
}
