//! Data template: the device's declared properties, events and actions.
//!
//! Templates arrive as JSON from the product backend and are parsed once
//! per session into an immutable, index-ordered table. The declaration
//! index doubles as the 5-bit TLV type-index, so a section is capped at
//! 32 entries and indices are implied by position — duplicate ids or
//! oversized sections are rejected up front rather than discovered mid
//! decode.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("template JSON is invalid: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("section {section} has {count} entries, the TLV index allows 32")]
    TooManyEntries { section: &'static str, count: usize },

    #[error("duplicate id {id:?} in template")]
    DuplicateId { id: String },

    #[error("unknown data type {ty:?} for {id:?}")]
    UnknownType { id: String, ty: String },

    #[error("struct {id:?} nests another struct, which the wire format cannot carry")]
    NestedStruct { id: String },

    #[error("id {id:?} does not exist in the template")]
    UnknownId { id: String },
}

/// TLV value types. The discriminant is the 3-bit wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    Bool = 0,
    Int = 1,
    Str = 2,
    Float = 3,
    Enum = 4,
    Time = 5,
    Struct = 6,
}

impl TlvType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => TlvType::Bool,
            1 => TlvType::Int,
            2 => TlvType::Str,
            3 => TlvType::Float,
            4 => TlvType::Enum,
            5 => TlvType::Time,
            6 => TlvType::Struct,
            _ => return None,
        })
    }

    fn parse(id: &str, ty: &str) -> Result<Self, SchemaError> {
        Ok(match ty {
            "bool" => TlvType::Bool,
            "int" => TlvType::Int,
            "string" => TlvType::Str,
            "float" => TlvType::Float,
            "enum" => TlvType::Enum,
            "time" | "timestamp" => TlvType::Time,
            "struct" => TlvType::Struct,
            other => {
                return Err(SchemaError::UnknownType {
                    id: id.to_string(),
                    ty: other.to_string(),
                });
            }
        })
    }
}

impl fmt::Display for TlvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TlvType::Bool => "bool",
            TlvType::Int => "int",
            TlvType::Str => "string",
            TlvType::Float => "float",
            TlvType::Enum => "enum",
            TlvType::Time => "time",
            TlvType::Struct => "struct",
        };
        f.write_str(name)
    }
}

/// One field of a template section.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub id: String,
    pub ty: TlvType,
    /// Member specs when `ty` is [`TlvType::Struct`], empty otherwise.
    pub members: Vec<FieldSpec>,
}

/// An ordered, validated set of fields sharing one TLV index space.
#[derive(Debug, Clone, Default)]
pub struct TemplateSection {
    fields: Vec<FieldSpec>,
    by_id: HashMap<String, u8>,
}

impl TemplateSection {
    pub fn new(section: &'static str, fields: Vec<FieldSpec>) -> Result<Self, SchemaError> {
        if fields.len() > 32 {
            return Err(SchemaError::TooManyEntries {
                section,
                count: fields.len(),
            });
        }
        let mut by_id = HashMap::with_capacity(fields.len());
        for (index, field) in fields.iter().enumerate() {
            if by_id.insert(field.id.clone(), index as u8).is_some() {
                return Err(SchemaError::DuplicateId {
                    id: field.id.clone(),
                });
            }
        }
        Ok(Self { fields, by_id })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, index: u8) -> Option<&FieldSpec> {
        self.fields.get(index as usize)
    }

    pub fn index_of(&self, id: &str) -> Option<u8> {
        self.by_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// An event declaration: id plus its parameter section.
#[derive(Debug, Clone)]
pub struct EventSpec {
    pub id: String,
    pub params: TemplateSection,
}

/// An action declaration: id plus input and output sections.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub id: String,
    pub input: TemplateSection,
    pub output: TemplateSection,
}

/// The complete data template for one product.
#[derive(Debug, Clone, Default)]
pub struct DataTemplate {
    pub properties: TemplateSection,
    events: Vec<EventSpec>,
    actions: Vec<ActionSpec>,
    action_by_id: HashMap<String, u8>,
}

impl DataTemplate {
    /// Parse and validate a template from its JSON document.
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let raw: RawTemplate = serde_json::from_str(json)?;

        let properties = TemplateSection::new(
            "properties",
            raw.properties
                .iter()
                .map(RawEntry::to_spec)
                .collect::<Result<_, _>>()?,
        )?;

        let mut events = Vec::with_capacity(raw.events.len());
        for event in &raw.events {
            events.push(EventSpec {
                id: event.id.clone(),
                params: TemplateSection::new(
                    "event params",
                    event
                        .params
                        .iter()
                        .map(RawEntry::to_spec)
                        .collect::<Result<_, _>>()?,
                )?,
            });
        }
        if events.len() > 32 {
            return Err(SchemaError::TooManyEntries {
                section: "events",
                count: events.len(),
            });
        }

        let mut actions = Vec::with_capacity(raw.actions.len());
        let mut action_by_id = HashMap::new();
        for action in &raw.actions {
            if action_by_id
                .insert(action.id.clone(), actions.len() as u8)
                .is_some()
            {
                return Err(SchemaError::DuplicateId {
                    id: action.id.clone(),
                });
            }
            actions.push(ActionSpec {
                id: action.id.clone(),
                input: TemplateSection::new(
                    "action input",
                    action
                        .input
                        .iter()
                        .map(RawEntry::to_spec)
                        .collect::<Result<_, _>>()?,
                )?,
                output: TemplateSection::new(
                    "action output",
                    action
                        .output
                        .iter()
                        .map(RawEntry::to_spec)
                        .collect::<Result<_, _>>()?,
                )?,
            });
        }
        if actions.len() > 32 {
            return Err(SchemaError::TooManyEntries {
                section: "actions",
                count: actions.len(),
            });
        }

        Ok(Self {
            properties,
            events,
            actions,
            action_by_id,
        })
    }

    pub fn event(&self, index: u8) -> Option<&EventSpec> {
        self.events.get(index as usize)
    }

    pub fn action(&self, index: u8) -> Option<&ActionSpec> {
        self.actions.get(index as usize)
    }

    pub fn action_index(&self, id: &str) -> Option<u8> {
        self.action_by_id.get(id).copied()
    }
}

// Raw JSON shapes, kept separate from the validated model. Top-level
// entries carry their type under "define", struct members under
// "dataType" — a quirk of the product template format.

#[derive(Deserialize)]
struct RawTemplate {
    #[serde(default)]
    properties: Vec<RawEntry>,
    #[serde(default)]
    events: Vec<RawEvent>,
    #[serde(default)]
    actions: Vec<RawAction>,
}

#[derive(Deserialize)]
struct RawEntry {
    id: String,
    define: RawDefine,
}

#[derive(Deserialize)]
struct RawDefine {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    specs: Vec<RawMember>,
}

#[derive(Deserialize)]
struct RawMember {
    id: String,
    #[serde(rename = "dataType")]
    data_type: RawMemberType,
}

#[derive(Deserialize)]
struct RawMemberType {
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(default)]
    params: Vec<RawEntry>,
}

#[derive(Deserialize)]
struct RawAction {
    id: String,
    #[serde(default)]
    input: Vec<RawEntry>,
    #[serde(default)]
    output: Vec<RawEntry>,
}

impl RawEntry {
    fn to_spec(&self) -> Result<FieldSpec, SchemaError> {
        let ty = TlvType::parse(&self.id, &self.define.ty)?;
        let mut members = Vec::new();
        if ty == TlvType::Struct {
            for member in &self.define.specs {
                let member_ty = TlvType::parse(&member.id, &member.data_type.ty)?;
                if member_ty == TlvType::Struct {
                    return Err(SchemaError::NestedStruct {
                        id: self.id.clone(),
                    });
                }
                members.push(FieldSpec {
                    id: member.id.clone(),
                    ty: member_ty,
                    members: Vec::new(),
                });
            }
        }
        Ok(FieldSpec {
            id: self.id.clone(),
            ty,
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"{
        "properties": [
            {"id": "power_switch", "define": {"type": "bool"}},
            {"id": "brightness", "define": {"type": "int"}},
            {"id": "name", "define": {"type": "string"}},
            {"id": "position", "define": {"type": "struct", "specs": [
                {"id": "lat", "dataType": {"type": "float"}},
                {"id": "lon", "dataType": {"type": "float"}}
            ]}}
        ],
        "events": [
            {"id": "overheat", "params": [{"id": "temperature", "define": {"type": "float"}}]}
        ],
        "actions": [
            {"id": "blink", "input": [{"id": "period", "define": {"type": "int"}}],
                          "output": [{"id": "done", "define": {"type": "bool"}}]}
        ]
    }"#;

    #[test]
    fn test_template_parses_and_indexes() {
        let template = DataTemplate::from_json(TEMPLATE).unwrap();
        assert_eq!(template.properties.len(), 4);
        assert_eq!(template.properties.index_of("brightness"), Some(1));
        assert_eq!(template.properties.get(3).unwrap().members.len(), 2);
        assert_eq!(template.event(0).unwrap().id, "overheat");
        assert_eq!(template.action_index("blink"), Some(0));
        assert!(template.event(1).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let json = r#"{"properties": [
            {"id": "a", "define": {"type": "bool"}},
            {"id": "a", "define": {"type": "int"}}
        ]}"#;
        assert!(matches!(
            DataTemplate::from_json(json),
            Err(SchemaError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_oversized_section_rejected() {
        let entries: Vec<String> = (0..33)
            .map(|i| format!(r#"{{"id": "p{i}", "define": {{"type": "bool"}}}}"#))
            .collect();
        let json = format!(r#"{{"properties": [{}]}}"#, entries.join(","));
        assert!(matches!(
            DataTemplate::from_json(&json),
            Err(SchemaError::TooManyEntries { .. })
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"properties": [{"id": "a", "define": {"type": "blob"}}]}"#;
        assert!(matches!(
            DataTemplate::from_json(json),
            Err(SchemaError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_nested_struct_rejected() {
        let json = r#"{"properties": [{"id": "a", "define": {"type": "struct", "specs": [
            {"id": "b", "dataType": {"type": "struct"}}
        ]}}]}"#;
        assert!(matches!(
            DataTemplate::from_json(json),
            Err(SchemaError::NestedStruct { .. })
        ));
    }

    #[test]
    fn test_timestamp_alias() {
        let json = r#"{"properties": [{"id": "at", "define": {"type": "timestamp"}}]}"#;
        let template = DataTemplate::from_json(json).unwrap();
        assert_eq!(template.properties.get(0).unwrap().ty, TlvType::Time);
    }
}
