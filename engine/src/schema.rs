//! Collection schemas.
//!
//! A write is validated against its collection's schema before anything is
//! written, so a malformed mutation never reaches the operation log.

use crate::{error::Result, CollectionName, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Type of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    /// Any number; integers included
    Float,
    Bool,
    /// Milliseconds since the Unix epoch, never negative
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }

    /// Whether a non-null value fits this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Json => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One field of a collection payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Absent and `null` both count as missing
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    /// Check this field within a payload object.
    pub fn check(&self, payload: &Map<String, Value>) -> Result<()> {
        match payload.get(&self.name) {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(value) if self.field_type.accepts(value) => Ok(()),
            Some(value) => Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: describe(value).to_string(),
            }),
        }
    }
}

/// Type name of a JSON value, in the same vocabulary as [`FieldType`].
fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_f64() => "Float",
        Value::Number(_) => "Int",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

fn as_object(payload: &Value) -> Result<&Map<String, Value>> {
    payload
        .as_object()
        .ok_or_else(|| Error::InvalidPayload(format!("expected an object, got {}", describe(payload))))
}

/// Fields of one collection. Fields not listed are allowed and unchecked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub name: CollectionName,
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Check a whole payload. Stops at the first bad field.
    pub fn check(&self, payload: &Value) -> Result<()> {
        let object = as_object(payload)?;
        self.fields.iter().try_for_each(|field| field.check(object))
    }
}

/// Schemas for every collection the engine stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Recorded for hosts that migrate payloads between releases
    pub version: SchemaVersion,
    pub collections: BTreeMap<CollectionName, CollectionSchema>,
    /// Accept collections that have no registered schema
    #[serde(default)]
    pub allow_unknown_collections: bool,
}

impl Schema {
    /// A schema that only accepts registered collections.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: BTreeMap::new(),
            allow_unknown_collections: false,
        }
    }

    /// Any collection is accepted as long as its payload is a JSON object.
    /// Registered collections are still checked field by field.
    pub fn permissive() -> Self {
        Self {
            allow_unknown_collections: true,
            ..Self::new(0)
        }
    }

    pub fn register(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.register(collection);
        self
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Whether the collection may be written to at all.
    pub fn check_collection(&self, collection: &str) -> Result<()> {
        if self.allow_unknown_collections || self.collections.contains_key(collection) {
            Ok(())
        } else {
            Err(Error::CollectionNotFound(collection.to_string()))
        }
    }

    /// Validate a create or update payload for a collection.
    pub fn validate(&self, collection: &str, payload: &Value) -> Result<()> {
        self.check_collection(collection)?;
        match self.collection(collection) {
            Some(schema) => schema.check(payload),
            None => as_object(payload).map(|_| ()),
        }
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::permissive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn todos() -> Schema {
        Schema::new(1).with_collection(CollectionSchema::new(
            "todos",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("done", FieldType::Bool),
                FieldDef::optional("due", FieldType::Timestamp),
            ],
        ))
    }

    #[test]
    fn valid_payloads() {
        let schema = todos();

        assert!(schema.validate("todos", &json!({"title": "A"})).is_ok());
        assert!(schema
            .validate("todos", &json!({"title": "B", "done": true, "due": 1_700_000_000_000u64}))
            .is_ok());
        // Unlisted fields pass through.
        assert!(schema
            .validate("todos", &json!({"title": "C", "tags": ["x"]}))
            .is_ok());
    }

    #[test]
    fn missing_or_null_required_field() {
        for payload in [json!({"done": false}), json!({"title": null})] {
            let result = todos().validate("todos", &payload);
            assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "title"));
        }
    }

    #[test]
    fn wrong_type_names_both_sides() {
        let result = todos().validate("todos", &json!({"title": "A", "done": "yes"}));
        assert!(matches!(
            result,
            Err(Error::TypeMismatch { field, expected, got })
                if field == "done" && expected == "Bool" && got == "String"
        ));

        let result = todos().validate("todos", &json!({"title": "A", "due": -5}));
        assert!(matches!(
            result,
            Err(Error::TypeMismatch { expected, got, .. }) if expected == "Timestamp" && got == "Int"
        ));
    }

    #[test]
    fn unknown_collection() {
        let schema = todos();

        let result = schema.validate("notes", &json!({"body": "x"}));
        assert!(matches!(result, Err(Error::CollectionNotFound(c)) if c == "notes"));
        assert!(schema.check_collection("todos").is_ok());
    }

    #[test]
    fn payload_must_be_an_object() {
        let result = todos().validate("todos", &json!(["title"]));
        assert!(matches!(result, Err(Error::InvalidPayload(msg)) if msg.contains("Array")));

        let result = Schema::permissive().validate("anything", &json!("text"));
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn permissive_schema() {
        let schema = Schema::permissive().with_collection(CollectionSchema::new(
            "todos",
            vec![FieldDef::required("title", FieldType::String)],
        ));

        assert!(schema.validate("notes", &json!({"x": 1})).is_ok());
        assert!(schema.validate("todos", &json!({})).is_err());
        assert_eq!(Schema::default(), Schema::permissive());
    }

    #[test]
    fn number_types() {
        let metrics = CollectionSchema::new(
            "metrics",
            vec![
                FieldDef::optional("value", FieldType::Float),
                FieldDef::optional("count", FieldType::Int),
            ],
        );

        assert!(metrics.check(&json!({"value": 1, "count": 2})).is_ok());
        assert!(metrics.check(&json!({"value": 1.5})).is_ok());
        assert!(metrics.check(&json!({"count": 2.5})).is_err());
        assert_eq!(metrics.field("count").map(|f| f.required), Some(false));
    }

    #[test]
    fn json_field_accepts_anything() {
        let events =
            CollectionSchema::new("events", vec![FieldDef::required("data", FieldType::Json)]);

        for data in [json!("s"), json!(1), json!(true), json!([1, 2]), json!({"a": 1})] {
            assert!(events.check(&json!({ "data": data })).is_ok());
        }
    }

    #[test]
    fn field_types_serialize_lowercase() {
        let field = FieldDef::optional("due", FieldType::Timestamp);
        assert_eq!(
            serde_json::to_value(&field).unwrap(),
            json!({"name": "due", "fieldType": "timestamp", "required": false})
        );
    }
}
