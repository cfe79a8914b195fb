use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Stage, StageError};
use crate::record::Record;

// ---------------------------------------------------------------------------
// SchemaValidator — external validation service
// ---------------------------------------------------------------------------

/// Field-level validation supplied by the schema service. Implementations
/// decide whether a failure is transient (service unreachable) or permanent
/// (record violates the schema).
#[async_trait]
pub trait SchemaValidator: Send + Sync {
    async fn validate(&self, record: &Record) -> Result<(), StageError>;
}

/// Minimal validator: every listed field must be present in the payload.
#[derive(Debug, Clone, Default)]
pub struct RequiredFieldsValidator {
    fields: Vec<String>,
}

impl RequiredFieldsValidator {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl SchemaValidator for RequiredFieldsValidator {
    async fn validate(&self, record: &Record) -> Result<(), StageError> {
        for field in &self.fields {
            if record.field(field).is_none_or(Value::is_null) {
                return Err(StageError::permanent(format!(
                    "missing required field {field:?}"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ParseStage
// ---------------------------------------------------------------------------

/// Checks the payload shape and required fields, then consults the schema
/// validator when one is configured.
pub struct ParseStage {
    required: RequiredFieldsValidator,
    validator: Option<Arc<dyn SchemaValidator>>,
}

impl ParseStage {
    pub fn new(required_fields: Vec<String>, validator: Option<Arc<dyn SchemaValidator>>) -> Self {
        Self {
            required: RequiredFieldsValidator::new(required_fields),
            validator,
        }
    }
}

#[async_trait]
impl Stage for ParseStage {
    fn name(&self) -> &str {
        "parse"
    }

    async fn apply(&self, record: &Record) -> Result<Option<Record>, StageError> {
        if record.key.is_empty() {
            return Err(StageError::permanent("record key is empty"));
        }
        if !record.payload.is_object() {
            return Err(StageError::permanent(format!(
                "payload must be a JSON object, got {}",
                json_type(&record.payload)
            )));
        }
        self.required.validate(record).await?;
        if let Some(validator) = &self.validator {
            validator.validate(record).await?;
        }
        Ok(Some(record.clone()))
    }
}

// ---------------------------------------------------------------------------
// FieldEqualsFilter
// ---------------------------------------------------------------------------

/// Drops records whose `field` is absent or not equal to `equals`. Non-string
/// values are compared by their JSON text.
pub struct FieldEqualsFilter {
    field: String,
    equals: String,
}

impl FieldEqualsFilter {
    pub fn new(field: &str, equals: &str) -> Self {
        Self {
            field: field.to_string(),
            equals: equals.to_string(),
        }
    }
}

#[async_trait]
impl Stage for FieldEqualsFilter {
    fn name(&self) -> &str {
        "filter"
    }

    async fn apply(&self, record: &Record) -> Result<Option<Record>, StageError> {
        let keep = match record.field(&self.field) {
            Some(Value::String(s)) => *s == self.equals,
            Some(other) => other.to_string() == self.equals,
            None => false,
        };
        Ok(keep.then(|| record.clone()))
    }
}

// ---------------------------------------------------------------------------
// EnrichStage
// ---------------------------------------------------------------------------

/// Adds static fields to the payload. Fields the record already carries are
/// left as they are.
pub struct EnrichStage {
    fields: BTreeMap<String, String>,
}

impl EnrichStage {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl Stage for EnrichStage {
    fn name(&self) -> &str {
        "enrich"
    }

    async fn apply(&self, record: &Record) -> Result<Option<Record>, StageError> {
        let mut out = record.clone();
        let Some(obj) = out.payload.as_object_mut() else {
            return Err(StageError::permanent("cannot enrich a non-object payload"));
        };
        for (k, v) in &self.fields {
            obj.entry(k.clone())
                .or_insert_with(|| Value::String(v.clone()));
        }
        Ok(Some(out))
    }
}

// ---------------------------------------------------------------------------
// FnStage
// ---------------------------------------------------------------------------

type StageFn = dyn Fn(&Record) -> Result<Option<Record>, StageError> + Send + Sync;

/// Wraps a synchronous closure as a stage.
pub struct FnStage {
    name: String,
    f: Box<StageFn>,
}

impl FnStage {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Record) -> Result<Option<Record>, StageError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, record: &Record) -> Result<Option<Record>, StageError> {
        (self.f)(record)
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
