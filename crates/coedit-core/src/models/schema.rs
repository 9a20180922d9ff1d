//! Closed field schemas per resource kind
//!
//! Every kind declares the fields it accepts and their scalar type. Change
//! sets naming anything else are rejected instead of being silently copied.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

use super::resource::FieldMap;

/// Scalar type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Boolean,
    Integer,
}

impl FieldType {
    const fn label(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Boolean => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
        }
    }
}

/// Declaration of one allowed field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    /// `null` is an accepted value
    pub nullable: bool,
    /// Must be present when the resource is created
    pub required: bool,
}

impl FieldSpec {
    const fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            required: false,
        }
    }

    const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn check(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if self.nullable {
                return Ok(());
            }
            return Err(Error::InvalidField {
                field: self.name.to_string(),
                reason: "must not be null".to_string(),
            });
        }
        if self.ty.matches(value) {
            Ok(())
        } else {
            Err(Error::InvalidField {
                field: self.name.to_string(),
                reason: format!("expected {}", self.ty.label()),
            })
        }
    }
}

const DOCUMENT_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("name", FieldType::Text).required(),
    FieldSpec::new("data", FieldType::Text).nullable(),
];

const PROFILE_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("username", FieldType::Text).required(),
    FieldSpec::new("email", FieldType::Text).required(),
    FieldSpec::new("full_name", FieldType::Text).nullable(),
    FieldSpec::new("is_active", FieldType::Boolean),
    FieldSpec::new("revision_note", FieldType::Text).nullable(),
    FieldSpec::new("login_count", FieldType::Integer),
];

/// Kind of resource, selecting its field schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A named document with a free-form body
    Document,
    /// A user profile record
    Profile,
}

impl ResourceKind {
    /// Stable name used in storage and on the wire
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Profile => "profile",
        }
    }

    /// All fields this kind accepts
    pub const fn fields(self) -> &'static [FieldSpec] {
        match self {
            Self::Document => DOCUMENT_FIELDS,
            Self::Profile => PROFILE_FIELDS,
        }
    }

    /// Look up a field declaration by name
    pub fn field(self, name: &str) -> Option<&'static FieldSpec> {
        self.fields().iter().find(|spec| spec.name == name)
    }

    /// Validate a partial update: known fields, matching types, not empty
    pub fn validate_changes(self, changes: &FieldMap) -> Result<()> {
        if changes.is_empty() {
            return Err(Error::InvalidInput("no fields to update".into()));
        }
        for (name, value) in changes {
            let spec = self.field(name).ok_or_else(|| Error::UnknownField {
                kind: self.as_str().to_string(),
                field: name.clone(),
            })?;
            spec.check(value)?;
        }
        Ok(())
    }

    /// Validate the initial field set of a new resource
    pub fn validate_new(self, fields: &FieldMap) -> Result<()> {
        for (name, value) in fields {
            let spec = self.field(name).ok_or_else(|| Error::UnknownField {
                kind: self.as_str().to_string(),
                field: name.clone(),
            })?;
            spec.check(value)?;
        }
        if let Some(missing) = self
            .fields()
            .iter()
            .find(|spec| spec.required && !fields.contains_key(spec.name))
        {
            return Err(Error::InvalidField {
                field: missing.name.to_string(),
                reason: "is required".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "document" => Ok(Self::Document),
            "profile" => Ok(Self::Profile),
            other => Err(Error::InvalidInput(format!("unknown resource kind `{other}`"))),
        }
    }
}
