//! Tool parameter schema checks.
//!
//! Validates a parameter map against a tool's declared [`ParamSchema`]s:
//! presence of required parameters, no undeclared parameters, JSON type,
//! string length (in characters), closed value sets and numeric bounds.
//!
//! Used twice per call: by the plan validator before anything runs and again
//! by the sandbox immediately before execution.

use warden_types::actions::{ParamSchema, ParamType, Parameters, ToolSpec};

/// Why a parameter map does not satisfy a tool's schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaViolation {
    /// A required parameter is absent.
    #[error("missing required parameter '{0}'")]
    Missing(String),

    /// A parameter the tool does not declare.
    #[error("undeclared parameter '{0}'")]
    Unknown(String),

    /// The value has the wrong JSON type.
    #[error("parameter '{name}' must be of type {expected:?}")]
    WrongType {
        /// Parameter name.
        name: String,
        /// Declared type.
        expected: ParamType,
    },

    /// A string longer than `max_length` characters.
    #[error("parameter '{name}' is {length} characters, max is {max}")]
    TooLong {
        /// Parameter name.
        name: String,
        /// Actual length.
        length: usize,
        /// Declared maximum.
        max: usize,
    },

    /// A value outside the declared set.
    #[error("parameter '{0}' is not one of the allowed values")]
    NotAllowed(String),

    /// A number outside `[min, max]`.
    #[error("parameter '{name}' value {value} is out of range")]
    OutOfRange {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: f64,
    },
}

/// Check `params` against every parameter declared by `spec`.
///
/// Reports the first violation found. Parameters are visited in name order, so
/// the result is deterministic.
pub fn validate_parameters(spec: &ToolSpec, params: &Parameters) -> Result<(), SchemaViolation> {
    if let Some(unknown) = params.keys().find(|k| !spec.parameters.contains_key(*k)) {
        return Err(SchemaViolation::Unknown(unknown.clone()));
    }

    for (name, schema) in &spec.parameters {
        match params.get(name) {
            None | Some(serde_json::Value::Null) if schema.required => {
                return Err(SchemaViolation::Missing(name.clone()));
            }
            None | Some(serde_json::Value::Null) => {}
            Some(value) => check_value(name, schema, value)?,
        }
    }
    Ok(())
}

fn check_value(
    name: &str,
    schema: &ParamSchema,
    value: &serde_json::Value,
) -> Result<(), SchemaViolation> {
    let type_ok = match schema.kind {
        ParamType::String => value.is_string(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Number => value.is_number(),
        ParamType::Boolean => value.is_boolean(),
    };
    if !type_ok {
        return Err(SchemaViolation::WrongType {
            name: name.to_string(),
            expected: schema.kind,
        });
    }

    if let (Some(max), Some(s)) = (schema.max_length, value.as_str()) {
        let length = s.chars().count();
        if length > max {
            return Err(SchemaViolation::TooLong {
                name: name.to_string(),
                length,
                max,
            });
        }
    }

    if let Some(allowed) = &schema.allowed_values {
        if !allowed.contains(value) {
            return Err(SchemaViolation::NotAllowed(name.to_string()));
        }
    }

    if let Some(n) = value.as_f64() {
        let below = schema.min.is_some_and(|min| n < min);
        let above = schema.max.is_some_and(|max| n > max);
        if below || above {
            return Err(SchemaViolation::OutOfRange {
                name: name.to_string(),
                value: n,
            });
        }
    }

    Ok(())
}
