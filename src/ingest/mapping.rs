use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Expression that asks for a freshly generated identifier.
pub const FRESH_ID_TOKEN: &str = "NewGUID()";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping {index} is not an object")]
    NotAnObject { index: usize },
    #[error("mapping {index} has no `TargetField`")]
    MissingTarget { index: usize },
    #[error("mapping for `{target}` has no `Expression`")]
    MissingExpression { target: String },
    #[error("mapping for `{target}` has an invalid field reference `{expression}`")]
    InvalidFieldRef { target: String, expression: String },
}

/// The closed expression grammar: a literal, `{field}`, or [`FRESH_ID_TOKEN`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Literal(String),
    FieldRef(String),
    FreshId,
}

impl Expression {
    /// Parse a trimmed expression. Returns `None` for an empty one; a
    /// malformed `{...}` reference yields `Some(Err(..))`.
    fn parse(raw: &str) -> Option<Result<Self, String>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw == FRESH_ID_TOKEN {
            return Some(Ok(Expression::FreshId));
        }
        if let Some(inner) = raw.strip_prefix('{').and_then(|rest| rest.strip_suffix('}')) {
            let field = inner.trim();
            if field.is_empty() || field.contains(['{', '}']) {
                return Some(Err(raw.to_string()));
            }
            return Some(Ok(Expression::FieldRef(field.to_string())));
        }
        Some(Ok(Expression::Literal(raw.to_string())))
    }

    /// Evaluate against one source record. Field references fall back to
    /// the submission constants and resolve to `null` when absent from both.
    pub fn evaluate(&self, record: &Map<String, Value>, consts: &Map<String, Value>) -> Value {
        match self {
            Expression::Literal(text) => Value::String(text.clone()),
            Expression::FieldRef(field) => record
                .get(field)
                .or_else(|| consts.get(field))
                .cloned()
                .unwrap_or(Value::Null),
            Expression::FreshId => Value::String(Uuid::new_v4().to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMapping {
    #[serde(default)]
    target_field: Option<Value>,
    #[serde(default)]
    expression: Option<Value>,
    #[serde(default)]
    is_identifier: Option<Value>,
    #[serde(default)]
    import_field: Option<Value>,
}

/// A validated field mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub target: String,
    pub expression: Expression,
    pub is_identifier: bool,
    pub import_field: bool,
}

impl FieldMapping {
    pub fn compile(index: usize, raw: &Value) -> Result<Self, MappingError> {
        if !raw.is_object() {
            return Err(MappingError::NotAnObject { index });
        }
        let raw: RawMapping =
            serde_json::from_value(raw.clone()).map_err(|_| MappingError::NotAnObject { index })?;

        let target = raw
            .target_field
            .as_ref()
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|target| !target.is_empty())
            .ok_or(MappingError::MissingTarget { index })?
            .to_string();

        let expression = match raw
            .expression
            .as_ref()
            .and_then(Value::as_str)
            .and_then(Expression::parse)
        {
            Some(Ok(expression)) => expression,
            Some(Err(expression)) => {
                return Err(MappingError::InvalidFieldRef { target, expression });
            }
            None => return Err(MappingError::MissingExpression { target }),
        };

        Ok(Self {
            target,
            expression,
            is_identifier: flag(raw.is_identifier.as_ref()),
            import_field: flag(raw.import_field.as_ref()),
        })
    }
}

/// Compile every mapping, failing on the first invalid one.
pub fn compile_all(raw: &[Value]) -> Result<Vec<FieldMapping>, MappingError> {
    raw.iter()
        .enumerate()
        .map(|(index, mapping)| FieldMapping::compile(index, mapping))
        .collect()
}

// Producers send either JSON booleans or "true"/"false" strings.
fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => text.trim().eq_ignore_ascii_case("true"),
        Some(Value::Number(number)) => number.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{compile_all, Expression, FieldMapping, MappingError};
    use serde_json::{json, Map, Value};

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn grammar_covers_literal_field_and_fresh_id() {
        let mappings = compile_all(&[
            json!({"TargetField": "source", "Expression": " csv-import "}),
            json!({"TargetField": "host", "Expression": "{ hostname }"}),
            json!({"TargetField": "id", "Expression": "NewGUID()", "IsIdentifier": true, "ImportField": "true"}),
        ])
        .unwrap();
        assert_eq!(mappings[0].expression, Expression::Literal("csv-import".into()));
        assert_eq!(mappings[1].expression, Expression::FieldRef("hostname".into()));
        assert_eq!(mappings[2].expression, Expression::FreshId);
        assert!(mappings[2].is_identifier);
        assert!(mappings[2].import_field);
        assert!(!mappings[0].is_identifier);
    }

    #[test]
    fn field_refs_fall_back_to_consts_then_null() {
        let record = object(json!({"hostname": "ws-01", "cores": 8}));
        let consts = object(json!({"site": "HQ", "hostname": "ignored"}));
        let field = |name: &str| Expression::FieldRef(name.into());

        assert_eq!(field("hostname").evaluate(&record, &consts), json!("ws-01"));
        assert_eq!(field("cores").evaluate(&record, &consts), json!(8));
        assert_eq!(field("site").evaluate(&record, &consts), json!("HQ"));
        assert_eq!(
            field("transaction_id").evaluate(&record, &consts),
            Value::Null
        );
    }

    #[test]
    fn fresh_ids_are_unique() {
        let empty = Map::new();
        let a = Expression::FreshId.evaluate(&empty, &empty);
        let b = Expression::FreshId.evaluate(&empty, &empty);
        assert_ne!(a, b);
        assert_eq!(a.as_str().unwrap().len(), 36);
    }

    #[test]
    fn invalid_mappings_are_rejected() {
        assert_eq!(
            FieldMapping::compile(0, &json!({"Expression": "x"})),
            Err(MappingError::MissingTarget { index: 0 })
        );
        assert_eq!(
            FieldMapping::compile(1, &json!({"TargetField": " ", "Expression": "x"})),
            Err(MappingError::MissingTarget { index: 1 })
        );
        assert_eq!(
            FieldMapping::compile(0, &json!({"TargetField": "a", "Expression": "  "})),
            Err(MappingError::MissingExpression { target: "a".into() })
        );
        assert_eq!(
            FieldMapping::compile(0, &json!({"TargetField": "a", "Expression": 5})),
            Err(MappingError::MissingExpression { target: "a".into() })
        );
        assert!(matches!(
            FieldMapping::compile(0, &json!({"TargetField": "a", "Expression": "{}"})),
            Err(MappingError::InvalidFieldRef { .. })
        ));
        assert_eq!(
            FieldMapping::compile(2, &json!("TargetField")),
            Err(MappingError::NotAnObject { index: 2 })
        );
    }
}
