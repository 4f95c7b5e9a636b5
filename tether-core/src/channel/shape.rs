//! Declared payload shapes and structural checking.
//!
//! Object shapes list required fields only; extra keys pass. Mismatches are
//! reported with a JSON path, e.g. `$.b: expected number, found string`.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Any,
    Null,
    Bool,
    Number,
    /// A number with no fractional part.
    Integer,
    String,
    Array(Box<Shape>),
    Object(Vec<(String, Shape)>),
    /// `null` or absent.
    Optional(Box<Shape>),
    OneOf(Vec<Shape>),
}

impl Shape {
    pub fn array(item: Shape) -> Self {
        Shape::Array(Box::new(item))
    }

    pub fn optional(inner: Shape) -> Self {
        Shape::Optional(Box::new(inner))
    }

    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Shape)>,
        K: Into<String>,
    {
        Shape::Object(fields.into_iter().map(|(k, s)| (k.into(), s)).collect())
    }

    /// Check `value` against this shape.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        self.check_at("$", value)
    }

    /// Same as checking against `Shape::Object(fields)`, without building it.
    pub fn check_fields(fields: &[(String, Shape)], value: &Value) -> Result<(), String> {
        match value {
            Value::Object(map) => check_fields_at("$", fields, map),
            other => Err(format!("$: expected object, found {}", kind_of(other))),
        }
    }

    fn check_at(&self, path: &str, value: &Value) -> Result<(), String> {
        let ok = match (self, value) {
            (Shape::Any, _) => true,
            (Shape::Null, Value::Null) => true,
            (Shape::Bool, Value::Bool(_)) => true,
            (Shape::Number, Value::Number(_)) => true,
            (Shape::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            (Shape::String, Value::String(_)) => true,
            (Shape::Optional(_), Value::Null) => true,
            (Shape::Optional(inner), other) => return inner.check_at(path, other),
            (Shape::Array(item), Value::Array(items)) => {
                for (i, v) in items.iter().enumerate() {
                    item.check_at(&format!("{path}[{i}]"), v)?;
                }
                true
            }
            (Shape::Object(fields), Value::Object(map)) => {
                check_fields_at(path, fields, map)?;
                true
            }
            (Shape::OneOf(options), v) => options.iter().any(|s| s.check_at(path, v).is_ok()),
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(format!(
                "{path}: expected {}, found {}",
                self.describe(),
                kind_of(value)
            ))
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, Shape::Optional(_) | Shape::Any)
    }

    /// Short human-readable description used in mismatch messages.
    pub fn describe(&self) -> String {
        match self {
            Shape::Any => "any".into(),
            Shape::Null => "null".into(),
            Shape::Bool => "boolean".into(),
            Shape::Number => "number".into(),
            Shape::Integer => "integer".into(),
            Shape::String => "string".into(),
            Shape::Array(item) => format!("array of {}", item.describe()),
            Shape::Object(_) => "object".into(),
            Shape::Optional(inner) => format!("optional {}", inner.describe()),
            Shape::OneOf(options) => options
                .iter()
                .map(Shape::describe)
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }
}

fn check_fields_at(
    path: &str,
    fields: &[(String, Shape)],
    map: &Map<String, Value>,
) -> Result<(), String> {
    for (key, shape) in fields {
        let child = format!("{path}.{key}");
        match map.get(key) {
            Some(v) => shape.check_at(&child, v)?,
            None if shape.is_optional() => {}
            None => return Err(format!("{child}: missing required field")),
        }
    }
    Ok(())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
