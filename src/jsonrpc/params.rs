//! Declared parameter and result shapes.
//!
//! A [`ParamShape`] describes what a method accepts: positional arguments
//! with required, optional and variadic kinds, or named arguments with
//! required and optional names. Shapes are checked before an outbound call
//! is written and when an inbound request has a registered signature.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{kind_name, Params};

/// Coarse JSON type used in signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Any,
    Null,
    Bool,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::Null => value.is_null(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Number => value.is_number(),
            ValueKind::String => value.is_string(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Any => "any",
            ValueKind::Null => "null",
            ValueKind::Bool => "boolean",
            ValueKind::Integer => "integer",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }
}

/// Declared parameter shape of a method
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ParamShape {
    /// No validation
    #[default]
    Any,
    Positional {
        required: Vec<ValueKind>,
        optional: Vec<ValueKind>,
        /// Kind accepted for any number of trailing arguments
        rest: Option<ValueKind>,
    },
    Named {
        required: Vec<(String, ValueKind)>,
        optional: Vec<(String, ValueKind)>,
        allow_unknown: bool,
    },
}

impl ParamShape {
    pub fn positional() -> Self {
        ParamShape::Positional {
            required: Vec::new(),
            optional: Vec::new(),
            rest: None,
        }
    }

    pub fn named() -> Self {
        ParamShape::Named {
            required: Vec::new(),
            optional: Vec::new(),
            allow_unknown: false,
        }
    }

    /// Append a required positional argument
    pub fn arg(mut self, kind: ValueKind) -> Self {
        if let ParamShape::Positional { required, .. } = &mut self {
            required.push(kind);
        }
        self
    }

    /// Append an optional positional argument
    pub fn optional_arg(mut self, kind: ValueKind) -> Self {
        if let ParamShape::Positional { optional, .. } = &mut self {
            optional.push(kind);
        }
        self
    }

    /// Accept any number of trailing arguments of `kind`
    pub fn rest(mut self, kind: ValueKind) -> Self {
        if let ParamShape::Positional { rest, .. } = &mut self {
            *rest = Some(kind);
        }
        self
    }

    /// Add a required named parameter
    pub fn field(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        if let ParamShape::Named { required, .. } = &mut self {
            required.push((name.into(), kind));
        }
        self
    }

    /// Add an optional named parameter
    pub fn optional_field(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        if let ParamShape::Named { optional, .. } = &mut self {
            optional.push((name.into(), kind));
        }
        self
    }

    /// Let named parameters carry names that were not declared
    pub fn allow_unknown(mut self) -> Self {
        if let ParamShape::Named { allow_unknown, .. } = &mut self {
            *allow_unknown = true;
        }
        self
    }

    /// Minimum and maximum positional arity; `None` max means unbounded
    pub fn arity(&self) -> Option<(usize, Option<usize>)> {
        match self {
            ParamShape::Positional {
                required,
                optional,
                rest,
            } => {
                let max = match rest {
                    Some(_) => None,
                    None => Some(required.len() + optional.len()),
                };
                Some((required.len(), max))
            }
            _ => None,
        }
    }

    /// Check actual parameters against this shape
    pub fn validate(&self, params: &Params) -> Result<(), String> {
        match (self, params) {
            (ParamShape::Any, _) => Ok(()),
            (ParamShape::Positional { .. }, Params::Positional(items)) => {
                self.validate_positional(items)
            }
            (ParamShape::Positional { .. }, Params::Named(_)) => {
                Err("expected positional parameters, got named parameters".to_string())
            }
            (ParamShape::Named { .. }, Params::Named(map)) => self.validate_named(map),
            // 空の位置引数は空オブジェクトと同等に扱う
            (ParamShape::Named { .. }, Params::Positional(items)) if items.is_empty() => {
                self.validate_named(&serde_json::Map::new())
            }
            (ParamShape::Named { .. }, Params::Positional(_)) => {
                Err("expected named parameters, got positional parameters".to_string())
            }
        }
    }

    fn validate_positional(&self, items: &[Value]) -> Result<(), String> {
        let ParamShape::Positional {
            required,
            optional,
            rest,
        } = self
        else {
            return Ok(());
        };

        if let Some((min, max)) = self.arity() {
            if items.len() < min {
                return Err(format!(
                    "expected at least {} parameter(s), got {}",
                    min,
                    items.len()
                ));
            }
            if let Some(max) = max {
                if items.len() > max {
                    return Err(format!(
                        "expected at most {} parameter(s), got {}",
                        max,
                        items.len()
                    ));
                }
            }
        }

        let declared = required.iter().chain(optional.iter());
        for (index, value) in items.iter().enumerate() {
            let kind = declared
                .clone()
                .nth(index)
                .copied()
                .or(*rest)
                .unwrap_or(ValueKind::Any);
            if !kind.matches(value) {
                return Err(format!(
                    "parameter {} must be {}, got {}",
                    index,
                    kind.name(),
                    kind_name(value)
                ));
            }
        }
        Ok(())
    }

    fn validate_named(&self, map: &serde_json::Map<String, Value>) -> Result<(), String> {
        let ParamShape::Named {
            required,
            optional,
            allow_unknown,
        } = self
        else {
            return Ok(());
        };

        for (name, kind) in required {
            match map.get(name) {
                None => return Err(format!("missing required parameter `{}`", name)),
                Some(value) if !kind.matches(value) => {
                    return Err(format!(
                        "parameter `{}` must be {}, got {}",
                        name,
                        kind.name(),
                        kind_name(value)
                    ))
                }
                Some(_) => {}
            }
        }

        for (name, kind) in optional {
            if let Some(value) = map.get(name) {
                if !kind.matches(value) {
                    return Err(format!(
                        "parameter `{}` must be {}, got {}",
                        name,
                        kind.name(),
                        kind_name(value)
                    ));
                }
            }
        }

        if !allow_unknown {
            let declared = |key: &str| {
                required.iter().any(|(n, _)| n == key) || optional.iter().any(|(n, _)| n == key)
            };
            if let Some(unknown) = map.keys().find(|key| !declared(key.as_str())) {
                return Err(format!("unknown parameter `{}`", unknown));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn positional(values: Vec<Value>) -> Params {
        Params::Positional(values)
    }

    fn named(value: Value) -> Params {
        Params::from_value(Some(value)).unwrap()
    }

    #[test]
    fn test_positional_arity() {
        let shape = ParamShape::positional()
            .arg(ValueKind::String)
            .optional_arg(ValueKind::Integer);

        assert_eq!(shape.arity(), Some((1, Some(2))));
        assert!(shape.validate(&positional(vec![json!("a")])).is_ok());
        assert!(shape.validate(&positional(vec![json!("a"), json!(2)])).is_ok());

        let err = shape.validate(&positional(vec![])).unwrap_err();
        assert!(err.contains("at least 1"));

        let err = shape
            .validate(&positional(vec![json!("a"), json!(2), json!(3)]))
            .unwrap_err();
        assert!(err.contains("at most 2"));
    }

    #[test]
    fn test_positional_kinds_and_rest() {
        let shape = ParamShape::positional()
            .arg(ValueKind::Integer)
            .rest(ValueKind::String);

        assert_eq!(shape.arity(), Some((1, None)));
        assert!(shape
            .validate(&positional(vec![json!(1), json!("x"), json!("y")]))
            .is_ok());

        let err = shape
            .validate(&positional(vec![json!(1), json!("x"), json!(false)]))
            .unwrap_err();
        assert_eq!(err, "parameter 2 must be string, got boolean");

        let err = shape.validate(&positional(vec![json!(1.5)])).unwrap_err();
        assert!(err.contains("integer"));
    }

    #[test]
    fn test_named_required_and_optional() {
        let shape = ParamShape::named()
            .field("query", ValueKind::String)
            .optional_field("limit", ValueKind::Integer);

        assert!(shape.validate(&named(json!({"query": "x"}))).is_ok());
        assert!(shape
            .validate(&named(json!({"query": "x", "limit": 10})))
            .is_ok());

        let err = shape.validate(&named(json!({"limit": 10}))).unwrap_err();
        assert_eq!(err, "missing required parameter `query`");

        let err = shape
            .validate(&named(json!({"query": "x", "limit": "ten"})))
            .unwrap_err();
        assert!(err.contains("`limit` must be integer"));

        let err = shape
            .validate(&named(json!({"query": "x", "extra": 1})))
            .unwrap_err();
        assert_eq!(err, "unknown parameter `extra`");

        let lenient = shape.clone().allow_unknown();
        assert!(lenient
            .validate(&named(json!({"query": "x", "extra": 1})))
            .is_ok());
    }

    #[test]
    fn test_shape_mismatch() {
        let shape = ParamShape::named().field("a", ValueKind::Any);
        assert!(shape.validate(&positional(vec![json!(1)])).is_err());

        let shape = ParamShape::positional().arg(ValueKind::Any);
        assert!(shape.validate(&named(json!({"a": 1}))).is_err());
    }

    #[test]
    fn test_empty_positional_counts_as_empty_named() {
        let shape = ParamShape::named().optional_field("verbose", ValueKind::Bool);
        assert!(shape.validate(&Params::none()).is_ok());
    }

    #[test]
    fn test_any_accepts_everything() {
        assert!(ParamShape::Any.validate(&named(json!({"x": [1, 2]}))).is_ok());
        assert!(ParamShape::Any.validate(&positional(vec![json!(null)])).is_ok());
    }
}
