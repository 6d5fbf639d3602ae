//! Dynamic values seen by compiled expressions.

use crate::types::Value;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A callable record field, e.g. `tag('x')`.
pub type QueryFn = Arc<dyn Fn(&[QValue]) -> QValue + Send + Sync>;

/// Value of a query record field or of an evaluated expression.
///
/// Comparison is loose: numbers compare equal to their string forms and
/// booleans compare as 0/1.
#[derive(Clone, Default)]
pub enum QValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Regex(Arc<Regex>),
    Function(QueryFn),
}

impl QValue {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[QValue]) -> QValue + Send + Sync + 'static,
    {
        QValue::Function(Arc::new(f))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, QValue::Undefined)
    }

    pub fn truthy(&self) -> bool {
        match self {
            QValue::Undefined | QValue::Null => false,
            QValue::Bool(b) => *b,
            QValue::Number(n) => *n != 0.0 && !n.is_nan(),
            QValue::Str(s) => !s.is_empty(),
            QValue::Regex(_) | QValue::Function(_) => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            QValue::Null => 0.0,
            QValue::Bool(b) => f64::from(u8::from(*b)),
            QValue::Number(n) => *n,
            QValue::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            QValue::Undefined | QValue::Regex(_) | QValue::Function(_) => f64::NAN,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            QValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            QValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn loose_eq(&self, other: &QValue) -> bool {
        use QValue::*;
        match (self, other) {
            (Undefined | Null, Undefined | Null) => true,
            (Undefined | Null, _) | (_, Undefined | Null) => false,
            (Str(a), Str(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Regex(a), Regex(b)) => Arc::ptr_eq(a, b),
            (Function(a), Function(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            (Regex(_) | Function(_), _) | (_, Regex(_) | Function(_)) => false,
            _ => self.to_number() == other.to_number(),
        }
    }

    /// Ordering used by relational operators and order-by; `None` when the
    /// values are not comparable.
    pub fn compare(&self, other: &QValue) -> Option<Ordering> {
        match (self, other) {
            (QValue::Str(a), QValue::Str(b)) => Some(a.cmp(b)),
            (QValue::Undefined, _) | (_, QValue::Undefined) => None,
            _ => self.to_number().partial_cmp(&other.to_number()),
        }
    }

    /// Converts a captured JSON value. Arrays and objects become their JSON
    /// text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => QValue::Null,
            Value::Bool(b) => QValue::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(QValue::Undefined, QValue::Number),
            Value::String(s) => QValue::Str(s.clone()),
            other => QValue::Str(other.to_string()),
        }
    }
}

impl From<bool> for QValue {
    fn from(value: bool) -> Self {
        QValue::Bool(value)
    }
}

impl From<f64> for QValue {
    fn from(value: f64) -> Self {
        QValue::Number(value)
    }
}

impl From<usize> for QValue {
    fn from(value: usize) -> Self {
        QValue::Number(value as f64)
    }
}

impl From<u64> for QValue {
    fn from(value: u64) -> Self {
        QValue::Number(value as f64)
    }
}

impl From<&str> for QValue {
    fn from(value: &str) -> Self {
        QValue::Str(value.to_string())
    }
}

impl From<String> for QValue {
    fn from(value: String) -> Self {
        QValue::Str(value)
    }
}

impl<T: Into<QValue>> From<Option<T>> for QValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(QValue::Undefined, Into::into)
    }
}

impl fmt::Display for QValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QValue::Undefined => f.write_str("undefined"),
            QValue::Null => f.write_str("null"),
            QValue::Bool(b) => write!(f, "{b}"),
            QValue::Number(n) if n.fract() == 0.0 && n.is_finite() => write!(f, "{}", *n as i64),
            QValue::Number(n) => write!(f, "{n}"),
            QValue::Str(s) => f.write_str(s),
            QValue::Regex(regex) => write!(f, "/{}/", regex.as_str()),
            QValue::Function(_) => f.write_str("[function]"),
        }
    }
}

impl fmt::Debug for QValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QValue::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loose_equality() {
        assert!(QValue::from(42.0).loose_eq(&QValue::from("42")));
        assert!(QValue::from(true).loose_eq(&QValue::from(1.0)));
        assert!(QValue::Null.loose_eq(&QValue::Undefined));
        assert!(!QValue::Null.loose_eq(&QValue::from(0.0)));
        assert!(!QValue::from("a").loose_eq(&QValue::from("b")));
    }

    #[test]
    fn test_truthiness_and_compare() {
        assert!(!QValue::from("").truthy());
        assert!(!QValue::Number(f64::NAN).truthy());
        assert!(QValue::from("x").truthy());
        assert_eq!(
            QValue::from(2.0).compare(&QValue::from("10")),
            Some(Ordering::Less)
        );
        assert_eq!(QValue::Undefined.compare(&QValue::from(1.0)), None);
    }
}
