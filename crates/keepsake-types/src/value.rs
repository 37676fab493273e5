//! The dynamically typed attribute value.
//!
//! Attributes are schema-less: any module may store any of the shapes below
//! under any of its keys. At the persistence boundary a [`Value`] maps onto
//! the JSON model one-to-one, except that JSON numbers are narrowed to
//! [`Value::Int`] whenever the literal is an integer that fits in `i64`.
//!
//! | JSON | Value |
//! |------|-------|
//! | `null` | [`Value::Null`] |
//! | integer literal within `i64` | [`Value::Int`] |
//! | other number | [`Value::Float`] |
//! | integer literal outside `i64` | [`Value::Str`] (raw literal) |
//! | `true`/`false` | [`Value::Bool`] |
//! | string | [`Value::Str`] |
//! | object | [`Value::Struct`] |
//! | array | [`Value::List`] |

use std::collections::BTreeMap;

/// Errors raised when a [`Value`] cannot be encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    /// JSON has no representation for NaN or infinities.
    #[error("non-finite float cannot be encoded as JSON")]
    NonFiniteFloat,

    /// The value has a shape the requested type cannot be built from.
    #[error("cannot convert {found} into {expected}")]
    Mismatch {
        /// Name of the requested type.
        expected: &'static str,
        /// Shape of the stored value.
        found: &'static str,
    },

    /// A string or number could not be parsed into the requested type.
    #[error("cannot parse {input:?} as {expected}")]
    Parse {
        /// Name of the requested type.
        expected: &'static str,
        /// The offending input, truncated for logs.
        input: String,
    },

    /// A numeric value is outside the range of the requested type.
    #[error("value out of range for {expected}")]
    OutOfRange {
        /// Name of the requested type.
        expected: &'static str,
    },

    /// Structured (serde) conversion failed.
    #[error("structured conversion failed: {0}")]
    Structured(String),
}

/// A single attribute value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// Explicit absence.
    #[default]
    Null,
    /// Signed 64-bit integer.
    Int(i64),
    /// Double precision float.
    Float(f64),
    /// Boolean flag.
    Bool(bool),
    /// UTF-8 text.
    Str(String),
    /// Nested key/value structure, ordered by key.
    Struct(BTreeMap<String, Value>),
    /// Ordered list of values.
    List(Vec<Value>),
}

impl Value {
    /// Short name of the variant, used in conversion errors and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::Struct(_) => "struct",
            Self::List(_) => "list",
        }
    }

    /// Whether this is [`Value::Null`].
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this value takes part in numeric delta reconciliation.
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    /// Build a value from its JSON representation.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if n.is_f64() {
                    n.as_f64().map_or_else(|| Self::Str(n.to_string()), Self::Float)
                } else {
                    // Integer literal beyond i64: keep the digits intact.
                    Self::Str(n.to_string())
                }
            }
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Struct(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Encode this value as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::NonFiniteFloat`] if this value (or anything
    /// nested in it) is a NaN or infinite float.
    pub fn to_json(&self) -> Result<serde_json::Value, ValueError> {
        Ok(match self {
            Self::Null => serde_json::Value::Null,
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or(ValueError::NonFiniteFloat)?,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Struct(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                serde_json::Value::Object(out)
            }
            Self::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(Self::to_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        })
    }
}

/// Infallible conversions used when declaring defaults.
macro_rules! impl_from_for_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_for_value! {
    i64 => Int,
    i32 => Int,
    u32 => Int,
    f64 => Float,
    f32 => Float,
    bool => Bool,
    String => Str,
    &str => Str,
    Vec<Value> => List,
    BTreeMap<String, Value> => Struct,
}

impl core::fmt::Display for Value {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Str(s) => f.write_str(s),
            Self::Struct(_) | Self::List(_) => match self.to_json() {
                Ok(json) => write!(f, "{json}"),
                Err(_) => f.write_str(self.kind()),
            },
        }
    }
}
