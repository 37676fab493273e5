//! Typed access to dynamically typed attribute values.
//!
//! [`Attribute`] is the explicit, total conversion between a host type and
//! [`Value`]. Reads are lenient: numbers widen, integral floats narrow,
//! strings are parsed, and structured values round-trip through JSON. Writes
//! are exact.
//!
//! Arbitrary serde types are stored through the [`Structured`] wrapper.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::value::{Value, ValueError};

/// 2^63, the first float outside the `i64` range.
const I64_FLOAT_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// Conversion between a host type and a stored [`Value`].
pub trait Attribute: Sized {
    /// Human-readable type name for conversion errors.
    const TYPE_NAME: &'static str;

    /// Coerce a stored value into this type.
    fn from_value(value: &Value) -> Result<Self, ValueError>;

    /// Encode this value for storage.
    fn to_value(&self) -> Result<Value, ValueError>;
}

impl Attribute for Value {
    const TYPE_NAME: &'static str = "value";

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        Ok(value.clone())
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        Ok(self.clone())
    }
}

fn truncate_for_error(input: &str) -> String {
    input.chars().take(32).collect()
}

fn float_to_i64(f: f64, expected: &'static str) -> Result<i64, ValueError> {
    if !f.is_finite() || f.fract() != 0.0 {
        return Err(ValueError::Parse {
            expected,
            input: f.to_string(),
        });
    }
    if !(-I64_FLOAT_LIMIT..I64_FLOAT_LIMIT).contains(&f) {
        return Err(ValueError::OutOfRange { expected });
    }
    // Range and integrality checked above.
    #[allow(clippy::cast_possible_truncation)]
    let narrowed = f as i64;
    Ok(narrowed)
}

#[allow(clippy::cast_precision_loss)]
const fn i64_to_f64(i: i64) -> f64 {
    i as f64
}

fn coerce_i64(value: &Value, expected: &'static str) -> Result<i64, ValueError> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Float(f) => float_to_i64(*f, expected),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Str(s) => {
            let trimmed = s.trim();
            trimmed.parse::<i64>().or_else(|_| {
                trimmed
                    .parse::<f64>()
                    .map_err(|_| ValueError::Parse {
                        expected,
                        input: truncate_for_error(s),
                    })
                    .and_then(|f| float_to_i64(f, expected))
            })
        }
        other => Err(ValueError::Mismatch {
            expected,
            found: other.kind(),
        }),
    }
}

fn coerce_f64(value: &Value, expected: &'static str) -> Result<f64, ValueError> {
    match value {
        Value::Int(i) => Ok(i64_to_f64(*i)),
        Value::Float(f) => Ok(*f),
        Value::Str(s) => s.trim().parse::<f64>().map_err(|_| ValueError::Parse {
            expected,
            input: truncate_for_error(s),
        }),
        other => Err(ValueError::Mismatch {
            expected,
            found: other.kind(),
        }),
    }
}

impl Attribute for i64 {
    const TYPE_NAME: &'static str = "i64";

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        coerce_i64(value, Self::TYPE_NAME)
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        Ok(Value::Int(*self))
    }
}

/// Integer types narrower than `i64` (or unsigned) go through `i64`.
macro_rules! impl_integer_attribute {
    ($($ty:ty),*) => {
        $(
            impl Attribute for $ty {
                const TYPE_NAME: &'static str = stringify!($ty);

                fn from_value(value: &Value) -> Result<Self, ValueError> {
                    let wide = coerce_i64(value, Self::TYPE_NAME)?;
                    <$ty>::try_from(wide).map_err(|_| ValueError::OutOfRange {
                        expected: Self::TYPE_NAME,
                    })
                }

                fn to_value(&self) -> Result<Value, ValueError> {
                    i64::try_from(*self)
                        .map(Value::Int)
                        .map_err(|_| ValueError::OutOfRange { expected: "i64" })
                }
            }
        )*
    };
}

impl_integer_attribute!(i32, u32, u64);

impl Attribute for f64 {
    const TYPE_NAME: &'static str = "f64";

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        coerce_f64(value, Self::TYPE_NAME)
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        Ok(Value::Float(*self))
    }
}

impl Attribute for f32 {
    const TYPE_NAME: &'static str = "f32";

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        let wide = coerce_f64(value, Self::TYPE_NAME)?;
        if wide.is_finite() && wide.abs() > f64::from(Self::MAX) {
            return Err(ValueError::OutOfRange {
                expected: Self::TYPE_NAME,
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let narrowed = wide as Self;
        Ok(narrowed)
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        Ok(Value::Float(f64::from(*self)))
    }
}

impl Attribute for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            Value::Int(i) => Err(ValueError::Parse {
                expected: Self::TYPE_NAME,
                input: i.to_string(),
            }),
            Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(ValueError::Parse {
                    expected: Self::TYPE_NAME,
                    input: truncate_for_error(s),
                }),
            },
            other => Err(ValueError::Mismatch {
                expected: Self::TYPE_NAME,
                found: other.kind(),
            }),
        }
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        Ok(Value::Bool(*self))
    }
}

impl Attribute for String {
    const TYPE_NAME: &'static str = "string";

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Err(ValueError::Mismatch {
                expected: Self::TYPE_NAME,
                found: value.kind(),
            }),
            Value::Str(s) => Ok(s.clone()),
            Value::Struct(_) | Value::List(_) => Ok(value.to_json()?.to_string()),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(value.to_string()),
        }
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        Ok(Value::Str(self.clone()))
    }
}

/// Parse JSON text stored in a string slot into a structured value.
fn parse_embedded(s: &str, expected: &'static str) -> Result<Value, ValueError> {
    serde_json::from_str::<serde_json::Value>(s)
        .map(Value::from_json)
        .map_err(|_| ValueError::Parse {
            expected,
            input: truncate_for_error(s),
        })
}

impl<T: Attribute> Attribute for Vec<T> {
    const TYPE_NAME: &'static str = "list";

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::List(items) => items.iter().map(T::from_value).collect(),
            Value::Str(s) => match parse_embedded(s, Self::TYPE_NAME)? {
                Value::List(items) => items.iter().map(T::from_value).collect(),
                other => Err(ValueError::Mismatch {
                    expected: Self::TYPE_NAME,
                    found: other.kind(),
                }),
            },
            other => Err(ValueError::Mismatch {
                expected: Self::TYPE_NAME,
                found: other.kind(),
            }),
        }
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        self.iter()
            .map(T::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List)
    }
}

impl<T: Attribute> Attribute for BTreeMap<String, T> {
    const TYPE_NAME: &'static str = "map";

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        let convert = |map: &BTreeMap<String, Value>| {
            map.iter()
                .map(|(k, v)| T::from_value(v).map(|t| (k.clone(), t)))
                .collect()
        };
        match value {
            Value::Struct(map) => convert(map),
            Value::Str(s) => match parse_embedded(s, Self::TYPE_NAME)? {
                Value::Struct(map) => convert(&map),
                other => Err(ValueError::Mismatch {
                    expected: Self::TYPE_NAME,
                    found: other.kind(),
                }),
            },
            other => Err(ValueError::Mismatch {
                expected: Self::TYPE_NAME,
                found: other.kind(),
            }),
        }
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        self.iter()
            .map(|(k, v)| v.to_value().map(|v| (k.clone(), v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Value::Struct)
    }
}

impl<T: Attribute> Attribute for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        self.as_ref().map_or(Ok(Value::Null), T::to_value)
    }
}

/// Stores any serde type as a structured value.
///
/// ```
/// use keepsake_types::{Attribute, Structured, Value};
///
/// #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
/// struct Loadout { slot: u8, item: String }
///
/// let stored = Structured(Loadout { slot: 1, item: "bow".into() }).to_value().unwrap();
/// assert!(matches!(stored, Value::Struct(_)));
/// let back = Structured::<Loadout>::from_value(&stored).unwrap();
/// assert_eq!(back.0.item, "bow");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structured<T>(pub T);

impl<T: Serialize + DeserializeOwned> Attribute for Structured<T> {
    const TYPE_NAME: &'static str = "structured";

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        let json = match value {
            Value::Str(s) => serde_json::from_str::<serde_json::Value>(s)
                .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
            other => other.to_json()?,
        };
        serde_json::from_value(json)
            .map(Self)
            .map_err(|e| ValueError::Structured(e.to_string()))
    }

    fn to_value(&self) -> Result<Value, ValueError> {
        serde_json::to_value(&self.0)
            .map(Value::from_json)
            .map_err(|e| ValueError::Structured(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_widen_and_parse() {
        assert_eq!(i64::from_value(&Value::Int(5)), Ok(5));
        assert_eq!(i64::from_value(&Value::Float(6.0)), Ok(6));
        assert_eq!(i64::from_value(&Value::Str(" 12 ".to_owned())), Ok(12));
        assert_eq!(i64::from_value(&Value::Str("3.0".to_owned())), Ok(3));
        assert!(i64::from_value(&Value::Float(6.5)).is_err());
        assert!(i64::from_value(&Value::Float(1e19)).is_err());
    }

    #[test]
    fn narrow_integers_check_range() {
        assert_eq!(u32::from_value(&Value::Int(7)), Ok(7));
        assert!(u32::from_value(&Value::Int(-1)).is_err());
        assert!(i32::from_value(&Value::Int(i64::MAX)).is_err());
        assert!(u64::MAX.to_value().is_err());
    }

    #[test]
    fn floats_accept_integers() {
        assert_eq!(f64::from_value(&Value::Int(2)), Ok(2.0));
        assert_eq!(f64::from_value(&Value::Str("0.25".to_owned())), Ok(0.25));
        assert!(f64::from_value(&Value::Bool(true)).is_err());
    }

    #[test]
    fn booleans_accept_common_spellings() {
        assert_eq!(bool::from_value(&Value::Str("TRUE".to_owned())), Ok(true));
        assert_eq!(bool::from_value(&Value::Int(0)), Ok(false));
        assert!(bool::from_value(&Value::Str("maybe".to_owned())).is_err());
        assert_eq!(bool::from_value(&Value::Int(1)), Ok(true));
        assert!(bool::from_value(&Value::Int(42)).is_err());
        assert!(bool::from_value(&Value::Int(-1)).is_err());
    }

    #[test]
    fn strings_render_scalars() {
        assert_eq!(String::from_value(&Value::Int(9)), Ok("9".to_owned()));
        assert_eq!(String::from_value(&Value::Bool(false)), Ok("false".to_owned()));
        assert!(String::from_value(&Value::Null).is_err());
    }

    #[test]
    fn lists_parse_embedded_json() {
        let stored = Value::Str("[1, 2, 3]".to_owned());
        assert_eq!(Vec::<i64>::from_value(&stored), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn maps_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("gold".to_owned(), 3_i64);
        let stored = map.to_value();
        assert!(matches!(stored, Ok(Value::Struct(_))));
        let back = stored.and_then(|v| BTreeMap::<String, i64>::from_value(&v));
        assert_eq!(back, Ok(map));
    }

    #[test]
    fn options_map_null() {
        assert_eq!(Option::<i64>::from_value(&Value::Null), Ok(None));
        assert_eq!(Option::<i64>::from_value(&Value::Int(1)), Ok(Some(1)));
        assert_eq!(None::<i64>.to_value(), Ok(Value::Null));
    }

    #[test]
    fn structured_accepts_json_text() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Pos {
            x: i32,
            y: i32,
        }
        let stored = Value::Str(r#"{"x":1,"y":2}"#.to_owned());
        let pos = Structured::<Pos>::from_value(&stored);
        assert_eq!(pos, Ok(Structured(Pos { x: 1, y: 2 })));
    }
}
