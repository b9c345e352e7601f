//! JSON ⇄ D-Bus value conversion (dbus-json3 encoding).
//!
//! - basic types map to JSON numbers, booleans and strings
//! - variants are `{"t": signature, "v": value}`
//! - `ay` is a base64 string
//! - dicts are JSON objects, non-string keys in their JSON text form
//! - structs are JSON arrays
//!
//! Unix fds (`h`) are not supported.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value};
use zvariant::{Array, Dict, ObjectPath, Signature, StructureBuilder, Value as ZValue};

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("invalid signature '{0}'")]
    Signature(String),

    #[error("expected a value of type '{signature}', got {got}")]
    Type { signature: String, got: String },

    #[error("signature '{signature}' takes {expected} arguments, got {got}")]
    Count {
        signature: String,
        expected: usize,
        got: usize,
    },

    #[error("unix fd passing is not supported")]
    UnixFd,

    #[error("invalid base64 byte array: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Variant(#[from] zvariant::Error),
}

impl ValueError {
    fn mismatch(ty: &SignatureType, got: &Value) -> Self {
        Self::Type {
            signature: ty.to_string(),
            got: got.to_string(),
        }
    }
}

/// One complete type of a D-Bus signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureType {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Variant,
    Array(Box<SignatureType>),
    Dict(Box<SignatureType>, Box<SignatureType>),
    Struct(Vec<SignatureType>),
}

impl SignatureType {
    fn basic(code: u8) -> Option<Self> {
        Some(match code {
            b'y' => Self::Byte,
            b'b' => Self::Boolean,
            b'n' => Self::Int16,
            b'q' => Self::UInt16,
            b'i' => Self::Int32,
            b'u' => Self::UInt32,
            b'x' => Self::Int64,
            b't' => Self::UInt64,
            b'd' => Self::Double,
            b's' => Self::String,
            b'o' => Self::ObjectPath,
            b'g' => Self::Signature,
            b'h' => Self::UnixFd,
            _ => return None,
        })
    }

    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Self::Variant | Self::Array(_) | Self::Dict(..) | Self::Struct(_)
        )
    }

    fn is_string_like(&self) -> bool {
        matches!(self, Self::String | Self::ObjectPath | Self::Signature)
    }

    fn zvariant_signature(&self) -> Result<Signature<'static>, ValueError> {
        Ok(Signature::try_from(self.to_string())?)
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::Byte => "y",
            Self::Boolean => "b",
            Self::Int16 => "n",
            Self::UInt16 => "q",
            Self::Int32 => "i",
            Self::UInt32 => "u",
            Self::Int64 => "x",
            Self::UInt64 => "t",
            Self::Double => "d",
            Self::String => "s",
            Self::ObjectPath => "o",
            Self::Signature => "g",
            Self::UnixFd => "h",
            Self::Variant => "v",
            Self::Array(element) => return write!(f, "a{element}"),
            Self::Dict(key, value) => return write!(f, "a{{{key}{value}}}"),
            Self::Struct(fields) => {
                f.write_str("(")?;
                for field in fields {
                    write!(f, "{field}")?;
                }
                return f.write_str(")");
            }
        };
        f.write_str(code)
    }
}

const MAX_DEPTH: usize = 64;

struct Parser<'a> {
    signature: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self) -> ValueError {
        ValueError::Signature(self.signature.to_string())
    }

    fn peek(&self) -> Option<u8> {
        self.signature.as_bytes().get(self.pos).copied()
    }

    fn next_type(&mut self, depth: usize) -> Result<SignatureType, ValueError> {
        if depth > MAX_DEPTH {
            return Err(self.error());
        }
        let code = self.peek().ok_or_else(|| self.error())?;
        self.pos += 1;

        if let Some(basic) = SignatureType::basic(code) {
            return Ok(basic);
        }
        match code {
            b'v' => Ok(SignatureType::Variant),
            b'a' if self.peek() == Some(b'{') => {
                self.pos += 1;
                let key = self.next_type(depth + 1)?;
                if !key.is_basic() {
                    return Err(self.error());
                }
                let value = self.next_type(depth + 1)?;
                if self.peek() != Some(b'}') {
                    return Err(self.error());
                }
                self.pos += 1;
                Ok(SignatureType::Dict(Box::new(key), Box::new(value)))
            }
            b'a' => Ok(SignatureType::Array(Box::new(self.next_type(depth + 1)?))),
            b'(' => {
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        Some(b')') => break,
                        Some(_) => fields.push(self.next_type(depth + 1)?),
                        None => return Err(self.error()),
                    }
                }
                self.pos += 1;
                if fields.is_empty() {
                    return Err(self.error());
                }
                Ok(SignatureType::Struct(fields))
            }
            _ => Err(self.error()),
        }
    }
}

/// Split a signature into its complete types.
pub fn parse_signature(signature: &str) -> Result<Vec<SignatureType>, ValueError> {
    let mut parser = Parser { signature, pos: 0 };
    let mut types = Vec::new();
    while parser.peek().is_some() {
        types.push(parser.next_type(0)?);
    }
    Ok(types)
}

/// Exactly one complete type, as required for a variant.
fn parse_single(signature: &str) -> Result<SignatureType, ValueError> {
    let mut types = parse_signature(signature)?;
    match (types.pop(), types.is_empty()) {
        (Some(ty), true) => Ok(ty),
        _ => Err(ValueError::Signature(signature.to_string())),
    }
}

pub fn encode_args(signature: &str, args: &[Value]) -> Result<Vec<ZValue<'static>>, ValueError> {
    let types = parse_signature(signature)?;
    if types.len() != args.len() {
        return Err(ValueError::Count {
            signature: signature.to_string(),
            expected: types.len(),
            got: args.len(),
        });
    }
    types
        .iter()
        .zip(args)
        .map(|(ty, arg)| encode_value(ty, arg))
        .collect()
}

fn signed<T: TryFrom<i64>>(ty: &SignatureType, value: &Value) -> Result<T, ValueError> {
    value
        .as_i64()
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| ValueError::mismatch(ty, value))
}

fn unsigned<T: TryFrom<u64>>(ty: &SignatureType, value: &Value) -> Result<T, ValueError> {
    value
        .as_u64()
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| ValueError::mismatch(ty, value))
}

fn string<'v>(ty: &SignatureType, value: &'v Value) -> Result<&'v str, ValueError> {
    value.as_str().ok_or_else(|| ValueError::mismatch(ty, value))
}

pub fn encode_value(ty: &SignatureType, value: &Value) -> Result<ZValue<'static>, ValueError> {
    Ok(match ty {
        SignatureType::Byte => ZValue::U8(unsigned(ty, value)?),
        SignatureType::Boolean => {
            ZValue::Bool(value.as_bool().ok_or_else(|| ValueError::mismatch(ty, value))?)
        }
        SignatureType::Int16 => ZValue::I16(signed(ty, value)?),
        SignatureType::UInt16 => ZValue::U16(unsigned(ty, value)?),
        SignatureType::Int32 => ZValue::I32(signed(ty, value)?),
        SignatureType::UInt32 => ZValue::U32(unsigned(ty, value)?),
        SignatureType::Int64 => ZValue::I64(signed(ty, value)?),
        SignatureType::UInt64 => ZValue::U64(unsigned(ty, value)?),
        SignatureType::Double => {
            ZValue::F64(value.as_f64().ok_or_else(|| ValueError::mismatch(ty, value))?)
        }
        SignatureType::String => ZValue::from(string(ty, value)?.to_string()),
        SignatureType::ObjectPath => {
            ZValue::ObjectPath(ObjectPath::try_from(string(ty, value)?.to_string())?)
        }
        SignatureType::Signature => {
            ZValue::Signature(Signature::try_from(string(ty, value)?.to_string())?)
        }
        SignatureType::UnixFd => return Err(ValueError::UnixFd),
        SignatureType::Variant => {
            let (Some(Value::String(signature)), Some(inner)) = (value.get("t"), value.get("v"))
            else {
                return Err(ValueError::mismatch(ty, value));
            };
            let inner_ty = parse_single(signature)?;
            ZValue::Value(Box::new(encode_value(&inner_ty, inner)?))
        }
        SignatureType::Array(element) if **element == SignatureType::Byte && value.is_string() => {
            ZValue::from(BASE64.decode(string(ty, value)?)?)
        }
        SignatureType::Array(element) => {
            let items = value.as_array().ok_or_else(|| ValueError::mismatch(ty, value))?;
            let mut array = Array::new(element.zvariant_signature()?);
            for item in items {
                array.append(encode_value(element, item)?)?;
            }
            ZValue::Array(array)
        }
        SignatureType::Dict(key_ty, value_ty) => {
            let entries = value.as_object().ok_or_else(|| ValueError::mismatch(ty, value))?;
            let mut dict = Dict::new(key_ty.zvariant_signature()?, value_ty.zvariant_signature()?);
            for (key, item) in entries {
                dict.append(encode_key(key_ty, key)?, encode_value(value_ty, item)?)?;
            }
            ZValue::Dict(dict)
        }
        SignatureType::Struct(fields) => {
            let items = value
                .as_array()
                .filter(|items| items.len() == fields.len())
                .ok_or_else(|| ValueError::mismatch(ty, value))?;
            let mut builder = StructureBuilder::new();
            for (field, item) in fields.iter().zip(items) {
                builder = builder.append_field(encode_value(field, item)?);
            }
            ZValue::Structure(builder.build())
        }
    })
}

/// Dict keys arrive as JSON object keys; non-string key types are parsed.
fn encode_key(ty: &SignatureType, key: &str) -> Result<ZValue<'static>, ValueError> {
    let parsed = if ty.is_string_like() {
        Value::String(key.to_string())
    } else {
        serde_json::from_str(key).map_err(|_| ValueError::Type {
            signature: ty.to_string(),
            got: key.to_string(),
        })?
    };
    encode_value(ty, &parsed)
}

pub fn decode_value(value: &ZValue<'_>) -> Value {
    match value {
        ZValue::U8(n) => Value::from(*n),
        ZValue::Bool(b) => Value::from(*b),
        ZValue::I16(n) => Value::from(*n),
        ZValue::U16(n) => Value::from(*n),
        ZValue::I32(n) => Value::from(*n),
        ZValue::U32(n) => Value::from(*n),
        ZValue::I64(n) => Value::from(*n),
        ZValue::U64(n) => Value::from(*n),
        ZValue::F64(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
        ZValue::Str(s) => Value::String(s.as_str().to_string()),
        ZValue::Signature(s) => Value::String(s.as_str().to_string()),
        ZValue::ObjectPath(p) => Value::String(p.as_str().to_string()),
        ZValue::Value(inner) => {
            let mut variant = Map::new();
            variant.insert("t".into(), Value::String(inner.value_signature().to_string()));
            variant.insert("v".into(), decode_value(inner));
            Value::Object(variant)
        }
        ZValue::Array(array) => decode_array(array),
        ZValue::Dict(dict) => Value::Object(
            dict.iter()
                .map(|(key, item)| (decode_key(key), decode_value(item)))
                .collect(),
        ),
        ZValue::Structure(structure) => {
            Value::Array(structure.fields().iter().map(decode_value).collect())
        }
        other => {
            tracing::warn!(signature = %other.value_signature(), "Unsupported D-Bus value");
            Value::Null
        }
    }
}

fn decode_array(array: &Array<'_>) -> Value {
    if array.element_signature().as_str() == "y" {
        let bytes: Vec<u8> = array
            .iter()
            .filter_map(|item| match item {
                ZValue::U8(b) => Some(*b),
                _ => None,
            })
            .collect();
        return Value::String(BASE64.encode(bytes));
    }
    Value::Array(array.iter().map(decode_value).collect())
}

fn decode_key(key: &ZValue<'_>) -> String {
    match decode_value(key) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Decode a message body (its top-level values) into dbus-json3 arguments.
pub fn decode_body(fields: &[ZValue<'_>]) -> Vec<Value> {
    fields.iter().map(decode_value).collect()
}
