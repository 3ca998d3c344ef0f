//! Self-describing, type-tagged value codec.
//!
//! Every [`Value`] begins with a one-byte tag followed by a tag-specific
//! body. This is the payload format carried inside every [`htcp_wire::Frame`]
//! (this crate does not depend on `htcp-wire`; it only deals in byte slices).
//!
//! ```text
//! 0  null       -
//! 1  bool       1 byte (0/1)
//! 2  int64      8 bytes big-endian, two's complement
//! 3  float64    8 bytes IEEE-754 big-endian
//! 4  string     4-byte length, UTF-8 bytes
//! 5  bytes      4-byte length, raw bytes
//! 6  sequence   4-byte count, then N encoded values
//! 7  mapping    4-byte count, then N x (string key, value)
//! 8  record     string type_name, then a mapping payload
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;
use std::io::Cursor;

mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const INT: u8 = 2;
    pub const FLOAT: u8 = 3;
    pub const STRING: u8 = 4;
    pub const BYTES: u8 = 5;
    pub const SEQ: u8 = 6;
    pub const MAP: u8 = 7;
    pub const RECORD: u8 = 8;
}

/// An ordered string-keyed mapping, used for both generic maps and record fields.
pub type Fields = IndexMap<String, Value>;

/// A value in the HTCP wire tag set.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Map(Fields),
    /// `(type_name, fields)` — surfaced when no target type was supplied to the decoder.
    Record(String, Fields),
}

/// Error produced while encoding or decoding a [`Value`], or while binding
/// one into a user type via [`Record`]/[`FromValue`].
#[derive(Debug)]
pub enum EncodingError {
    UnexpectedEof,
    UnknownTag(u8),
    InvalidUtf8,
    TrailingBytes(usize),
    /// A declared, non-defaulted record field had no matching entry in the mapping.
    MissingField(String),
    TypeMismatch { expected: &'static str, found: String },
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::UnexpectedEof => write!(f, "value truncated before its body ended"),
            EncodingError::UnknownTag(t) => write!(f, "unknown value tag {t}"),
            EncodingError::InvalidUtf8 => write!(f, "string field was not valid UTF-8"),
            EncodingError::TrailingBytes(n) => {
                write!(f, "{n} bytes left over after decoding one value")
            }
            EncodingError::MissingField(name) => {
                write!(f, "missing required field `{name}`")
            }
            EncodingError::TypeMismatch { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<std::io::Error> for EncodingError {
    fn from(_: std::io::Error) -> Self {
        EncodingError::UnexpectedEof
    }
}

/// Encode a value to its wire representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(tag::NULL),
        Value::Bool(b) => {
            buf.push(tag::BOOL);
            buf.push(*b as u8);
        }
        Value::Int(i) => {
            buf.push(tag::INT);
            buf.write_i64::<BigEndian>(*i).expect("write to Vec never fails");
        }
        Value::Float(f) => {
            buf.push(tag::FLOAT);
            buf.write_f64::<BigEndian>(*f).expect("write to Vec never fails");
        }
        Value::String(s) => {
            buf.push(tag::STRING);
            write_bytes(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(tag::BYTES);
            write_bytes(buf, b);
        }
        Value::Seq(items) => {
            buf.push(tag::SEQ);
            buf.write_u32::<BigEndian>(items.len() as u32)
                .expect("write to Vec never fails");
            for item in items {
                encode_into(item, buf);
            }
        }
        Value::Map(fields) => {
            buf.push(tag::MAP);
            encode_fields(fields, buf);
        }
        Value::Record(type_name, fields) => {
            buf.push(tag::RECORD);
            write_bytes(buf, type_name.as_bytes());
            encode_fields(fields, buf);
        }
    }
}

fn encode_fields(fields: &Fields, buf: &mut Vec<u8>) {
    buf.write_u32::<BigEndian>(fields.len() as u32)
        .expect("write to Vec never fails");
    for (key, value) in fields {
        write_bytes(buf, key.as_bytes());
        encode_into(value, buf);
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.write_u32::<BigEndian>(bytes.len() as u32)
        .expect("write to Vec never fails");
    buf.extend_from_slice(bytes);
}

/// Decode a single value, requiring that it accounts for every byte in `input`.
pub fn decode(input: &[u8]) -> Result<Value, EncodingError> {
    let mut cursor = Cursor::new(input);
    let value = decode_from(&mut cursor)?;
    let remaining = input.len() as u64 - cursor.position();
    if remaining != 0 {
        return Err(EncodingError::TrailingBytes(remaining as usize));
    }
    Ok(value)
}

fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Value, EncodingError> {
    let tag = cursor.read_u8()?;
    Ok(match tag {
        tag::NULL => Value::Null,
        tag::BOOL => Value::Bool(cursor.read_u8()? != 0),
        tag::INT => Value::Int(cursor.read_i64::<BigEndian>()?),
        tag::FLOAT => Value::Float(cursor.read_f64::<BigEndian>()?),
        tag::STRING => Value::String(read_string(cursor)?),
        tag::BYTES => Value::Bytes(read_bytes(cursor)?),
        tag::SEQ => {
            let count = cursor.read_u32::<BigEndian>()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_from(cursor)?);
            }
            Value::Seq(items)
        }
        tag::MAP => Value::Map(decode_fields(cursor)?),
        tag::RECORD => {
            let type_name = read_string(cursor)?;
            Value::Record(type_name, decode_fields(cursor)?)
        }
        other => return Err(EncodingError::UnknownTag(other)),
    })
}

fn decode_fields(cursor: &mut Cursor<&[u8]>) -> Result<Fields, EncodingError> {
    let count = cursor.read_u32::<BigEndian>()?;
    let mut fields = Fields::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_string(cursor)?;
        let value = decode_from(cursor)?;
        fields.insert(key, value);
    }
    Ok(fields)
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, EncodingError> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let start = cursor.position() as usize;
    let input = cursor.get_ref();
    if start + len > input.len() {
        return Err(EncodingError::UnexpectedEof);
    }
    let bytes = input[start..start + len].to_vec();
    cursor.set_position((start + len) as u64);
    Ok(bytes)
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, EncodingError> {
    let bytes = read_bytes(cursor)?;
    String::from_utf8(bytes).map_err(|_| EncodingError::InvalidUtf8)
}

/// Converts a Rust type into a [`Value`].
pub trait ToValue {
    fn to_value(&self) -> Value;
}

/// Converts a [`Value`] back into a Rust type, failing with [`EncodingError`]
/// when the shape doesn't match.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, EncodingError>;
}

/// A user-defined record type: a flat, ordered field-name to [`Value`] mapping.
///
/// Implement this by hand for any struct that should round-trip through
/// [`Value::Record`]. A blanket
/// [`ToValue`]/[`FromValue`] impl below wraps the fields with `TYPE_NAME`.
pub trait Record: Sized {
    const TYPE_NAME: &'static str;

    fn to_fields(&self) -> Fields;
    fn from_fields(fields: Fields) -> Result<Self, EncodingError>;
}

impl<T: Record> ToValue for T {
    fn to_value(&self) -> Value {
        Value::Record(Self::TYPE_NAME.to_string(), self.to_fields())
    }
}

impl<T: Record> FromValue for T {
    fn from_value(value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::Record(_, fields) => T::from_fields(fields),
            Value::Map(fields) => T::from_fields(fields),
            other => Err(EncodingError::TypeMismatch {
                expected: "record",
                found: other.type_name(),
            }),
        }
    }
}

/// Take a named field out of a decoded field mapping, applying a default
/// when absent. Used by generated/hand-written [`Record::from_fields`] bodies.
pub fn take_field(fields: &mut Fields, name: &str) -> Option<Value> {
    fields.shift_remove(name)
}

/// Require a named field, failing with [`EncodingError::MissingField`] when absent.
pub fn require_field(fields: &mut Fields, name: &str) -> Result<Value, EncodingError> {
    take_field(fields, name).ok_or_else(|| EncodingError::MissingField(name.to_string()))
}

impl Value {
    /// A short, human-readable name for this value's shape (used in error messages).
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "mapping",
            Value::Record(..) => "record",
        }
        .to_string()
    }
}

macro_rules! impl_scalar_value {
    ($ty:ty, $to:expr, $variant:ident, $expected:literal) => {
        impl ToValue for $ty {
            fn to_value(&self) -> Value {
                #[allow(clippy::redundant_closure_call)]
                $to(self)
            }
        }

        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self, EncodingError> {
                match value {
                    Value::$variant(v) => Ok(v as $ty),
                    other => Err(EncodingError::TypeMismatch {
                        expected: $expected,
                        found: other.type_name(),
                    }),
                }
            }
        }
    };
}

impl ToValue for () {
    fn to_value(&self) -> Value {
        Value::Null
    }
}

impl FromValue for () {
    fn from_value(value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::Null => Ok(()),
            other => Err(EncodingError::TypeMismatch {
                expected: "null",
                found: other.type_name(),
            }),
        }
    }
}

impl_scalar_value!(bool, |v: &bool| Value::Bool(*v), Bool, "bool");
impl_scalar_value!(i64, |v: &i64| Value::Int(*v), Int, "int");
impl_scalar_value!(f64, |v: &f64| Value::Float(*v), Float, "float");

impl ToValue for i32 {
    fn to_value(&self) -> Value {
        Value::Int(*self as i64)
    }
}

impl FromValue for i32 {
    fn from_value(value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::Int(v) => Ok(v as i32),
            other => Err(EncodingError::TypeMismatch {
                expected: "int",
                found: other.type_name(),
            }),
        }
    }
}

impl ToValue for u64 {
    fn to_value(&self) -> Value {
        Value::Int(*self as i64)
    }
}

impl FromValue for u64 {
    fn from_value(value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::Int(v) => Ok(v as u64),
            other => Err(EncodingError::TypeMismatch {
                expected: "int",
                found: other.type_name(),
            }),
        }
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(EncodingError::TypeMismatch {
                expected: "string",
                found: other.type_name(),
            }),
        }
    }
}

impl ToValue for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(EncodingError::TypeMismatch {
                expected: "bytes",
                found: other.type_name(),
            }),
        }
    }
}

impl<T: ToValue> ToValue for Vec<T> {
    fn to_value(&self) -> Value {
        Value::Seq(self.iter().map(|v| v.to_value()).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::Seq(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(EncodingError::TypeMismatch {
                expected: "sequence",
                found: other.type_name(),
            }),
        }
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, EncodingError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, EncodingError> {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let encoded = encode(&v);
        let decoded = decode(&encoded).expect("decode should succeed");
        assert_eq!(decoded, v);
    }

    #[test]
    fn scalars_round_trip() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(-12345));
        roundtrip(Value::Int(i64::MIN));
        roundtrip(Value::Float(3.5));
        roundtrip(Value::String("hello, world".into()));
        roundtrip(Value::Bytes(vec![0, 1, 2, 255]));
    }

    #[test]
    fn containers_round_trip() {
        roundtrip(Value::Seq(vec![Value::Int(1), Value::Bool(false), Value::Null]));

        let mut fields = Fields::new();
        fields.insert("a".into(), Value::Int(1));
        fields.insert("b".into(), Value::String("x".into()));
        roundtrip(Value::Map(fields.clone()));
        roundtrip(Value::Record("MyType".into(), fields));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode(&Value::Int(1));
        bytes.push(0xFF);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, EncodingError::TrailingBytes(1)));
    }

    #[test]
    fn rejects_unknown_tag() {
        let err = decode(&[0xEE]).unwrap_err();
        assert!(matches!(err, EncodingError::UnknownTag(0xEE)));
    }

    struct Greeting {
        text: String,
        count: i64,
    }

    impl Record for Greeting {
        const TYPE_NAME: &'static str = "Greeting";

        fn to_fields(&self) -> Fields {
            let mut fields = Fields::new();
            fields.insert("text".into(), self.text.to_value());
            fields.insert("count".into(), self.count.to_value());
            fields
        }

        fn from_fields(mut fields: Fields) -> Result<Self, EncodingError> {
            Ok(Self {
                text: String::from_value(require_field(&mut fields, "text")?)?,
                count: i64::from_value(require_field(&mut fields, "count")?)?,
            })
        }
    }

    #[test]
    fn record_round_trips_by_field_name() {
        let g = Greeting {
            text: "hi".into(),
            count: 3,
        };
        let value = g.to_value();
        let encoded = encode(&value);
        let decoded = decode(&encoded).unwrap();
        let back = Greeting::from_value(decoded).unwrap();
        assert_eq!(back.text, "hi");
        assert_eq!(back.count, 3);
    }

    #[test]
    fn record_decode_fails_on_missing_field() {
        let mut fields = Fields::new();
        fields.insert("text".into(), Value::String("hi".into()));
        let value = Value::Record("Greeting".into(), fields);
        let err = Greeting::from_value(value).unwrap_err();
        assert!(matches!(err, EncodingError::MissingField(name) if name == "count"));
    }
}
