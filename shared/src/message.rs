use crate::catalog::{MessageKind, MessageLayout, ScalarType, Shape};
use crate::error::{CodecError, CodecResult};
use std::fmt;

/// One scalar element of a message field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

macro_rules! le_read {
    ($t:ty, $bytes:expr) => {{
        let mut raw = [0u8; size_of::<$t>()];
        raw.copy_from_slice($bytes);
        <$t>::from_le_bytes(raw)
    }};
}

impl Value {
    pub fn ty(&self) -> ScalarType {
        match self {
            Value::U8(_) => ScalarType::U8,
            Value::I8(_) => ScalarType::I8,
            Value::U16(_) => ScalarType::U16,
            Value::I16(_) => ScalarType::I16,
            Value::U32(_) => ScalarType::U32,
            Value::I32(_) => ScalarType::I32,
            Value::U64(_) => ScalarType::U64,
            Value::I64(_) => ScalarType::I64,
            Value::F32(_) => ScalarType::F32,
            Value::F64(_) => ScalarType::F64,
        }
    }

    /// False only for NaN or infinite floats.
    pub fn is_finite(&self) -> bool {
        match *self {
            Value::F32(v) => v.is_finite(),
            Value::F64(v) => v.is_finite(),
            _ => true,
        }
    }

    /// `bytes` must be exactly `ty.size()` long.
    pub(crate) fn read_le(ty: ScalarType, bytes: &[u8]) -> Value {
        match ty {
            ScalarType::U8 => Value::U8(bytes[0]),
            ScalarType::I8 => Value::I8(le_read!(i8, bytes)),
            ScalarType::U16 => Value::U16(le_read!(u16, bytes)),
            ScalarType::I16 => Value::I16(le_read!(i16, bytes)),
            ScalarType::U32 => Value::U32(le_read!(u32, bytes)),
            ScalarType::I32 => Value::I32(le_read!(i32, bytes)),
            ScalarType::U64 => Value::U64(le_read!(u64, bytes)),
            ScalarType::I64 => Value::I64(le_read!(i64, bytes)),
            ScalarType::F32 => Value::F32(le_read!(f32, bytes)),
            ScalarType::F64 => Value::F64(le_read!(f64, bytes)),
        }
    }

    pub(crate) fn write_le(&self, out: &mut Vec<u8>) {
        match *self {
            Value::U8(v) => out.push(v),
            Value::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    /// Parse an operator-supplied token as `ty`. `field` only labels the error.
    pub fn parse(ty: ScalarType, token: &str, field: &'static str) -> CodecResult<Value> {
        let invalid = || CodecError::InvalidValue {
            field,
            ty,
            token: token.to_string(),
        };
        let value = match ty {
            ScalarType::U8 => Value::U8(token.parse().map_err(|_| invalid())?),
            ScalarType::I8 => Value::I8(token.parse().map_err(|_| invalid())?),
            ScalarType::U16 => Value::U16(token.parse().map_err(|_| invalid())?),
            ScalarType::I16 => Value::I16(token.parse().map_err(|_| invalid())?),
            ScalarType::U32 => Value::U32(token.parse().map_err(|_| invalid())?),
            ScalarType::I32 => Value::I32(token.parse().map_err(|_| invalid())?),
            ScalarType::U64 => Value::U64(token.parse().map_err(|_| invalid())?),
            ScalarType::I64 => Value::I64(token.parse().map_err(|_| invalid())?),
            ScalarType::F32 => {
                let v: f32 = token.parse().map_err(|_| invalid())?;
                if !v.is_finite() {
                    return Err(invalid());
                }
                Value::F32(v)
            }
            ScalarType::F64 => {
                let v: f64 = token.parse().map_err(|_| invalid())?;
                if !v.is_finite() {
                    return Err(invalid());
                }
                Value::F64(v)
            }
        };
        Ok(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Scalar(Value),
    Array(Vec<Value>),
}

/// A decoded or parsed message: a catalog layout plus one value per declared field.
///
/// Construction validates every value against the layout, so an existing
/// `Message` always encodes to exactly `layout.frame_len()` bytes.
#[derive(Debug, Clone)]
pub struct Message {
    layout: &'static MessageLayout,
    fields: Vec<FieldValue>,
}

impl Message {
    pub fn new(layout: &'static MessageLayout, fields: Vec<FieldValue>) -> CodecResult<Self> {
        if fields.len() != layout.fields.len() {
            let field = layout
                .fields
                .get(fields.len())
                .or(layout.fields.last())
                .map_or("<none>", |d| d.name);
            return Err(CodecError::FieldMismatch {
                name: layout.name,
                field,
            });
        }
        for (desc, value) in layout.fields.iter().zip(&fields) {
            let fits = match (desc.shape, value) {
                (Shape::Scalar, FieldValue::Scalar(v)) => v.ty() == desc.ty,
                (Shape::Array(n), FieldValue::Array(items)) => {
                    items.len() == n && items.iter().all(|v| v.ty() == desc.ty)
                }
                _ => false,
            };
            if !fits {
                return Err(CodecError::FieldMismatch {
                    name: layout.name,
                    field: desc.name,
                });
            }
        }
        Ok(Self { layout, fields })
    }

    pub fn code(&self) -> u8 {
        self.layout.code
    }

    pub fn name(&self) -> &'static str {
        self.layout.name
    }

    pub fn kind(&self) -> MessageKind {
        self.layout.kind
    }

    pub fn layout(&self) -> &'static MessageLayout {
        self.layout
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.layout
            .fields
            .iter()
            .position(|d| d.name == name)
            .map(|i| &self.fields[i])
    }

    /// Name of the first field holding a NaN or infinite value.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        self.layout
            .fields
            .iter()
            .zip(&self.fields)
            .find(|(_, value)| match value {
                FieldValue::Scalar(v) => !v.is_finite(),
                FieldValue::Array(items) => !items.iter().all(Value::is_finite),
            })
            .map(|(desc, _)| desc.name)
    }

    /// Serialize to the fixed-length wire frame, code byte first.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.layout.frame_len());
        out.push(self.layout.code);
        for value in &self.fields {
            match value {
                FieldValue::Scalar(v) => v.write_le(&mut out),
                FieldValue::Array(items) => items.iter().for_each(|v| v.write_le(&mut out)),
            }
        }
        out
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.layout.code == other.layout.code && self.fields == other.fields
    }
}
