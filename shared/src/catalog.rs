// ======================================================================
//  Message catalog
// ======================================================================
//
// Every frame is [code: u8][field 0][field 1]..., packed, little-endian.

use crate::command;
use crate::error::{CodecError, CodecResult};
use crate::message::{FieldValue, Message, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

// ============================================================================
// Field descriptors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ScalarType {
    /// Width of one element on the wire.
    pub const fn size(self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::U64 | ScalarType::I64 | ScalarType::F64 => 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ScalarType::U8 => "u8",
            ScalarType::I8 => "i8",
            ScalarType::U16 => "u16",
            ScalarType::I16 => "i16",
            ScalarType::U32 => "u32",
            ScalarType::I32 => "i32",
            ScalarType::U64 => "u64",
            ScalarType::I64 => "i64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Array(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: &'static str,
    pub ty: ScalarType,
    pub shape: Shape,
}

impl FieldDesc {
    pub const fn scalar(name: &'static str, ty: ScalarType) -> Self {
        Self {
            name,
            ty,
            shape: Shape::Scalar,
        }
    }

    pub const fn array(name: &'static str, ty: ScalarType, len: usize) -> Self {
        Self {
            name,
            ty,
            shape: Shape::Array(len),
        }
    }

    /// Number of scalar elements (1 for a scalar field).
    pub const fn element_count(&self) -> usize {
        match self.shape {
            Shape::Scalar => 1,
            Shape::Array(n) => n,
        }
    }

    pub const fn byte_len(&self) -> usize {
        self.ty.size() * self.element_count()
    }

    /// Argument spec used by `help`, e.g. `<mode:u8>` or `"<quaternion:f32 x4>"`.
    fn arg_spec(&self) -> String {
        match self.shape {
            Shape::Scalar => format!("<{}:{}>", self.name, self.ty),
            Shape::Array(n) => format!("\"<{}:{} x{}>\"", self.name, self.ty, n),
        }
    }
}

// ============================================================================
// Layouts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Sent by the router to the attitude-control subsystem.
    Command,
    /// Received from the attitude-control subsystem and forwarded to monitoring.
    Telemetry,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MessageLayout {
    pub code: u8,
    pub name: &'static str,
    pub kind: MessageKind,
    pub summary: &'static str,
    pub fields: &'static [FieldDesc],
}

impl MessageLayout {
    /// Total frame length including the leading code byte.
    pub fn frame_len(&self) -> usize {
        1 + self.fields.iter().map(FieldDesc::byte_len).sum::<usize>()
    }

    /// One-entry textual description of the message, used by `help`.
    ///
    /// The first line is the usage (`name` followed by one argument spec per
    /// field), the second line is the indented summary.
    pub fn describe(&self) -> String {
        let mut out = String::from(self.name);
        for field in self.fields {
            out.push(' ');
            out.push_str(&field.arg_spec());
        }
        out.push_str("\n    ");
        out.push_str(self.summary);
        out
    }

    /// Decode a full frame (code byte included) whose length has already
    /// been checked against [`MessageLayout::frame_len`].
    fn decode_frame(&'static self, frame: &[u8]) -> CodecResult<Message> {
        let mut offset = 1;
        let mut fields = Vec::with_capacity(self.fields.len());
        for desc in self.fields {
            let width = desc.ty.size();
            let mut read_one = || {
                let v = Value::read_le(desc.ty, &frame[offset..offset + width]);
                offset += width;
                v
            };
            let value = match desc.shape {
                Shape::Scalar => FieldValue::Scalar(read_one()),
                Shape::Array(n) => FieldValue::Array((0..n).map(|_| read_one()).collect()),
            };
            fields.push(value);
        }
        Message::new(self, fields)
    }
}

// ============================================================================
// Standard catalog
// ============================================================================

use ScalarType::{F32, I16, U16, U32, U8};

pub static SET_OPMODE: MessageLayout = MessageLayout {
    code: 0,
    name: "setOpmode",
    kind: MessageKind::Command,
    summary: "switch the attitude controller operating mode",
    fields: &[FieldDesc::scalar("mode", U8)],
};

pub static SET_ATTITUDE_TARGET: MessageLayout = MessageLayout {
    code: 1,
    name: "setAttitudeTarget",
    kind: MessageKind::Command,
    summary: "point to a target quaternion (w x y z) with a slew rate limit in rad/s",
    fields: &[
        FieldDesc::array("quaternion", F32, 4),
        FieldDesc::scalar("maxRate", F32),
    ],
};

pub static ATTITUDE_ADCS: MessageLayout = MessageLayout {
    code: 2,
    name: "attitudeADCS",
    kind: MessageKind::Telemetry,
    summary: "estimated attitude, body rates and magnetometer reading",
    fields: &[
        FieldDesc::array("quaternion", F32, 4),
        FieldDesc::array("angularRate", F32, 3),
        FieldDesc::array("magField", F32, 3),
    ],
};

pub static HOUSEKEEPING_ADCS: MessageLayout = MessageLayout {
    code: 3,
    name: "housekeepingADCS",
    kind: MessageKind::Telemetry,
    summary: "board temperature, power bus and reaction wheel state",
    fields: &[
        FieldDesc::scalar("temperature", F32),
        FieldDesc::scalar("busVoltage", F32),
        FieldDesc::scalar("busCurrent", F32),
        FieldDesc::array("wheelSpeed", I16, 3),
        FieldDesc::scalar("uptime", U32),
    ],
};

pub static OPMODE_ADCS: MessageLayout = MessageLayout {
    code: 4,
    name: "opmodeADCS",
    kind: MessageKind::Telemetry,
    summary: "current operating mode and fault flags",
    fields: &[
        FieldDesc::scalar("mode", U8),
        FieldDesc::scalar("faultFlags", U16),
    ],
};

static STANDARD_LAYOUTS: &[&MessageLayout] = &[
    &SET_OPMODE,
    &SET_ATTITUDE_TARGET,
    &ATTITUDE_ADCS,
    &HOUSEKEEPING_ADCS,
    &OPMODE_ADCS,
];

// ============================================================================
// Catalog
// ============================================================================

/// Code → layout registry. Iteration order is code order ("catalog order").
#[derive(Debug)]
pub struct Catalog {
    by_code: BTreeMap<u8, &'static MessageLayout>,
}

impl Catalog {
    pub fn new(layouts: &[&'static MessageLayout]) -> CodecResult<Self> {
        let mut by_code = BTreeMap::new();
        for layout in layouts {
            if by_code.insert(layout.code, *layout).is_some() {
                return Err(CodecError::DuplicateCode(layout.code));
            }
        }
        Ok(Self { by_code })
    }

    /// The catalog shared with the attitude-control subsystem.
    pub fn standard() -> &'static Catalog {
        static INSTANCE: OnceLock<Catalog> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            Catalog::new(STANDARD_LAYOUTS).expect("standard catalog codes are unique")
        })
    }

    pub fn get(&self, code: u8) -> Option<&'static MessageLayout> {
        self.by_code.get(&code).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&'static MessageLayout> {
        self.by_code.values().copied().find(|l| l.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static MessageLayout> + '_ {
        self.by_code.values().copied()
    }

    pub fn commands(&self) -> impl Iterator<Item = &'static MessageLayout> + '_ {
        self.iter().filter(|l| l.kind == MessageKind::Command)
    }

    /// Decode one frame received from the link.
    ///
    /// The first byte selects the layout; the frame must be exactly the
    /// layout's declared length. Unknown codes and length mismatches are
    /// reported as errors, never panics.
    pub fn decode(&self, frame: &[u8]) -> CodecResult<Message> {
        let Some(&code) = frame.first() else {
            return Err(CodecError::EmptyFrame);
        };
        let layout = self.get(code).ok_or(CodecError::UnknownCode {
            code,
            len: frame.len(),
        })?;
        let expected = layout.frame_len();
        if frame.len() != expected {
            return Err(CodecError::LengthMismatch {
                name: layout.name,
                code,
                expected,
                got: frame.len(),
            });
        }
        layout.decode_frame(frame)
    }

    /// Parse an operator command line (`keyword args...`) into a command message.
    pub fn parse_command(&self, text: &str) -> CodecResult<Message> {
        command::parse(self, text)
    }
}
