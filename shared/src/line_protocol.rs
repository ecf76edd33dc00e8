// <record>,<tag>=<value> <field>=<value>,... <timestampNs>\n

use crate::catalog::Shape;
use crate::message::{FieldValue, Message};
use std::fmt::{Display, Write};

fn push_escaped(out: &mut String, raw: &str) {
    for c in raw.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Incremental builder for one telemetry line.
///
/// Tags must all be added before the first field.
#[derive(Debug)]
pub struct LineBuilder {
    buf: String,
    fields: usize,
}

impl LineBuilder {
    pub fn new(record: &str) -> Self {
        let mut buf = String::with_capacity(128);
        push_escaped(&mut buf, record);
        Self { buf, fields: 0 }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        debug_assert_eq!(self.fields, 0, "tags go before fields");
        self.buf.push(',');
        push_escaped(&mut self.buf, key);
        self.buf.push('=');
        push_escaped(&mut self.buf, value);
        self
    }

    pub fn field(&mut self, key: &str, value: impl Display) -> &mut Self {
        self.buf.push(if self.fields == 0 { ' ' } else { ',' });
        push_escaped(&mut self.buf, key);
        let _ = write!(self.buf, "={value}");
        self.fields += 1;
        self
    }

    pub fn field_count(&self) -> usize {
        self.fields
    }

    /// Append the timestamp and terminating newline.
    pub fn finish(mut self, timestamp_ns: u64) -> String {
        let _ = writeln!(self.buf, " {timestamp_ns}");
        self.buf
    }
}

/// Serialize a decoded message as one telemetry line.
///
/// Fields appear in declaration order; an array field `name` of length N
/// expands to `name[0]=..,...,name[N-1]=..`.
pub fn to_telemetry_line(msg: &Message, source_tag: &str, timestamp_ns: u64) -> String {
    let mut line = LineBuilder::new(msg.name()).tag("source", source_tag);
    for (desc, value) in msg.layout().fields.iter().zip(msg.fields()) {
        match (desc.shape, value) {
            (Shape::Array(_), FieldValue::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    line.field(&format!("{}[{index}]", desc.name), item);
                }
            }
            (_, FieldValue::Scalar(v)) => {
                line.field(desc.name, v);
            }
            // Message::new guarantees shapes agree with the layout.
            (Shape::Scalar, FieldValue::Array(_)) => unreachable!(),
        }
    }
    line.finish(timestamp_ns)
}
