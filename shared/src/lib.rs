pub mod catalog;
pub mod command;
pub mod error;
pub mod line_protocol;
pub mod message;

pub use catalog::{Catalog, FieldDesc, MessageKind, MessageLayout, ScalarType, Shape};
pub use error::{CodecError, CodecResult};
pub use line_protocol::{to_telemetry_line, LineBuilder};
pub use message::{FieldValue, Message, Value};

/// Keyword of the built-in command that lists the available commands.
pub const HELP_KEYWORD: &str = "help";
