use crate::catalog::ScalarType;
use thiserror::Error;

pub type CodecResult<T> = Result<T, CodecError>;

/// Everything that can go wrong turning bytes or operator text into a [`Message`](crate::Message).
///
/// None of these are fatal to the router: frame errors are logged and dropped,
/// command errors become an `ERROR:` reply to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown message code {code} ({len} bytes)")]
    UnknownCode { code: u8, len: usize },

    #[error("{name} (code {code}) must be {expected} bytes, got {got}")]
    LengthMismatch {
        name: &'static str,
        code: u8,
        expected: usize,
        got: usize,
    },

    #[error("message code {0} registered twice")]
    DuplicateCode(u8),

    #[error("field {field} does not match the layout of {name}")]
    FieldMismatch {
        name: &'static str,
        field: &'static str,
    },

    #[error("empty command")]
    EmptyCommand,

    #[error("unknown command '{0}'")]
    UnknownKeyword(String),

    #[error("'{0}' is telemetry, not a command")]
    NotACommand(String),

    #[error("command '{0}' is not available")]
    Unavailable(&'static str),

    #[error("{command}: missing argument for {field}")]
    MissingArgument {
        command: &'static str,
        field: &'static str,
    },

    #[error("{command}: unexpected argument '{token}'")]
    UnexpectedArgument { command: &'static str, token: String },

    #[error("unterminated quote in arguments")]
    UnterminatedQuote,

    #[error("stray quote in argument '{0}'")]
    UnexpectedQuote(String),

    #[error("{field} takes a single value, not a quoted list")]
    ExpectedScalar { field: &'static str },

    #[error("{field} takes a quoted list of values")]
    ExpectedArray { field: &'static str },

    #[error("{field} takes {expected} values, got {got}")]
    ArrayLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{field}: '{token}' is not a valid {ty}")]
    InvalidValue {
        field: &'static str,
        ty: ScalarType,
        token: String,
    },
}
