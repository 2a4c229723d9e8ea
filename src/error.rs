use std::fmt;
use std::io;

#[derive(Debug)]
pub enum UnpickleError {
    /// Truncated pickle stream
    UnexpectedEof,
    /// Opcode outside the supported pickle subset
    UnsupportedOpcode(u8),
    /// Type key with no registry entry
    UnknownType { module: String, name: String },
    /// Scalar, string or length operand that does not parse
    MalformedLiteral(String),
    /// Operand stack, mark or memo protocol breach
    StackViolation(String),
    /// Array placeholder with an unreadable out-of-band payload
    CorruptArrayPayload(String),
    /// I/O failure reading the model file
    Storage(io::Error),
}

impl fmt::Display for UnpickleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnpickleError::UnexpectedEof => write!(f, "unexpected end of pickle stream"),
            UnpickleError::UnsupportedOpcode(op) => {
                write!(f, "unsupported pickle opcode: 0x{op:02x}")
            }
            UnpickleError::UnknownType { module, name } => {
                write!(f, "unknown type: {module}.{name}")
            }
            UnpickleError::MalformedLiteral(msg) => write!(f, "malformed literal: {msg}"),
            UnpickleError::StackViolation(msg) => write!(f, "stack protocol violation: {msg}"),
            UnpickleError::CorruptArrayPayload(msg) => {
                write!(f, "corrupt array payload: {msg}")
            }
            UnpickleError::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for UnpickleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UnpickleError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for UnpickleError {
    fn from(err: io::Error) -> Self {
        UnpickleError::Storage(err)
    }
}
