use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::value::Value;

pub type Result<T> = std::result::Result<T, Error>;

/// Runtime error carrying a structural kind, the originating script position
/// and the invocation stack captured at throw time.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    file: Option<PathBuf>,
    position: Option<(u32, u32)>,
    stack: Vec<String>,
    payload: Option<Value>,
}

impl Error {
    fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            file: None,
            position: None,
            stack: Vec::new(),
            payload: None,
        }
    }

    pub fn msg(msg: impl AsRef<str>) -> Self {
        ErrorKind::Msg(msg.as_ref().to_string()).into()
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Type(msg.into()))
    }

    pub fn arity(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Arity(msg.into()))
    }

    pub fn undefined(name: impl Into<String>) -> Self {
        Error::new(ErrorKind::Undefined(name.into()))
    }

    pub fn arithmetic(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Arithmetic(msg.into()))
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Io(msg.into()))
    }

    pub fn parse(msg: impl Into<String>, line: u32, column: u32) -> Self {
        Error::new(ErrorKind::Parse {
            msg: msg.into(),
            line,
            column,
        })
    }

    pub fn circular_dependency(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::CircularDependency(msg.into()))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound(msg.into()))
    }

    pub fn rate_limit(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::RateLimit(msg.into()))
    }

    pub fn context_length(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::ContextLength(msg.into()))
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Timeout(msg.into()))
    }

    pub fn capability_missing(name: &str) -> Self {
        Error::new(ErrorKind::CapabilityMissing(name.to_string()))
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::PermissionDenied(msg.into()))
    }

    pub fn jwt_invalid(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::JwtInvalid(msg.into()))
    }

    pub fn context_closed(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::ContextClosed(msg.into()))
    }

    /// Error raised by the `throw` intrinsic; `value` becomes the payload a
    /// `catch` arm receives.
    pub fn thrown(value: Value) -> Self {
        let mut err = Error::new(ErrorKind::Thrown(value.to_display_string()));
        err.payload = Some(value);
        err
    }

    /// The structural kind identifier scripts observe via `e.kind`.
    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            ErrorKind::Msg(_) | ErrorKind::Thrown(_) => "error",
            ErrorKind::Type(_) => "type_error",
            ErrorKind::Arity(_) => "arity_error",
            ErrorKind::Undefined(_) => "undefined",
            ErrorKind::Arithmetic(_) => "arithmetic",
            ErrorKind::Io(_) => "io",
            ErrorKind::Parse { .. } => "parse",
            ErrorKind::CircularDependency(_) => "circular_dependency",
            ErrorKind::NotFound(_) => "not_found",
            ErrorKind::RateLimit(_) => "rate_limit",
            ErrorKind::ContextLength(_) => "context_length",
            ErrorKind::Timeout(_) => "timeout",
            ErrorKind::CapabilityMissing(_) => "capability_missing",
            ErrorKind::PermissionDenied(_) => "permission_denied",
            ErrorKind::JwtInvalid(_) => "jwt_invalid",
            ErrorKind::ContextClosed(_) => "context_closed",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout(_))
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn position(&self) -> Option<(u32, u32)> {
        self.position
    }

    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    /// Attach the originating file if not already known.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        if self.file.is_none() {
            self.file = Some(file.into());
        }
        self
    }

    /// Attach the source position if not already known.
    pub fn with_position(mut self, line: u32, column: u32) -> Self {
        if self.position.is_none() {
            self.position = Some((line, column));
        }
        self
    }

    /// Attach the invocation stack captured at throw time.
    pub fn with_stack(mut self, stack: Vec<String>) -> Self {
        if self.stack.is_empty() {
            self.stack = stack;
        }
        self
    }
}

impl From<ErrorKind> for Error {
    fn from(value: ErrorKind) -> Self {
        Error::new(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        ErrorKind::Io(value.to_string()).into()
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        ErrorKind::Parse {
            msg: value.to_string(),
            line: value.line() as u32,
            column: value.column() as u32,
        }
        .into()
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        ErrorKind::JwtInvalid(value.to_string()).into()
    }
}

#[derive(Debug, Error)]
pub(crate) enum ErrorKind {
    /// Value mismatch for an operator or intrinsic
    #[error("type error - {0}")]
    Type(String),

    /// Wrong number of arguments in a call
    #[error("arity error - {0}")]
    Arity(String),

    /// Unknown identifier
    #[error("undefined symbol '{0}'")]
    Undefined(String),

    /// Division by zero and friends
    #[error("arithmetic error - {0}")]
    Arithmetic(String),

    /// Host I/O failures
    #[error("io error - {0}")]
    Io(String),

    /// Lexer/parser failures, with the offending position
    #[error("parse error at {line}:{column} - {msg}")]
    Parse { msg: String, line: u32, column: u32 },

    /// `require`/`include` loop
    #[error("circular dependency - {0}")]
    CircularDependency(String),

    /// Module, route or key lookup failure
    #[error("not found - {0}")]
    NotFound(String),

    #[error("rate limit exceeded - {0}")]
    RateLimit(String),

    #[error("context length exceeded - {0}")]
    ContextLength(String),

    /// Blocking wait or worker deadline expired
    #[error("timeout - {0}")]
    Timeout(String),

    /// Intrinsic needs a host capability that was not provided
    #[error("capability not provided - {0}")]
    CapabilityMissing(String),

    /// Mutation of a read-only resource (e.g. the `sys` namespace)
    #[error("permission denied - {0}")]
    PermissionDenied(String),

    /// Token failed signature, format or claim checks
    #[error("invalid jwt - {0}")]
    JwtInvalid(String),

    /// Second response attempt on a finished request context
    #[error("context closed - {0}")]
    ContextClosed(String),

    /// Value raised by the `throw` intrinsic
    #[error("{0}")]
    Thrown(String),

    /// Generic error message - useful for communicating more complicated errors
    #[error("{0}")]
    Msg(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_structural() {
        assert_eq!(Error::type_error("x").kind_str(), "type_error");
        assert_eq!(Error::timeout("x").kind_str(), "timeout");
        assert_eq!(Error::capability_missing("fs").kind_str(), "capability_missing");
        assert_eq!(Error::parse("x", 1, 2).kind_str(), "parse");
    }

    #[test]
    fn position_is_set_once() {
        let err = Error::undefined("foo").with_position(3, 7).with_position(9, 9);
        assert_eq!(err.position(), Some((3, 7)));
    }

    #[test]
    fn thrown_keeps_payload() {
        let err = Error::thrown(Value::from("boom"));
        assert_eq!(err.payload().unwrap().as_str().unwrap(), "boom");
        assert_eq!(err.kind_str(), "error");
    }
}
