//! Purpose: Define the crate-wide error type shared by buffering, tokenizing and binding.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`.
//! Role: Single error vocabulary so callers can tell recoverable field errors from fatal ones.
//! Invariants: `Syntax` and `Conversion` are the only kinds a field interceptor may swallow.
//! Invariants: Exit-code mapping is stable; add new kinds at the end.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Io,
    Timeout,
    Unsupported,
    Syntax,
    Conversion,
}

impl ErrorKind {
    /// Malformed tokens and incompatible values are scoped to one field.
    pub fn is_field_scoped(self) -> bool {
        matches!(self, ErrorKind::Syntax | ErrorKind::Conversion)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<String>,
    line: Option<u64>,
    position: Option<u64>,
    hint: Option<String>,
    reported: bool,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            line: None,
            position: None,
            hint: None,
            reported: false,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Structural JSON path (`items[2].name`) at which the error was raised.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn line(&self) -> Option<u64> {
        self.line
    }

    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_location(mut self, line: u64, position: u64) -> Self {
        self.line = Some(line);
        self.position = Some(position);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// True once an error handler has seen this error and declined it.
    pub(crate) fn is_reported(&self) -> bool {
        self.reported
    }

    pub(crate) fn mark_reported(mut self) -> Self {
        self.reported = true;
        self
    }

    /// Message in the legacy client-facing layout:
    /// `<message> Path '<path>', line <n>, position <m>.`
    pub fn display_message(&self) -> String {
        let mut out = self.message.clone().unwrap_or_else(|| format!("{:?}", self.kind));
        if !out.ends_with('.') {
            out.push('.');
        }
        if let Some(path) = &self.path {
            out.push_str(&format!(" Path '{path}'"));
            match (self.line, self.position) {
                (Some(line), Some(position)) => {
                    out.push_str(&format!(", line {line}, position {position}."));
                }
                _ => out.push('.'),
            }
        }
        out
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {path})")?;
        }
        if let (Some(line), Some(position)) = (self.line, self.position) {
            write!(f, " (line: {line}, position: {position})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Io => 3,
        ErrorKind::Timeout => 4,
        ErrorKind::Unsupported => 5,
        ErrorKind::Syntax => 6,
        ErrorKind::Conversion => 7,
    }
}
