use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Internal,
    BadRequest,
    UnknownBackend,
    Unsupported,
    Schema,
    TypeMismatch,
    BadRange,
    OutOfBounds,
    NotFound,
    Conflict,
    Timeout,
    Transport,
    UnsupportedDType,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Internal => "Internal",
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::UnknownBackend => "UnknownBackend",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::Schema => "Schema",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::BadRange => "BadRange",
            ErrorKind::OutOfBounds => "OutOfBounds",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Transport => "Transport",
            ErrorKind::UnsupportedDType => "UnsupportedDType",
        }
    }

    /// Unknown names decode as `Internal` so newer peers never break older ones.
    pub fn parse(value: &str) -> ErrorKind {
        match value {
            "BadRequest" => ErrorKind::BadRequest,
            "UnknownBackend" => ErrorKind::UnknownBackend,
            "Unsupported" => ErrorKind::Unsupported,
            "Schema" => ErrorKind::Schema,
            "TypeMismatch" => ErrorKind::TypeMismatch,
            "BadRange" => ErrorKind::BadRange,
            "OutOfBounds" => ErrorKind::OutOfBounds,
            "NotFound" => ErrorKind::NotFound,
            "Conflict" => ErrorKind::Conflict,
            "Timeout" => ErrorKind::Timeout,
            "Transport" => ErrorKind::Transport,
            "UnsupportedDType" => ErrorKind::UnsupportedDType,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    table: Option<String>,
    hint: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            table: None,
            hint: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
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

    /// Copy of kind, message, table and hint; the source chain is not cloneable.
    pub fn detached(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            table: self.table.clone(),
            hint: self.hint.clone(),
            source: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(table) = &self.table {
            write!(f, " (table: {table})")?;
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
        ErrorKind::BadRequest => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Conflict => 4,
        ErrorKind::Timeout => 5,
        ErrorKind::Transport => 6,
        ErrorKind::Schema => 7,
        ErrorKind::TypeMismatch => 8,
        ErrorKind::UnknownBackend => 9,
        ErrorKind::Unsupported => 10,
        ErrorKind::BadRange => 11,
        ErrorKind::OutOfBounds => 12,
        ErrorKind::UnsupportedDType => 13,
    }
}
