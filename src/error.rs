use std::fmt;
use std::io;
use std::net::SocketAddr;

/// A configuration problem, located in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ConfigError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        ConfigError {
            message: message.into(),
            line,
            column,
        }
    }

    /// Builds an error located at a byte offset of `source`.
    pub fn at_offset(message: impl Into<String>, source: &str, offset: usize) -> Self {
        let (line, column) = line_column(source, offset);
        ConfigError::new(message, line, column)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}, column {}: {}",
            self.line, self.column, self.message
        )
    }
}

impl std::error::Error for ConfigError {}

/// 1-based line and column of a byte offset.
pub fn line_column(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source.as_bytes()[..offset];
    let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
    let line_start = before
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    (line, offset - line_start + 1)
}

#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
    Config(ConfigError),
    Bind { addr: SocketAddr, source: io::Error },
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> ServerError {
        ServerError::Io(err)
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> ServerError {
        ServerError::Config(err)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Io(err) => write!(f, "I/O error: {}", err),
            ServerError::Config(err) => write!(f, "configuration error at {}", err),
            ServerError::Bind { addr, source } => write!(f, "cannot bind {}: {}", addr, source),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(err) => Some(err),
            ServerError::Config(err) => Some(err),
            ServerError::Bind { source, .. } => Some(source),
        }
    }
}
