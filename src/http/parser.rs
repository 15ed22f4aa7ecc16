//! Incremental HTTP/1.1 request parser.
//!
//! The parser owns a byte buffer that grows with every [`RequestParser::feed`]
//! call and advances a small state machine as far as the buffered bytes
//! allow. It never assumes a whole message is present and performs no I/O.
//!
//! ```text
//! RequestLine --CRLF--> Headers --CRLFCRLF--> Body --len bytes--> Complete
//!                                        \----(no body)-------->/
//! any state --malformed input--> Error
//! ```

use std::fmt;

use tracing::debug;

use super::request::{decompose_uri, HttpRequest, ParseState};

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const SUPPORTED_VERSION: &str = "HTTP/1.1";

/// Longest request line or header block accepted, terminator excluded.
pub const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidEncoding,
    MalformedRequestLine(String),
    UnsupportedVersion(String),
    MalformedHeader(String),
    InvalidContentLength(String),
    MissingContentLength,
    ExtraneousData(usize),
    HeadTooLarge(usize),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidEncoding => f.write_str("request head is not valid UTF-8"),
            ParseError::MalformedRequestLine(line) => write!(f, "malformed request line '{}'", line),
            ParseError::UnsupportedVersion(version) => {
                write!(f, "unsupported protocol version '{}'", version)
            }
            ParseError::MalformedHeader(line) => write!(f, "malformed header line '{}'", line),
            ParseError::InvalidContentLength(value) => {
                write!(f, "invalid Content-Length '{}'", value)
            }
            ParseError::MissingContentLength => {
                f.write_str("Content-Length is required for POST requests")
            }
            ParseError::ExtraneousData(n) => {
                write!(f, "{} unexpected bytes after end of message", n)
            }
            ParseError::HeadTooLarge(n) => {
                write!(f, "request head exceeds {} bytes ({} buffered)", MAX_HEAD_BYTES, n)
            }
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
    /// How much of `buffer` earlier terminator searches already covered.
    scanned: usize,
    request: HttpRequest,
    error: Option<ParseError>,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser::default()
    }

    /// Appends `bytes` and advances as far as the buffered data allows.
    ///
    /// Once the parser is `Complete` or in `Error` further input is ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> ParseState {
        if self.state().is_terminal() {
            return self.state();
        }
        self.buffer.extend_from_slice(bytes);
        self.advance();
        self.state()
    }

    fn advance(&mut self) {
        while !self.state().is_terminal() {
            let buffered = self.buffer.len();
            let state = self.state();

            let step = match state {
                ParseState::RequestLine => self.parse_request_line(),
                ParseState::Headers => self.parse_headers(),
                ParseState::Body => self.parse_body(),
                ParseState::Complete | ParseState::Error => Ok(()),
            };
            if let Err(err) = step {
                self.fail(err);
                return;
            }

            // Neither consumed nor moved on: wait for more bytes.
            if self.buffer.len() == buffered && self.state() == state {
                return;
            }
        }
    }

    fn fail(&mut self, err: ParseError) {
        debug!("request rejected: {}", err);
        self.request.state = ParseState::Error;
        self.error = Some(err);
    }

    fn consume(&mut self, count: usize) {
        self.buffer.drain(..count.min(self.buffer.len()));
        self.scanned = 0;
    }

    /// Looks for `terminator`, resuming where the last search stopped. A head
    /// that is still unterminated past [`MAX_HEAD_BYTES`] is an error.
    fn find_terminator(&mut self, terminator: &[u8]) -> Result<Option<usize>, ParseError> {
        let start = self
            .scanned
            .saturating_sub(terminator.len() - 1)
            .min(self.buffer.len());
        let found = find(&self.buffer[start..], terminator).map(|pos| start + pos);
        match found {
            Some(end) if end > MAX_HEAD_BYTES => Err(ParseError::HeadTooLarge(end)),
            Some(end) => Ok(Some(end)),
            None if self.buffer.len() > MAX_HEAD_BYTES => {
                Err(ParseError::HeadTooLarge(self.buffer.len()))
            }
            None => {
                self.scanned = self.buffer.len();
                Ok(None)
            }
        }
    }

    fn parse_request_line(&mut self) -> Result<(), ParseError> {
        let end = match self.find_terminator(CRLF)? {
            Some(end) => end,
            None => return Ok(()),
        };
        let line = std::str::from_utf8(&self.buffer[..end])
            .map_err(|_| ParseError::InvalidEncoding)?
            .to_string();

        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 3 {
            return Err(ParseError::MalformedRequestLine(line));
        }
        let (method, uri, version) = (tokens[0], tokens[1], tokens[2]);
        if version != SUPPORTED_VERSION {
            return Err(ParseError::UnsupportedVersion(version.to_string()));
        }

        let (path, query) = decompose_uri(uri);
        let path = urlencoding::decode(&path)
            .map_err(|_| ParseError::InvalidEncoding)?
            .into_owned();
        if path.contains('\0') {
            return Err(ParseError::MalformedRequestLine(line));
        }
        self.request.method = method.to_string();
        self.request.uri = uri.to_string();
        self.request.version = version.to_string();
        self.request.path = path;
        self.request.query = query;

        self.consume(end + CRLF.len());
        self.request.state = ParseState::Headers;
        Ok(())
    }

    fn parse_headers(&mut self) -> Result<(), ParseError> {
        // A CRLF right after the request line is an empty header block.
        let (block_len, terminator_len) = if self.buffer.starts_with(CRLF) {
            (0, CRLF.len())
        } else {
            match self.find_terminator(HEADER_END)? {
                Some(end) => (end, HEADER_END.len()),
                None => return Ok(()),
            }
        };

        let block = std::str::from_utf8(&self.buffer[..block_len])
            .map_err(|_| ParseError::InvalidEncoding)?
            .to_string();
        for line in block.split("\r\n").filter(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::MalformedHeader(line.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(ParseError::MalformedHeader(line.to_string()));
            }
            self.request
                .headers
                .insert(name.to_ascii_lowercase(), value.trim().to_string());
        }

        match self.request.headers.get("content-length") {
            Some(value) => {
                self.request.content_length = value
                    .parse::<usize>()
                    .map_err(|_| ParseError::InvalidContentLength(value.clone()))?;
            }
            None if self.request.method == "POST" => {
                return Err(ParseError::MissingContentLength);
            }
            None => {}
        }

        self.consume(block_len + terminator_len);
        if self.request.content_length > 0 {
            self.request.state = ParseState::Body;
        } else if !self.buffer.is_empty() {
            return Err(ParseError::ExtraneousData(self.buffer.len()));
        } else {
            self.request.state = ParseState::Complete;
        }
        Ok(())
    }

    fn parse_body(&mut self) -> Result<(), ParseError> {
        let expected = self.request.content_length;
        if self.buffer.len() < expected {
            return Ok(());
        }
        if self.buffer.len() > expected {
            return Err(ParseError::ExtraneousData(self.buffer.len() - expected));
        }
        self.request.body = std::mem::take(&mut self.buffer);
        self.request.state = ParseState::Complete;
        Ok(())
    }

    pub fn state(&self) -> ParseState {
        self.request.state
    }

    pub fn is_complete(&self) -> bool {
        self.state() == ParseState::Complete
    }

    pub fn has_error(&self) -> bool {
        self.state() == ParseState::Error
    }

    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    /// Bytes received but not yet absorbed into the request.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
