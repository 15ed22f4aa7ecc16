use std::collections::BTreeMap;

/// Where a request currently stands in the parser's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Complete,
    Error,
}

impl ParseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ParseState::Complete | ParseState::Error)
    }
}

/// A request as assembled by [`RequestParser`](super::parser::RequestParser).
///
/// The URI is split into `path` and `query` as soon as the request line is
/// read. Header names are stored lowercased; a repeated header keeps its last
/// value, as does a repeated query key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Raw method token, e.g. `GET`.
    pub method: String,
    /// The request target exactly as received.
    pub uri: String,
    pub version: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Value of `Content-Length`, zero when absent.
    pub content_length: usize,
    pub state: ParseState,
}

impl HttpRequest {
    pub fn new() -> Self {
        HttpRequest {
            method: String::new(),
            uri: String::new(),
            version: String::new(),
            path: String::new(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            content_length: 0,
            state: ParseState::RequestLine,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The raw query string (everything after `?`), empty when absent.
    pub fn query_string(&self) -> &str {
        match self.uri.find('?') {
            Some(pos) => &self.uri[pos + 1..],
            None => "",
        }
    }

    /// Host header without any `:port` suffix, lowercased.
    pub fn host(&self) -> Option<String> {
        self.header("host").map(|host| {
            let name = match host.rfind(':') {
                Some(pos) if !host.ends_with(']') => &host[..pos],
                _ => host,
            };
            name.trim().to_ascii_lowercase()
        })
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        HttpRequest::new()
    }
}

/// Splits a request target into its path and query parameters.
pub fn decompose_uri(uri: &str) -> (String, BTreeMap<String, String>) {
    let mut query = BTreeMap::new();
    let (path, raw_query) = match uri.split_once('?') {
        Some((path, raw_query)) => (path, raw_query),
        None => return (uri.to_string(), query),
    };
    for pair in raw_query.split('&').filter(|pair| !pair.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) => query.insert(key.to_string(), value.to_string()),
            None => query.insert(pair.to_string(), String::new()),
        };
    }
    (path.to_string(), query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_without_query_is_all_path() {
        let (path, query) = decompose_uri("/a/b");
        assert_eq!(path, "/a/b");
        assert!(query.is_empty());
    }

    #[test]
    fn query_keys_are_last_wins_and_bare_keys_are_empty() {
        let (path, query) = decompose_uri("/s?x=1&flag&x=2&&y=a=b");
        assert_eq!(path, "/s");
        assert_eq!(query.get("x").map(String::as_str), Some("2"));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
        assert_eq!(query.get("y").map(String::as_str), Some("a=b"));
        assert_eq!(query.len(), 3);
    }

    #[test]
    fn host_drops_port_and_case() {
        let mut request = HttpRequest::new();
        request
            .headers
            .insert("host".to_string(), "Example.COM:8080".to_string());
        assert_eq!(request.host().as_deref(), Some("example.com"));
    }
}
