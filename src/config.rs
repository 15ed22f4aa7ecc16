//! Configuration tree and its TOML loader.
//!
//! The tree is built once at startup and then only ever borrowed: the
//! dispatcher hands out references into it for the lifetime of the process.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::Deserialize;
use toml::Spanned;

use crate::error::{ConfigError, ServerError};

pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;

/// Request methods a location can allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub const ALL: [Method; 3] = [Method::Get, Method::Post, Method::Delete];

    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "DELETE" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Prefix,
    Exact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub status: u16,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub poll_timeout_ms: i32,
    pub max_events: usize,
    pub cgi_timeout: Duration,
    pub client_timeout: Duration,
    pub max_request_bytes: u64,
    /// Cap on what one CGI script may write before it is cut off.
    pub max_cgi_output: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            poll_timeout_ms: 1000,
            max_events: 64,
            cgi_timeout: Duration::from_secs(30),
            client_timeout: Duration::from_secs(60),
            max_request_bytes: 16 * 1024 * 1024,
            max_cgi_output: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub server_names: Vec<String>,
    pub root: PathBuf,
    pub index: Vec<String>,
    pub autoindex: bool,
    pub client_max_body_size: u64,
    pub error_pages: BTreeMap<u16, String>,
    pub locations: Vec<LocationConfig>,
}

/// A `location` block. Every `Option` is an override of the enclosing
/// server's value and only counts when present.
#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub kind: MatchKind,
    pub path: String,
    pub root: Option<PathBuf>,
    pub index: Option<Vec<String>>,
    pub autoindex: Option<bool>,
    pub client_max_body_size: Option<u64>,
    pub error_pages: Option<BTreeMap<u16, String>>,
    pub methods: BTreeSet<Method>,
    pub upload_enabled: bool,
    pub upload_store: Option<PathBuf>,
    pub cgi: BTreeMap<String, PathBuf>,
    pub redirect: Option<Redirect>,
}

// Raw, as-written shapes. Spans are kept where validation needs to point
// back into the file.

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    runtime: RawRuntime,
    #[serde(default)]
    logging: RawLogging,
    #[serde(default)]
    server: Vec<Spanned<RawServer>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawRuntime {
    poll_timeout_ms: i32,
    max_events: usize,
    cgi_timeout_secs: u64,
    client_timeout_secs: u64,
    max_request_bytes: Option<Spanned<RawSize>>,
    max_cgi_output: Option<Spanned<RawSize>>,
}

impl Default for RawRuntime {
    fn default() -> Self {
        let defaults = RuntimeConfig::default();
        RawRuntime {
            poll_timeout_ms: defaults.poll_timeout_ms,
            max_events: defaults.max_events,
            cgi_timeout_secs: defaults.cgi_timeout.as_secs(),
            client_timeout_secs: defaults.client_timeout.as_secs(),
            max_request_bytes: None,
            max_cgi_output: None,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
struct RawLogging {
    level: Option<Spanned<String>>,
    file: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSize {
    Bytes(u64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServer {
    host: Option<Spanned<String>>,
    port: Spanned<u16>,
    #[serde(default)]
    server_names: Vec<String>,
    root: Option<String>,
    index: Option<Vec<String>>,
    #[serde(default)]
    autoindex: bool,
    client_max_body_size: Option<Spanned<RawSize>>,
    error_pages: Option<Spanned<BTreeMap<String, String>>>,
    #[serde(default)]
    location: Vec<Spanned<RawLocation>>,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum RawMatch {
    Prefix,
    Exact,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLocation {
    path: String,
    #[serde(rename = "match")]
    kind: Option<RawMatch>,
    root: Option<String>,
    index: Option<Vec<String>>,
    autoindex: Option<bool>,
    client_max_body_size: Option<Spanned<RawSize>>,
    error_pages: Option<BTreeMap<String, String>>,
    methods: Option<Vec<String>>,
    #[serde(default)]
    upload_enabled: bool,
    upload_store: Option<String>,
    #[serde(default)]
    cgi: BTreeMap<String, String>,
    redirect: Option<RawRedirect>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRedirect {
    status: u16,
    target: String,
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ServerError> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(Config::from_toml(&text)?)
    }

    pub fn from_toml(text: &str) -> Result<Config, ConfigError> {
        let raw: RawConfig = toml::from_str(text).map_err(|err| {
            let offset = err.span().map(|span| span.start).unwrap_or(0);
            ConfigError::at_offset(err.message().trim_end(), text, offset)
        })?;
        Loader { text }.config(raw)
    }
}

struct Loader<'a> {
    text: &'a str,
}

impl<'a> Loader<'a> {
    fn error(&self, message: impl Into<String>, offset: usize) -> ConfigError {
        ConfigError::at_offset(message, self.text, offset)
    }

    fn config(&self, raw: RawConfig) -> Result<Config, ConfigError> {
        if raw.server.is_empty() {
            return Err(self.error("at least one [[server]] block is required", 0));
        }
        let runtime = self.runtime(raw.runtime)?;
        let logging = self.logging(raw.logging)?;
        let servers = raw
            .server
            .into_iter()
            .map(|server| self.server(server))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Config {
            runtime,
            logging,
            servers,
        })
    }

    fn runtime(&self, raw: RawRuntime) -> Result<RuntimeConfig, ConfigError> {
        if raw.max_events == 0 {
            return Err(self.error("runtime.max_events cannot be 0", 0));
        }
        if raw.poll_timeout_ms < 0 {
            return Err(self.error("runtime.poll_timeout_ms cannot be negative", 0));
        }
        let max_request_bytes = match raw.max_request_bytes {
            Some(size) => self.size(&size)?,
            None => RuntimeConfig::default().max_request_bytes,
        };
        let max_cgi_output = match raw.max_cgi_output {
            Some(size) => self.size(&size)?,
            None => RuntimeConfig::default().max_cgi_output,
        };
        Ok(RuntimeConfig {
            poll_timeout_ms: raw.poll_timeout_ms,
            max_events: raw.max_events,
            cgi_timeout: Duration::from_secs(raw.cgi_timeout_secs),
            client_timeout: Duration::from_secs(raw.client_timeout_secs),
            max_request_bytes,
            max_cgi_output,
        })
    }

    fn logging(&self, raw: RawLogging) -> Result<LoggingConfig, ConfigError> {
        let level = match &raw.level {
            Some(level) => {
                let name = level.get_ref().to_ascii_lowercase();
                if !["trace", "debug", "info", "warn", "error"].contains(&name.as_str()) {
                    return Err(self.error(
                        format!("unknown log level '{}'", level.get_ref()),
                        level.span().start,
                    ));
                }
                name
            }
            None => "info".to_string(),
        };
        Ok(LoggingConfig {
            level,
            file: raw.file.map(PathBuf::from),
        })
    }

    fn server(&self, spanned: Spanned<RawServer>) -> Result<ServerConfig, ConfigError> {
        let start = spanned.span().start;
        let raw = spanned.into_inner();

        let host = match &raw.host {
            Some(host) => parse_host(host.get_ref())
                .ok_or_else(|| self.error(format!("invalid host '{}'", host.get_ref()), host.span().start))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let port = *raw.port.get_ref();
        if port == 0 {
            return Err(self.error("port cannot be 0", raw.port.span().start));
        }
        let client_max_body_size = match &raw.client_max_body_size {
            Some(size) => self.size(size)?,
            None => DEFAULT_MAX_BODY_SIZE,
        };
        let error_pages = match &raw.error_pages {
            Some(pages) => self.error_pages(pages.get_ref(), pages.span().start)?,
            None => BTreeMap::new(),
        };

        let mut locations: Vec<LocationConfig> = Vec::with_capacity(raw.location.len());
        for location in raw.location {
            let offset = location.span().start;
            let location = self.location(location)?;
            if locations
                .iter()
                .any(|other| other.path == location.path)
            {
                return Err(self.error(format!("duplicate location '{}'", location.path), offset));
            }
            locations.push(location);
        }
        if raw.server_names.iter().any(|name| name.is_empty()) {
            return Err(self.error("server_names cannot contain an empty name", start));
        }

        Ok(ServerConfig {
            host,
            port,
            server_names: raw.server_names,
            root: PathBuf::from(raw.root.unwrap_or_else(|| "www".to_string())),
            index: raw.index.unwrap_or_else(|| vec!["index.html".to_string()]),
            autoindex: raw.autoindex,
            client_max_body_size,
            error_pages,
            locations,
        })
    }

    fn location(&self, spanned: Spanned<RawLocation>) -> Result<LocationConfig, ConfigError> {
        let offset = spanned.span().start;
        let raw = spanned.into_inner();

        if !raw.path.starts_with('/') {
            return Err(self.error(
                format!("location path '{}' must start with '/'", raw.path),
                offset,
            ));
        }

        let methods = match raw.methods {
            Some(tokens) => {
                if tokens.is_empty() {
                    return Err(self.error("methods requires at least one method", offset));
                }
                tokens
                    .iter()
                    .map(|token| {
                        Method::from_token(token).ok_or_else(|| {
                            self.error(format!("unsupported method '{}'", token), offset)
                        })
                    })
                    .collect::<Result<BTreeSet<_>, _>>()?
            }
            None => Method::ALL.iter().copied().collect(),
        };

        let client_max_body_size = match &raw.client_max_body_size {
            Some(size) => Some(self.size(size)?),
            None => None,
        };
        let error_pages = match &raw.error_pages {
            Some(pages) => Some(self.error_pages(pages, offset)?),
            None => None,
        };

        let mut cgi = BTreeMap::new();
        for (extension, interpreter) in raw.cgi {
            if !extension.starts_with('.') || extension.len() < 2 {
                return Err(self.error(
                    format!("cgi extension '{}' must look like '.ext'", extension),
                    offset,
                ));
            }
            cgi.insert(extension, PathBuf::from(interpreter));
        }

        let redirect = match raw.redirect {
            Some(redirect) => {
                if !(300..400).contains(&redirect.status) {
                    return Err(self.error(
                        format!("redirect status {} is not a 3xx code", redirect.status),
                        offset,
                    ));
                }
                Some(Redirect {
                    status: redirect.status,
                    target: redirect.target,
                })
            }
            None => None,
        };

        if raw.upload_enabled && raw.upload_store.is_none() {
            return Err(self.error("upload_enabled requires upload_store", offset));
        }

        Ok(LocationConfig {
            kind: match raw.kind {
                Some(RawMatch::Exact) => MatchKind::Exact,
                Some(RawMatch::Prefix) | None => MatchKind::Prefix,
            },
            path: raw.path,
            root: raw.root.map(PathBuf::from),
            index: raw.index,
            autoindex: raw.autoindex,
            client_max_body_size,
            error_pages,
            methods,
            upload_enabled: raw.upload_enabled,
            upload_store: raw.upload_store.map(PathBuf::from),
            cgi,
            redirect,
        })
    }

    fn size(&self, size: &Spanned<RawSize>) -> Result<u64, ConfigError> {
        match size.get_ref() {
            RawSize::Bytes(bytes) => Ok(*bytes),
            RawSize::Text(text) => {
                parse_size(text).map_err(|message| self.error(message, size.span().start))
            }
        }
    }

    fn error_pages(
        &self,
        raw: &BTreeMap<String, String>,
        offset: usize,
    ) -> Result<BTreeMap<u16, String>, ConfigError> {
        let mut pages = BTreeMap::new();
        for (code, page) in raw {
            let status = code
                .parse::<u16>()
                .ok()
                .filter(|status| (300..600).contains(status))
                .ok_or_else(|| {
                    self.error(format!("error page code '{}' is not 300-599", code), offset)
                })?;
            if page.is_empty() {
                return Err(self.error(format!("error page for {} is empty", status), offset));
            }
            pages.insert(status, page.clone());
        }
        Ok(pages)
    }
}

fn parse_host(host: &str) -> Option<IpAddr> {
    if host.eq_ignore_ascii_case("localhost") {
        return Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse().ok()
}

/// Parses `<digits>[k|m|g]` into a byte count.
pub fn parse_size(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    if digits_end == 0 {
        return Err(format!("size '{}' must start with a number", text));
    }
    let value: u64 = text[..digits_end]
        .parse()
        .map_err(|_| format!("size '{}' is out of range", text))?;
    let multiplier: u64 = match text[digits_end..].to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        unit => return Err(format!("unknown size unit '{}', expected k, m or g", unit)),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is out of range", text))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "runtime: poll {}ms, {} events, cgi timeout {}s, client timeout {}s, request cap {} bytes, cgi output cap {} bytes",
            self.runtime.poll_timeout_ms,
            self.runtime.max_events,
            self.runtime.cgi_timeout.as_secs(),
            self.runtime.client_timeout.as_secs(),
            self.runtime.max_request_bytes,
            self.runtime.max_cgi_output
        )?;
        for (i, server) in self.servers.iter().enumerate() {
            writeln!(f, "server #{} {}:{}", i, server.host, server.port)?;
            if !server.server_names.is_empty() {
                writeln!(f, "  server_names: {}", server.server_names.join(" "))?;
            }
            writeln!(f, "  root: {}", server.root.display())?;
            writeln!(f, "  index: {}", server.index.join(" "))?;
            writeln!(f, "  autoindex: {}", server.autoindex)?;
            writeln!(f, "  client_max_body_size: {}", server.client_max_body_size)?;
            for (code, page) in &server.error_pages {
                writeln!(f, "  error_page {} {}", code, page)?;
            }
            for location in &server.locations {
                write!(f, "{}", location)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for LocationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.kind {
            MatchKind::Exact => "= ",
            MatchKind::Prefix => "",
        };
        writeln!(f, "  location {}{}", marker, self.path)?;
        if let Some(root) = &self.root {
            writeln!(f, "    root: {}", root.display())?;
        }
        if let Some(index) = &self.index {
            writeln!(f, "    index: {}", index.join(" "))?;
        }
        if let Some(autoindex) = self.autoindex {
            writeln!(f, "    autoindex: {}", autoindex)?;
        }
        if let Some(size) = self.client_max_body_size {
            writeln!(f, "    client_max_body_size: {}", size)?;
        }
        if let Some(pages) = &self.error_pages {
            for (code, page) in pages {
                writeln!(f, "    error_page {} {}", code, page)?;
            }
        }
        let methods: Vec<&str> = self.methods.iter().map(Method::as_str).collect();
        writeln!(f, "    methods: {}", methods.join(" "))?;
        if self.upload_enabled {
            if let Some(store) = &self.upload_store {
                writeln!(f, "    upload_store: {}", store.display())?;
            }
        }
        for (extension, interpreter) in &self.cgi {
            writeln!(f, "    cgi {} {}", extension, interpreter.display())?;
        }
        if let Some(redirect) = &self.redirect {
            writeln!(f, "    return {} {}", redirect.status, redirect.target)?;
        }
        Ok(())
    }
}
