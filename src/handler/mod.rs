//! Turns a dispatched request into a response or a running CGI session.
//!
//! Checks run in a fixed order: redirect, method, body size, CGI, then the
//! per-method handlers in [`files`] and [`upload`].

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::cgi::{CgiCommand, CgiSession};
use crate::config::Method;
use crate::dispatch::MatchedConfig;
use crate::http::mime::mime_type;
use crate::http::response::default_error_page;
use crate::http::{HttpRequest, HttpResponse};

pub mod files;
pub mod upload;

/// What the event loop gets back for a request.
#[derive(Debug)]
pub enum Outcome {
    Response(HttpResponse),
    /// A started session; its response arrives once it finishes.
    Cgi(CgiSession),
}

pub fn handle(request: &HttpRequest, matched: &MatchedConfig<'_>, client: SocketAddr) -> Outcome {
    if let Some(redirect) = matched.redirect() {
        info!("redirecting {} to {} ({})", request.uri, redirect.target, redirect.status);
        let mut response = HttpResponse::with_body(
            redirect.status,
            "text/plain",
            format!("Redirecting to {}\n", redirect.target),
        );
        response.set_header("Location", redirect.target.as_str());
        return Outcome::Response(response);
    }

    let method = match Method::from_token(&request.method) {
        Some(method) => method,
        None => {
            warn!("unsupported method {}", request.method);
            return Outcome::Response(error_response(501, Some(matched)));
        }
    };
    let allowed = matched.allowed_methods();
    if !allowed.contains(&method) {
        warn!("{} not allowed for {}", method, request.path);
        let mut response = error_response(405, Some(matched));
        let allow: Vec<&str> = allowed.iter().map(Method::as_str).collect();
        response.set_header("Allow", allow.join(", "));
        return Outcome::Response(response);
    }

    let body_size = request.body.len().max(request.content_length) as u64;
    if body_size > matched.max_body_size() {
        warn!(
            "body of {} bytes exceeds limit of {} for {}",
            body_size,
            matched.max_body_size(),
            request.path
        );
        return Outcome::Response(error_response(413, Some(matched)));
    }

    if matched.has_cgi() {
        if let Some(outcome) = start_cgi(request, matched, client) {
            return outcome;
        }
    }

    let response = match method {
        Method::Get => files::get(request, matched),
        Method::Post => upload::post(request, matched),
        Method::Delete => upload::delete(request, matched),
    };
    Outcome::Response(response)
}

/// A script named by the request path, plus the path info after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiTarget {
    pub interpreter: PathBuf,
    pub script_name: String,
    pub path_info: String,
}

/// Finds the first path segment whose extension has an interpreter.
pub fn find_cgi_target(path: &str, matched: &MatchedConfig<'_>) -> Option<CgiTarget> {
    let mut offset = 0;
    for segment in path.split('/') {
        let end = offset + segment.len();
        if let Some(dot) = segment.rfind('.') {
            if let Some(interpreter) = matched.cgi_interpreter(&segment[dot..]) {
                return Some(CgiTarget {
                    interpreter: interpreter.clone(),
                    script_name: path[..end].to_string(),
                    path_info: path[end..].to_string(),
                });
            }
        }
        offset = end + 1;
    }
    None
}

fn start_cgi(
    request: &HttpRequest,
    matched: &MatchedConfig<'_>,
    client: SocketAddr,
) -> Option<Outcome> {
    let target = find_cgi_target(&request.path, matched)?;
    let script = match resolve_path(&target.script_name, matched) {
        Some(script) => script,
        None => return Some(Outcome::Response(error_response(403, Some(matched)))),
    };
    let script = match script.canonicalize() {
        Ok(script) if script.is_file() => script,
        Ok(script) => {
            warn!("cgi script {} is not a file", script.display());
            return Some(Outcome::Response(error_response(403, Some(matched))));
        }
        Err(err) => {
            warn!("cgi script {}: {}", script.display(), err);
            return Some(Outcome::Response(error_response(
                io_status(&err),
                Some(matched),
            )));
        }
    };

    let command = CgiCommand::for_request(
        request,
        matched,
        &target.interpreter,
        &script,
        &target.script_name,
        &target.path_info,
        client,
    );
    let mut session = CgiSession::new(command);
    session.start();
    Some(Outcome::Cgi(session))
}

/// Maps a request path onto the filesystem.
///
/// A location whose path ends in `/` is replaced by the effective root; a
/// non-slash location that matched exactly maps to its last segment. `None`
/// for paths with a `..` segment.
pub fn resolve_path(uri_path: &str, matched: &MatchedConfig<'_>) -> Option<PathBuf> {
    if uri_path.split('/').any(|segment| segment == "..") {
        return None;
    }
    let suffix = match matched.location {
        Some(location) if uri_path.starts_with(location.path.as_str()) => {
            if uri_path == location.path && !location.path.ends_with('/') {
                location.path.rsplit('/').next().unwrap_or("")
            } else {
                &uri_path[location.path.len()..]
            }
        }
        _ => uri_path,
    };

    let mut path = matched.root().to_path_buf();
    let suffix = suffix.trim_start_matches('/');
    if !suffix.is_empty() {
        path.push(suffix);
    }
    Some(path)
}

/// Error response, using the configured page for `status` when there is one.
pub fn error_response(status: u16, matched: Option<&MatchedConfig<'_>>) -> HttpResponse {
    if let Some(matched) = matched {
        if let Some(page) = matched.error_pages().get(&status) {
            let path = matched.server.root.join(page.trim_start_matches('/'));
            match fs::read(&path) {
                Ok(body) => return HttpResponse::with_body(status, mime_type(&path), body),
                Err(err) => warn!("error page {} for {}: {}", path.display(), status, err),
            }
        }
    }
    debug!("generated error page for {}", status);
    HttpResponse::with_body(status, "text/html", default_error_page(status))
}

/// Percent-encodes each segment of `path`, keeping the slashes.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub(crate) fn io_status(err: &io::Error) -> u16 {
    match err.kind() {
        io::ErrorKind::NotFound => 404,
        io::ErrorKind::PermissionDenied => 403,
        _ => 500,
    }
}
