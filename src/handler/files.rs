//! GET: files, index files and directory listings.

use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use super::{encode_path, error_response, io_status, resolve_path};
use crate::dispatch::MatchedConfig;
use crate::http::mime::mime_type;
use crate::http::{HttpRequest, HttpResponse};

pub fn get(request: &HttpRequest, matched: &MatchedConfig<'_>) -> HttpResponse {
    let path = match resolve_path(&request.path, matched) {
        Some(path) => path,
        None => return error_response(403, Some(matched)),
    };
    let metadata = match fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) => {
            debug!("GET {} -> {}: {}", request.path, path.display(), err);
            return error_response(io_status(&err), Some(matched));
        }
    };

    if !metadata.is_dir() {
        return serve_file(&path, matched);
    }
    for index in matched.index() {
        let candidate = path.join(index);
        if candidate.is_file() {
            return serve_file(&candidate, matched);
        }
    }
    if matched.autoindex() {
        return match directory_listing(&path, &request.path) {
            Ok(page) => HttpResponse::with_body(200, "text/html", page),
            Err(err) => {
                warn!("listing {}: {}", path.display(), err);
                error_response(io_status(&err), Some(matched))
            }
        };
    }
    debug!("no index in {} and autoindex is off", path.display());
    error_response(403, Some(matched))
}

fn serve_file(path: &Path, matched: &MatchedConfig<'_>) -> HttpResponse {
    match fs::read(path) {
        Ok(body) => HttpResponse::with_body(200, mime_type(path), body),
        Err(err) => {
            warn!("reading {}: {}", path.display(), err);
            error_response(io_status(&err), Some(matched))
        }
    }
}

/// HTML index of `dir`, with links relative to `uri_path`.
pub fn directory_listing(dir: &Path, uri_path: &str) -> std::io::Result<String> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
        entries.push((name, is_dir));
    }
    entries.sort();

    let base = if uri_path.ends_with('/') {
        uri_path.to_string()
    } else {
        format!("{}/", uri_path)
    };
    let mut page = format!(
        "<html><head><title>Index of {base}</title></head><body><h1>Index of {base}</h1><ul>",
        base = HtmlEscaped(&base)
    );
    if base != "/" {
        page.push_str("<li><a href=\"../\">../</a></li>");
    }
    let href_base = encode_path(&base);
    for (name, is_dir) in entries {
        let slash = if is_dir { "/" } else { "" };
        page.push_str(&format!(
            "<li><a href=\"{href}{encoded}{slash}\">{name}{slash}</a></li>",
            href = href_base,
            encoded = urlencoding::encode(&name),
            name = HtmlEscaped(&name),
            slash = slash
        ));
    }
    page.push_str("</ul></body></html>");
    Ok(page)
}

struct HtmlEscaped<'a>(&'a str);

impl fmt::Display for HtmlEscaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '\'' => f.write_str("&#39;")?,
                '"' => f.write_str("&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}
