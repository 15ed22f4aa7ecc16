//! POST uploads into the location's store, and DELETE.

use std::fs;

use chrono::Utc;
use tracing::{error, info, warn};

use super::{encode_path, error_response, io_status, resolve_path};
use crate::dispatch::MatchedConfig;
use crate::http::{HttpRequest, HttpResponse};

const DEFAULT_NAME: &str = "uploaded_file";

pub fn post(request: &HttpRequest, matched: &MatchedConfig<'_>) -> HttpResponse {
    let store = match matched.upload_store() {
        Some(store) => store,
        None => {
            warn!("POST {}: uploads are not enabled here", request.path);
            return error_response(403, Some(matched));
        }
    };
    if let Err(err) = fs::create_dir_all(store) {
        error!("cannot create upload store {}: {}", store.display(), err);
        return error_response(500, Some(matched));
    }

    let name = upload_filename(request.header("content-disposition"));
    let now = Utc::now();
    let stored = format!(
        "{}_{}_{}",
        now.timestamp(),
        now.timestamp_subsec_micros(),
        name
    );
    let path = store.join(&stored);
    if let Err(err) = fs::write(&path, &request.body) {
        error!("writing upload {}: {}", path.display(), err);
        return error_response(io_status(&err), Some(matched));
    }
    info!("stored {} bytes in {}", request.body.len(), path.display());

    let location = format!(
        "{}/{}",
        encode_path(request.path.trim_end_matches('/')),
        stored
    );
    let mut response = HttpResponse::with_body(
        201,
        "text/html",
        format!(
            "<html><body><h1>201 Created</h1><p><a href=\"{0}\">{0}</a></p></body></html>",
            location
        ),
    );
    response.set_header("Location", location);
    response
}

/// The client's file name, cut down to something safe to store and to put in
/// a URL: its last path component, with anything outside `[A-Za-z0-9._-]`
/// replaced by `_`.
pub fn upload_filename(disposition: Option<&str>) -> String {
    let raw = disposition
        .and_then(|value| {
            let start = value.find("filename=")? + "filename=".len();
            let rest = value[start..].trim_start();
            let rest = rest.strip_prefix('"')?;
            rest.split('"').next()
        })
        .unwrap_or(DEFAULT_NAME);

    let name = raw
        .trim()
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .replace("..", "")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    if name.is_empty() || name == "." {
        DEFAULT_NAME.to_string()
    } else {
        name
    }
}

pub fn delete(request: &HttpRequest, matched: &MatchedConfig<'_>) -> HttpResponse {
    let target = match matched.location {
        Some(location) if request.path.starts_with(location.path.as_str()) => {
            match &location.upload_store {
                Some(store) => {
                    let rest = &request.path[location.path.len()..];
                    if rest.split('/').any(|segment| segment == "..") {
                        None
                    } else {
                        Some(store.join(rest.trim_start_matches('/')))
                    }
                }
                None => resolve_path(&request.path, matched),
            }
        }
        _ => resolve_path(&request.path, matched),
    };
    let path = match target {
        Some(path) => path,
        None => return error_response(403, Some(matched)),
    };

    let metadata = match fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!("DELETE {}: {}", path.display(), err);
            return error_response(io_status(&err), Some(matched));
        }
    };
    if !metadata.is_file() {
        warn!("DELETE {}: not a regular file", path.display());
        return error_response(403, Some(matched));
    }
    match fs::remove_file(&path) {
        Ok(()) => {
            info!("deleted {}", path.display());
            HttpResponse::new(204)
        }
        Err(err) => {
            error!("DELETE {}: {}", path.display(), err);
            error_response(io_status(&err), Some(matched))
        }
    }
}
