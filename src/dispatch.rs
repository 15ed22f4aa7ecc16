//! Virtual-host and location selection.
//!
//! [`Dispatcher::dispatch`] is a pure function of the request, the local
//! endpoint and the configuration tree. Effective values are resolved on the
//! returned [`MatchedConfig`] one attribute at a time: a location value wins
//! only when the location sets it.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{LocationConfig, MatchKind, Method, Redirect, ServerConfig};
use crate::http::HttpRequest;

/// References into the configuration tree selected for one request.
#[derive(Debug, Clone, Copy)]
pub struct MatchedConfig<'a> {
    pub server: &'a ServerConfig,
    pub location: Option<&'a LocationConfig>,
}

pub struct Dispatcher<'a> {
    servers: &'a [ServerConfig],
}

impl<'a> Dispatcher<'a> {
    pub fn new(servers: &'a [ServerConfig]) -> Self {
        Dispatcher { servers }
    }

    /// Picks the server and location for a request that arrived on
    /// `local_addr:local_port`. `None` means no server listens there.
    pub fn dispatch(
        &self,
        request: &HttpRequest,
        local_addr: IpAddr,
        local_port: u16,
    ) -> Option<MatchedConfig<'a>> {
        let server = self.find_server(request, local_addr, local_port)?;
        let location = find_location(&request.path, server);
        debug!(
            "dispatched {} {} to server {}:{} location {:?}",
            request.method,
            request.path,
            server.host,
            server.port,
            location.map(|location| location.path.as_str())
        );
        Some(MatchedConfig { server, location })
    }

    fn find_server(
        &self,
        request: &HttpRequest,
        local_addr: IpAddr,
        local_port: u16,
    ) -> Option<&'a ServerConfig> {
        let host = request.host();
        let mut default = None;

        let candidates = self.servers.iter().filter(|server| {
            (server.host.is_unspecified() || server.host == local_addr) && server.port == local_port
        });
        for server in candidates {
            if default.is_none() {
                default = Some(server);
            }
            if let Some(host) = &host {
                if server
                    .server_names
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(host))
                {
                    return Some(server);
                }
            }
        }
        default
    }
}

/// Exact match first, otherwise the longest matching prefix.
pub fn find_location<'a>(path: &str, server: &'a ServerConfig) -> Option<&'a LocationConfig> {
    let mut best: Option<&'a LocationConfig> = None;
    for location in &server.locations {
        match location.kind {
            MatchKind::Exact => {
                if location.path == path {
                    return Some(location);
                }
            }
            MatchKind::Prefix => {
                let longer = best.map_or(true, |best| location.path.len() > best.path.len());
                if path.starts_with(location.path.as_str()) && longer {
                    best = Some(location);
                }
            }
        }
    }
    best
}

impl<'a> MatchedConfig<'a> {
    pub fn root(&self) -> &'a Path {
        self.location
            .and_then(|location| location.root.as_deref())
            .unwrap_or(&self.server.root)
    }

    pub fn index(&self) -> &'a [String] {
        self.location
            .and_then(|location| location.index.as_deref())
            .unwrap_or(&self.server.index)
    }

    pub fn autoindex(&self) -> bool {
        self.location
            .and_then(|location| location.autoindex)
            .unwrap_or(self.server.autoindex)
    }

    pub fn max_body_size(&self) -> u64 {
        self.location
            .and_then(|location| location.client_max_body_size)
            .unwrap_or(self.server.client_max_body_size)
    }

    pub fn error_pages(&self) -> &'a BTreeMap<u16, String> {
        self.location
            .and_then(|location| location.error_pages.as_ref())
            .unwrap_or(&self.server.error_pages)
    }

    /// Upload directory; uploads are a location-only feature.
    pub fn upload_store(&self) -> Option<&'a Path> {
        self.location
            .filter(|location| location.upload_enabled)
            .and_then(|location| location.upload_store.as_deref())
    }

    pub fn allowed_methods(&self) -> BTreeSet<Method> {
        match self.location {
            Some(location) => location.methods.clone(),
            None => Method::ALL.iter().copied().collect(),
        }
    }

    pub fn redirect(&self) -> Option<&'a Redirect> {
        self.location.and_then(|location| location.redirect.as_ref())
    }

    pub fn cgi_interpreter(&self, extension: &str) -> Option<&'a PathBuf> {
        self.location.and_then(|location| location.cgi.get(extension))
    }

    pub fn has_cgi(&self) -> bool {
        self.location.map_or(false, |location| !location.cgi.is_empty())
    }

    pub fn server_name(&self) -> &'a str {
        self.server
            .server_names
            .first()
            .map(String::as_str)
            .unwrap_or("localhost")
    }
}
