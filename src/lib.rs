//! A single-threaded HTTP/1.1 origin server with virtual hosts, static files,
//! uploads and CGI, multiplexed over epoll.

pub mod cgi;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod http;
pub mod server;

pub use config::Config;
pub use error::{ConfigError, ServerError};
pub use server::Server;
