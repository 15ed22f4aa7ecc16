//! HTTP/1.1 message types.
//!
//! - **`request`**: the parsed request and its parse state
//! - **`parser`**: incremental request parser fed by the event loop
//! - **`response`**: response value and its wire form
//! - **`mime`**: content types by file extension

pub mod mime;
pub mod parser;
pub mod request;
pub mod response;

pub use parser::{ParseError, RequestParser};
pub use request::{HttpRequest, ParseState};
pub use response::HttpResponse;
