use chrono::Utc;

const HTTP_VERSION: &str = "HTTP/1.1";
pub const SERVER_NAME: &str = "webserv";

/// Standard reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => match status / 100 {
            1 => "Informational",
            2 => "Success",
            3 => "Redirection",
            4 => "Client Error",
            _ => "Server Error",
        },
    }
}

/// A response ready for serialization.
///
/// Headers keep their insertion order so that repeated fields forwarded from
/// a CGI script (`Set-Cookie`, say) survive untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// A response carrying `body` with the given content type.
    pub fn with_body(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut response = HttpResponse::new(status);
        response.set_header("Content-Type", content_type);
        response.set_body(body);
        response
    }

    pub fn reason(&self) -> &'static str {
        reason_phrase(self.status)
    }

    /// Replaces every header called `name` (case-insensitively) with one value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Sets the body and keeps `Content-Length` in step with it.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        self.set_header("Content-Length", self.body.len().to_string());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "{} {} {}\r\n",
            HTTP_VERSION,
            self.status,
            reason_phrase(self.status)
        );
        let fixed = [
            ("Server", SERVER_NAME.to_string()),
            (
                "Date",
                Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            ),
        ];
        for (name, value) in fixed.iter() {
            if !self.has_header(name) {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        // Every connection carries exactly one response.
        head.push_str("Connection: close\r\n");
        let bodiless = self.status == 204 || self.status == 304;
        if !bodiless {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        for (key, value) in &self.headers {
            if key.eq_ignore_ascii_case("Connection") || key.eq_ignore_ascii_case("Content-Length")
            {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", key, value));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if !bodiless {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

/// The minimal HTML page used when no custom error page applies.
pub fn default_error_page(status: u16) -> String {
    format!(
        "<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1><hr><p>{server}</p></body></html>",
        code = status,
        reason = reason_phrase(status),
        server = SERVER_NAME
    )
}
