use webserv::http::parser::MAX_HEAD_BYTES;
use webserv::http::{ParseError, ParseState, RequestParser};

fn parse_in_chunks(bytes: &[u8], chunk: usize) -> RequestParser {
    let mut parser = RequestParser::new();
    for piece in bytes.chunks(chunk) {
        parser.feed(piece);
    }
    parser
}

#[test]
fn test_parse_get_with_query() {
    let mut parser = RequestParser::new();
    let state = parser.feed(b"GET /a/b?x=1 HTTP/1.1\r\nHost: h\r\n\r\n");

    assert_eq!(state, ParseState::Complete);
    let request = parser.request();
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/a/b");
    assert_eq!(request.query.get("x").map(String::as_str), Some("1"));
    assert_eq!(request.query.len(), 1);
    assert!(request.body.is_empty());
    assert_eq!(request.header("Host"), Some("h"));
}

#[test]
fn test_parse_post_with_body() {
    let parser = parse_in_chunks(
        b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
        4096,
    );

    assert!(parser.is_complete());
    assert_eq!(parser.request().body, b"hello");
    assert_eq!(parser.request().content_length, 5);
}

#[test]
fn test_chunk_boundaries_do_not_matter() {
    let raw: &[u8] =
        b"POST /cgi/app.py?a=1&b=2 HTTP/1.1\r\nHost: example.com\r\nX-Thing: y\r\nContent-Length: 11\r\n\r\nhello world";
    let whole = parse_in_chunks(raw, raw.len());
    assert!(whole.is_complete());

    for size in [1, 2, 3, 7, 16, 33] {
        let chunked = parse_in_chunks(raw, size);
        assert_eq!(chunked.request(), whole.request(), "chunk size {}", size);
    }
}

#[test]
fn test_one_byte_feeds_reach_complete() {
    let raw = b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
    let mut parser = RequestParser::new();
    for byte in raw.iter() {
        let state = parser.feed(std::slice::from_ref(byte));
        assert_ne!(state, ParseState::Error);
    }
    assert_eq!(parser.state(), ParseState::Complete);
    assert_eq!(parser.request().body, b"abc");
}

#[test]
fn test_partial_input_waits() {
    let mut parser = RequestParser::new();
    assert_eq!(parser.feed(b"GET / HT"), ParseState::RequestLine);
    assert_eq!(parser.feed(b"TP/1.1\r\nHost: h\r\n"), ParseState::Headers);
    assert_eq!(parser.buffered(), "Host: h\r\n".len());
    assert_eq!(parser.feed(b"\r\n"), ParseState::Complete);
}

#[test]
fn test_request_without_headers() {
    let mut parser = RequestParser::new();
    assert_eq!(parser.feed(b"GET / HTTP/1.1\r\n\r\n"), ParseState::Complete);
    assert!(parser.request().headers.is_empty());
}

#[test]
fn test_extraneous_data_is_rejected() {
    let mut parser = RequestParser::new();
    let state = parser.feed(b"GET / HTTP/1.1\r\nHost: h\r\n\r\nX");

    assert_eq!(state, ParseState::Error);
    assert!(parser.has_error());
    assert_eq!(parser.error(), Some(&ParseError::ExtraneousData(1)));
}

#[test]
fn test_body_longer_than_declared_is_rejected() {
    let mut parser = RequestParser::new();
    let state = parser.feed(b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nabc");
    assert_eq!(state, ParseState::Error);
}

#[test]
fn test_malformed_request_lines() {
    for raw in [
        &b"GET /\r\n\r\n"[..],
        b"GET / HTTP/1.1 extra\r\n\r\n",
        b"\r\n\r\n",
    ] {
        let mut parser = RequestParser::new();
        assert_eq!(parser.feed(raw), ParseState::Error);
        assert!(matches!(
            parser.error(),
            Some(ParseError::MalformedRequestLine(_))
        ));
    }
}

#[test]
fn test_unsupported_version() {
    let mut parser = RequestParser::new();
    parser.feed(b"GET / HTTP/1.0\r\n\r\n");
    assert_eq!(
        parser.error(),
        Some(&ParseError::UnsupportedVersion("HTTP/1.0".to_string()))
    );
}

#[test]
fn test_header_without_colon() {
    let mut parser = RequestParser::new();
    parser.feed(b"GET / HTTP/1.1\r\nHost h\r\n\r\n");
    assert!(matches!(parser.error(), Some(ParseError::MalformedHeader(_))));
}

#[test]
fn test_bad_and_missing_content_length() {
    let mut parser = RequestParser::new();
    parser.feed(b"POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n");
    assert_eq!(
        parser.error(),
        Some(&ParseError::InvalidContentLength("ten".to_string()))
    );

    let mut parser = RequestParser::new();
    parser.feed(b"POST / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(parser.error(), Some(&ParseError::MissingContentLength));
}

#[test]
fn test_headers_are_case_folded_last_wins() {
    let mut parser = RequestParser::new();
    parser.feed(b"GET / HTTP/1.1\r\nX-Dup: one\r\nx-dup: two\r\nHOST: h\r\n\r\n");

    let request = parser.request();
    assert_eq!(request.headers.get("x-dup").map(String::as_str), Some("two"));
    assert_eq!(request.header("host"), Some("h"));
    assert_eq!(request.headers.len(), 2);
}

#[test]
fn test_terminal_states_ignore_input() {
    let mut parser = RequestParser::new();
    parser.feed(b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(parser.feed(b"GET /again HTTP/1.1\r\n\r\n"), ParseState::Complete);
    assert_eq!(parser.request().path, "/");

    let mut parser = RequestParser::new();
    parser.feed(b"BROKEN\r\n");
    assert_eq!(parser.feed(b"GET / HTTP/1.1\r\n\r\n"), ParseState::Error);
}

#[test]
fn test_unterminated_request_line_is_cut_off() {
    let mut parser = RequestParser::new();
    let chunk = [b'A'; 4096];
    let mut fed = 0;
    while !parser.has_error() {
        parser.feed(&chunk);
        fed += chunk.len();
        assert!(fed <= 4 * 1024 * 1024, "parser kept buffering");
    }

    assert!(fed <= MAX_HEAD_BYTES + chunk.len());
    assert!(matches!(parser.error(), Some(ParseError::HeadTooLarge(_))));
}

#[test]
fn test_unterminated_header_block_is_cut_off() {
    let mut parser = RequestParser::new();
    parser.feed(b"GET / HTTP/1.1\r\nX-Filler: ");
    for _ in 0..8 {
        parser.feed(&[b'a'; 4096]);
    }
    assert!(matches!(parser.error(), Some(ParseError::HeadTooLarge(_))));
}

#[test]
fn test_large_head_under_the_cap_still_parses() {
    let mut raw = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
    raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES - 64));
    raw.extend_from_slice(b"\r\n\r\n");

    let parser = parse_in_chunks(&raw, 7);
    assert!(parser.is_complete(), "{:?}", parser.error());
    assert_eq!(parser.request().header("x-filler").map(str::len), Some(MAX_HEAD_BYTES - 64));
}

#[test]
fn test_path_is_percent_decoded() {
    let mut parser = RequestParser::new();
    parser.feed(b"GET /docs/a%20b%3C.txt?q=%20 HTTP/1.1\r\n\r\n");

    assert!(parser.is_complete());
    assert_eq!(parser.request().path, "/docs/a b<.txt");
    assert_eq!(parser.request().uri, "/docs/a%20b%3C.txt?q=%20");

    let mut parser = RequestParser::new();
    parser.feed(b"GET /x%00y HTTP/1.1\r\n\r\n");
    assert!(parser.has_error());
}
