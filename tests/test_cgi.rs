use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use webserv::cgi::{CgiCommand, CgiSession, CgiState};
use webserv::dispatch::Dispatcher;
use webserv::handler::{self, Outcome};
use webserv::http::{HttpRequest, RequestParser};
use webserv::Config;

const PATH: &str = "/usr/local/bin:/usr/bin:/bin";

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn drive(session: &mut CgiSession) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !session.is_finished() {
        assert!(Instant::now() < deadline, "cgi stuck in {:?}", session.state());
        session.on_writable(&mut ());
        session.on_readable(&mut ());
        session.poll_exit(&mut ());
        thread::sleep(Duration::from_millis(2));
    }
}

/// Waits until the child is reaped so no zombie is left behind.
fn settle(session: &mut CgiSession) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while session.needs_reaping() {
        assert!(Instant::now() < deadline, "child never exited");
        session.poll_exit(&mut ());
        thread::sleep(Duration::from_millis(2));
    }
}

fn assert_gone(pid: u32) {
    let rc = unsafe { libc::waitpid(pid as libc::pid_t, std::ptr::null_mut(), libc::WNOHANG) };
    assert_eq!(rc, -1, "child {} still waitable", pid);
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ECHILD)
    );
}

fn shell(dir: &Path, name: &str, body: &str) -> CgiCommand {
    let path = script(dir, name, body);
    CgiCommand::new("/bin/sh", path).env("PATH", PATH)
}

fn parse(raw: &[u8]) -> HttpRequest {
    let mut parser = RequestParser::new();
    parser.feed(raw);
    assert!(parser.is_complete(), "{:?}", parser.error());
    parser.request().clone()
}

fn cgi_config(root: &Path) -> Config {
    Config::from_toml(&format!(
        r#"
        [[server]]
        host = "127.0.0.1"
        port = 8080
        server_names = ["cgi.test"]
        root = "{root}"

        [[server.location]]
        path = "/cgi-bin/"
        root = "{root}"
        cgi = {{ ".sh" = "/bin/sh" }}
        "#,
        root = root.display()
    ))
    .unwrap()
}

fn client() -> SocketAddr {
    "192.0.2.7:40123".parse().unwrap()
}

#[test]
fn test_post_round_trip_through_handler() {
    let dir = TempDir::new().unwrap();
    script(
        dir.path(),
        "echo.sh",
        "printf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf 'method=%s\\n' \"$REQUEST_METHOD\"\ncat\n",
    );
    let config = cgi_config(dir.path());
    let request = parse(
        b"POST /cgi-bin/echo.sh HTTP/1.1\r\nHost: cgi.test\r\nContent-Length: 15\r\n\r\nhello cgi world",
    );
    let matched = Dispatcher::new(&config.servers)
        .dispatch(&request, "127.0.0.1".parse().unwrap(), 8080)
        .unwrap();

    let mut session = match handler::handle(&request, &matched, client()) {
        Outcome::Cgi(session) => session,
        Outcome::Response(response) => panic!("expected cgi, got {}", response.status),
    };
    assert_eq!(session.state(), CgiState::WritingInput);
    drive(&mut session);

    assert_eq!(session.state(), CgiState::Complete);
    assert_eq!(session.bytes_written(), 15);
    let response = session.take_response().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.body, b"method=POST\nhello cgi world");
    assert!(session.take_response().is_none());
}

#[test]
fn test_get_skips_writing_input() {
    let dir = TempDir::new().unwrap();
    let mut session = CgiSession::new(shell(
        dir.path(),
        "get.sh",
        "printf 'Content-Type: text/plain\\n\\nok'\n",
    ));
    assert_eq!(session.state(), CgiState::NotStarted);
    session.start();

    assert_eq!(session.state(), CgiState::ReadingOutput);
    assert!(session.write_fd().is_none());
    assert!(session.read_fd().is_some());
    drive(&mut session);
    assert_eq!(session.take_response().unwrap().body, b"ok");
}

#[test]
fn test_environment_is_populated() {
    let dir = TempDir::new().unwrap();
    let mut text = String::from("printf 'Content-Type: text/plain\\r\\n\\r\\n'\n");
    for var in [
        "GATEWAY_INTERFACE",
        "REQUEST_METHOD",
        "SERVER_PROTOCOL",
        "SERVER_NAME",
        "SERVER_PORT",
        "SCRIPT_NAME",
        "PATH_INFO",
        "QUERY_STRING",
        "REQUEST_URI",
        "CONTENT_LENGTH",
        "HTTP_X_TRACE",
        "REMOTE_ADDR",
        "REMOTE_PORT",
        "REDIRECT_STATUS",
    ] {
        text.push_str(&format!("printf '%s=%s\\n' {0} \"${0}\"\n", var));
    }
    script(dir.path(), "env.sh", &text);
    let config = cgi_config(dir.path());
    let request = parse(
        b"GET /cgi-bin/env.sh/extra/info?a=1&b=2 HTTP/1.1\r\nHost: cgi.test\r\nX-Trace: abc\r\n\r\n",
    );
    let matched = Dispatcher::new(&config.servers)
        .dispatch(&request, "127.0.0.1".parse().unwrap(), 8080)
        .unwrap();
    let mut session = match handler::handle(&request, &matched, client()) {
        Outcome::Cgi(session) => session,
        Outcome::Response(response) => panic!("expected cgi, got {}", response.status),
    };
    drive(&mut session);

    let response = session.take_response().unwrap();
    let body = String::from_utf8(response.body).unwrap();
    for line in [
        "GATEWAY_INTERFACE=CGI/1.1",
        "REQUEST_METHOD=GET",
        "SERVER_PROTOCOL=HTTP/1.1",
        "SERVER_NAME=cgi.test",
        "SERVER_PORT=8080",
        "SCRIPT_NAME=/cgi-bin/env.sh",
        "PATH_INFO=/extra/info",
        "QUERY_STRING=a=1&b=2",
        "REQUEST_URI=/cgi-bin/env.sh/extra/info?a=1&b=2",
        "CONTENT_LENGTH=",
        "HTTP_X_TRACE=abc",
        "REMOTE_ADDR=192.0.2.7",
        "REMOTE_PORT=40123",
        "REDIRECT_STATUS=200",
    ] {
        assert!(
            body.lines().any(|l| l == line),
            "missing {} in:\n{}",
            line,
            body
        );
    }
}

#[test]
fn test_status_header_and_extra_headers() {
    let dir = TempDir::new().unwrap();
    let mut session = CgiSession::new(shell(
        dir.path(),
        "status.sh",
        "printf 'Status: 404 Not Found\\r\\nX-Script: yes\\r\\nContent-Type: text/html\\r\\n\\r\\n<p>none</p>'\n",
    ));
    session.start();
    drive(&mut session);

    let response = session.take_response().unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.header("X-Script"), Some("yes"));
    assert_eq!(response.header("Content-Length"), Some("11"));
}

#[test]
fn test_output_without_headers_is_body() {
    let dir = TempDir::new().unwrap();
    let mut session = CgiSession::new(shell(dir.path(), "raw.sh", "printf 'plain output'\n"));
    session.start();
    drive(&mut session);

    assert_eq!(session.state(), CgiState::Complete);
    assert_eq!(session.diagnostics().len(), 1);
    let response = session.take_response().unwrap();
    assert_eq!(response.header("Content-Type"), Some("application/octet-stream"));
    assert_eq!(response.body, b"plain output");
}

#[test]
fn test_failure_without_output_is_502() {
    let dir = TempDir::new().unwrap();
    let mut session = CgiSession::new(shell(dir.path(), "fail.sh", "exit 3\n"));
    session.start();
    drive(&mut session);

    assert_eq!(session.state(), CgiState::Failed);
    assert_eq!(session.exit_status().and_then(|s| s.code()), Some(3));
    assert_eq!(session.take_response().unwrap().status, 502);
}

#[test]
fn test_spawn_failure_is_502() {
    let mut session = CgiSession::new(CgiCommand::new("/nonexistent/interpreter", "/tmp/x.cgi"));
    session.start();

    assert_eq!(session.state(), CgiState::Failed);
    assert!(session.fds().is_empty());
    assert!(session.pid().is_none());
    assert_eq!(session.take_response().unwrap().status, 502);
}

#[test]
fn test_large_body_is_streamed() {
    let dir = TempDir::new().unwrap();
    let body: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let mut session = CgiSession::new(
        shell(
            dir.path(),
            "cat.sh",
            "printf 'Content-Type: application/octet-stream\\r\\n\\r\\n'\nexec cat\n",
        )
        .input(body.clone()),
    );
    session.start();
    drive(&mut session);

    assert_eq!(session.state(), CgiState::Complete);
    assert_eq!(session.bytes_written(), body.len());
    assert_eq!(session.take_response().unwrap().body, body);
}

#[test]
fn test_child_ignoring_stdin_still_completes() {
    let dir = TempDir::new().unwrap();
    let mut session = CgiSession::new(
        shell(
            dir.path(),
            "deaf.sh",
            "printf 'Content-Type: text/plain\\r\\n\\r\\nignored'\n",
        )
        .input(vec![b'x'; 1024 * 1024]),
    );
    session.start();
    drive(&mut session);

    assert_eq!(session.state(), CgiState::Complete);
    assert!(session.bytes_written() < 1024 * 1024);
    assert_eq!(session.take_response().unwrap().body, b"ignored");
}

#[test]
fn test_runaway_output_is_cut_off() {
    let dir = TempDir::new().unwrap();
    let mut session = CgiSession::new(shell(
        dir.path(),
        "flood.sh",
        "printf 'Content-Type: text/plain\\r\\n\\r\\n'\nexec yes\n",
    ));
    session.set_output_limit(64 * 1024);
    session.start();
    let pid = session.pid().unwrap();
    drive(&mut session);

    assert_eq!(session.state(), CgiState::Failed);
    let response = session.take_response().unwrap();
    assert_eq!(response.status, 502);
    assert!(response.body.len() < 1024);
    assert!(String::from_utf8_lossy(&response.body).contains("502 Bad Gateway"));

    settle(&mut session);
    drop(session);
    assert_gone(pid);
}

#[test]
fn test_timeout_kills_child() {
    let dir = TempDir::new().unwrap();
    let mut session = CgiSession::new(shell(
        dir.path(),
        "slow.sh",
        "printf 'Content-Type: text/plain\\r\\n\\r\\npartial'\nexec sleep 30\n",
    ));
    session.start();
    let pid = session.pid().unwrap();

    thread::sleep(Duration::from_millis(200));
    session.on_readable(&mut ());
    assert!(!session.is_expired(Duration::from_secs(60)));
    assert!(session.is_expired(Duration::from_millis(100)));

    session.timeout(&mut ());
    assert_eq!(session.state(), CgiState::TimedOut);
    assert!(session.fds().is_empty());
    let response = session.take_response().unwrap();
    assert_eq!(response.status, 504);
    assert_eq!(response.body, b"partial");

    settle(&mut session);
    drop(session);
    assert_gone(pid);
}

#[test]
fn test_descriptors_closed_and_child_reaped() {
    let dir = TempDir::new().unwrap();
    let mut session = CgiSession::new(
        shell(
            dir.path(),
            "ok.sh",
            "cat >/dev/null\nprintf 'Content-Type: text/plain\\r\\n\\r\\ndone'\n",
        )
        .input(b"some input".to_vec()),
    );
    session.start();
    let pid = session.pid().unwrap();
    drive(&mut session);

    assert_eq!(session.state(), CgiState::Complete);
    assert!(session.write_fd().is_none());
    assert!(session.read_fd().is_none());
    assert!(session.is_reaped());
    drop(session);
    assert_gone(pid);
}

#[test]
fn test_drop_reaps_running_child() {
    let dir = TempDir::new().unwrap();
    let mut session = CgiSession::new(shell(dir.path(), "hang.sh", "exec sleep 30\n"));
    session.start();
    let pid = session.pid().unwrap();
    assert!(!session.is_finished());

    drop(session);
    assert_gone(pid);
}
