//! CGI process manager.
//!
//! A [`CgiSession`] runs one interpreter process for one request and is
//! driven entirely by readiness events from the event loop:
//!
//! ```text
//! NotStarted --spawn--> WritingInput --body sent--> ReadingOutput
//!          \--(no body)------------------------->/        |
//!                                                   EOF on stdout
//!                                                         v
//!                                  Complete <--exit-- ProcessingOutput
//!
//! any live state --timeout--> TimedOut      any failure --> Failed
//! ```
//!
//! Every pipe is owned by the session and closed by dropping it; before a
//! pipe is dropped the session tells its [`PipeWatcher`] so the descriptor is
//! no longer polled.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::dispatch::MatchedConfig;
use crate::http::mime::OCTET_STREAM;
use crate::http::response::{default_error_page, SERVER_NAME};
use crate::http::{HttpRequest, HttpResponse};

const READ_CHUNK: usize = 4096;

/// Output collected from one script unless the owner sets another limit.
pub const DEFAULT_OUTPUT_LIMIT: usize = 16 * 1024 * 1024;

/// Connection-level headers a script cannot set for the client connection.
const HOP_BY_HOP: [&str; 3] = ["Connection", "Keep-Alive", "Transfer-Encoding"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiState {
    NotStarted,
    WritingInput,
    ReadingOutput,
    ProcessingOutput,
    Complete,
    TimedOut,
    Failed,
}

impl CgiState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CgiState::Complete | CgiState::TimedOut | CgiState::Failed
        )
    }
}

/// Receives pipe descriptors the session is about to close.
pub trait PipeWatcher {
    fn unwatch(&mut self, fd: RawFd);
}

/// For sessions driven without a poller.
impl PipeWatcher for () {
    fn unwatch(&mut self, _fd: RawFd) {}
}

/// Everything needed to launch the interpreter.
#[derive(Debug, Clone)]
pub struct CgiCommand {
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub env: Vec<(String, String)>,
    pub input: Vec<u8>,
}

impl CgiCommand {
    pub fn new(interpreter: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        CgiCommand {
            interpreter: interpreter.into(),
            script: script.into(),
            env: Vec::new(),
            input: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = input.into();
        self
    }

    /// Builds the command for `request`, with the standard CGI meta-variables.
    ///
    /// `script_name` is the URI path of the script and `path_info` whatever
    /// follows it in the request path.
    pub fn for_request(
        request: &HttpRequest,
        matched: &MatchedConfig<'_>,
        interpreter: &Path,
        script: &Path,
        script_name: &str,
        path_info: &str,
        client: SocketAddr,
    ) -> Self {
        let document_root = matched
            .root()
            .canonicalize()
            .unwrap_or_else(|_| matched.root().to_path_buf());

        let mut command = CgiCommand::new(interpreter, script)
            .env("GATEWAY_INTERFACE", "CGI/1.1")
            .env("SERVER_SOFTWARE", SERVER_NAME)
            .env("REQUEST_METHOD", request.method.as_str())
            .env("SERVER_PROTOCOL", request.version.as_str())
            .env("SERVER_NAME", matched.server_name())
            .env("SERVER_PORT", matched.server.port.to_string())
            .env("SCRIPT_FILENAME", script.to_string_lossy())
            .env("SCRIPT_NAME", script_name)
            .env("PATH_INFO", path_info)
            .env("REQUEST_URI", request.uri.as_str())
            .env("QUERY_STRING", request.query_string())
            .env("DOCUMENT_ROOT", document_root.to_string_lossy())
            .env("REDIRECT_STATUS", "200")
            .env("REMOTE_ADDR", client.ip().to_string())
            .env("REMOTE_PORT", client.port().to_string());

        if request.method == "POST" {
            command = command
                .env("CONTENT_TYPE", request.header("content-type").unwrap_or(""))
                .env("CONTENT_LENGTH", request.content_length.to_string());
        } else {
            command = command.env("CONTENT_TYPE", "").env("CONTENT_LENGTH", "");
        }

        for (name, value) in &request.headers {
            if name == "content-type" || name == "content-length" {
                continue;
            }
            let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
            command = command.env(key, value.as_str());
        }

        command.input(request.body.clone())
    }
}

#[derive(Debug)]
pub struct CgiSession {
    command: CgiCommand,
    state: CgiState,
    child: Option<Child>,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    written: usize,
    output: Vec<u8>,
    output_limit: usize,
    response: Option<HttpResponse>,
    exit_status: Option<ExitStatus>,
    reaped: bool,
    started_at: Option<Instant>,
    diagnostics: Vec<String>,
}

impl CgiSession {
    pub fn new(command: CgiCommand) -> Self {
        CgiSession {
            command,
            state: CgiState::NotStarted,
            child: None,
            pid: None,
            stdin: None,
            stdout: None,
            written: 0,
            output: Vec::new(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            response: None,
            exit_status: None,
            reaped: false,
            started_at: None,
            diagnostics: Vec::new(),
        }
    }

    /// Caps how much output is collected; a script writing more fails with 502.
    pub fn set_output_limit(&mut self, limit: usize) {
        self.output_limit = limit;
    }

    /// Spawns the interpreter as `interpreter script` with the prepared
    /// environment. Failure leaves the session `Failed` with a 502 response.
    pub fn start(&mut self) {
        if self.state != CgiState::NotStarted {
            return;
        }
        self.started_at = Some(Instant::now());

        let mut command = Command::new(&self.command.interpreter);
        command
            .arg(&self.command.script)
            .env_clear()
            .envs(self.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = self.command.script.parent().filter(|dir| dir.is_dir()) {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(
                    "cannot spawn {} {}: {}",
                    self.command.interpreter.display(),
                    self.command.script.display(),
                    err
                );
                self.fail(&mut (), 502, "spawn failed");
                return;
            }
        };
        self.pid = Some(child.id());
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        self.child = Some(child);

        let nonblocking = [self.write_fd(), self.read_fd()]
            .iter()
            .flatten()
            .try_for_each(|&fd| set_nonblocking(fd));
        if let Err(err) = nonblocking {
            error!("cannot make cgi pipes non-blocking: {}", err);
            self.fail(&mut (), 502, "pipe setup failed");
            return;
        }

        info!(
            "cgi {} started for {} (pid {})",
            self.command.interpreter.display(),
            self.command.script.display(),
            child_id(self.pid)
        );
        if self.command.input.is_empty() {
            // Never registered, so nobody needs to be told.
            self.stdin = None;
            self.state = CgiState::ReadingOutput;
        } else {
            self.state = CgiState::WritingInput;
        }
    }

    /// Writes as much of the request body as the pipe accepts, closing the
    /// child's stdin once everything is through.
    pub fn on_writable(&mut self, watcher: &mut dyn PipeWatcher) {
        if self.state != CgiState::WritingInput {
            return;
        }
        loop {
            if self.written >= self.command.input.len() {
                debug!("cgi {}: request body fully written", child_id(self.pid));
                self.close_stdin(watcher);
                self.state = CgiState::ReadingOutput;
                return;
            }
            let stdin = match self.stdin.as_mut() {
                Some(stdin) => stdin,
                None => {
                    self.state = CgiState::ReadingOutput;
                    return;
                }
            };
            match stdin.write(&self.command.input[self.written..]) {
                Ok(0) => return,
                Ok(n) => self.written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    warn!(
                        "cgi {} stopped reading after {} of {} body bytes",
                        child_id(self.pid),
                        self.written,
                        self.command.input.len()
                    );
                    self.close_stdin(watcher);
                    self.state = CgiState::ReadingOutput;
                    return;
                }
                Err(err) => {
                    error!("write to cgi {} failed: {}", child_id(self.pid), err);
                    self.fail(watcher, 502, "write to interpreter failed");
                    return;
                }
            }
        }
    }

    /// Reads whatever output is available. End of output closes the pipe and
    /// parses what was collected.
    pub fn on_readable(&mut self, watcher: &mut dyn PipeWatcher) {
        if !matches!(self.state, CgiState::WritingInput | CgiState::ReadingOutput) {
            return;
        }
        self.drain_output(watcher);
    }

    fn drain_output(&mut self, watcher: &mut dyn PipeWatcher) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let stdout = match self.stdout.as_mut() {
                Some(stdout) => stdout,
                None => return,
            };
            match stdout.read(&mut chunk) {
                Ok(0) => {
                    self.end_of_output(watcher);
                    return;
                }
                Ok(n) if self.output.len() + n > self.output_limit => {
                    error!(
                        "cgi {} wrote more than {} bytes",
                        child_id(self.pid),
                        self.output_limit
                    );
                    // Not a response worth forwarding.
                    self.output.clear();
                    self.fail(watcher, 502, "output limit exceeded");
                    return;
                }
                Ok(n) => self.output.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("read from cgi {} failed: {}", child_id(self.pid), err);
                    self.fail(watcher, 502, "read from interpreter failed");
                    return;
                }
            }
        }
    }

    fn end_of_output(&mut self, watcher: &mut dyn PipeWatcher) {
        debug!(
            "cgi {}: end of output after {} bytes",
            child_id(self.pid),
            self.output.len()
        );
        self.close_stdout(watcher);
        // Output is over; the child will not read the rest of the body.
        self.close_stdin(watcher);
        if !self.output.is_empty() {
            self.parse_output();
        }
        self.state = CgiState::ProcessingOutput;
    }

    fn parse_output(&mut self) {
        let parsed = parse_cgi_output(&self.output);
        for diagnostic in &parsed.diagnostics {
            warn!("cgi {}: {}", child_id(self.pid), diagnostic);
        }
        self.diagnostics.extend(parsed.diagnostics);
        self.response = Some(parsed.response);
    }

    /// Non-blocking check for child exit. Must be called on every tick while
    /// the child may still be running.
    pub fn poll_exit(&mut self, watcher: &mut dyn PipeWatcher) {
        if self.reaped {
            return;
        }
        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return,
        };
        let status = match child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(err) => {
                error!("waiting for cgi {} failed: {}", child_id(self.pid), err);
                self.reaped = true;
                if !self.state.is_terminal() {
                    self.fail(watcher, 502, "lost track of interpreter");
                }
                return;
            }
        };
        self.reaped = true;
        self.exit_status = Some(status);
        if self.state.is_terminal() {
            return;
        }

        // Whatever the child wrote before exiting is still in the pipe.
        self.drain_output(watcher);
        if self.state.is_terminal() {
            return;
        }
        self.close_stdin(watcher);
        self.close_stdout(watcher);

        let abnormal = status.signal().is_some() || !status.success();
        if self.output.is_empty() {
            let reason = match status.signal() {
                Some(signal) => format!("interpreter killed by signal {}", signal),
                None if abnormal => format!("interpreter exited with {}", status),
                None => "interpreter exited without output".to_string(),
            };
            error!("cgi {}: {}", child_id(self.pid), reason);
            self.fail(watcher, 502, &reason);
            return;
        }
        if abnormal {
            warn!(
                "cgi {} exited with {} after producing output",
                child_id(self.pid),
                status
            );
        } else {
            info!("cgi {} exited with {}", child_id(self.pid), status);
        }
        if self.response.is_none() {
            self.parse_output();
        }
        self.state = CgiState::Complete;
    }

    /// Gives up on the child: kills it and answers 504.
    pub fn timeout(&mut self, watcher: &mut dyn PipeWatcher) {
        if self.state.is_terminal() {
            return;
        }
        warn!("cgi {} timed out", child_id(self.pid));
        self.close_stdin(watcher);
        self.close_stdout(watcher);
        self.kill();
        self.response = Some(self.error_response(504));
        self.state = CgiState::TimedOut;
    }

    /// Ends a live session with a 502, e.g. when its pipes cannot be polled.
    pub fn abort(&mut self, watcher: &mut dyn PipeWatcher, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        error!("aborting cgi {}: {}", child_id(self.pid), reason);
        self.fail(watcher, 502, reason);
    }

    pub fn is_expired(&self, limit: Duration) -> bool {
        !self.state.is_terminal()
            && self
                .started_at
                .map_or(false, |started| started.elapsed() >= limit)
    }

    fn fail(&mut self, watcher: &mut dyn PipeWatcher, status: u16, reason: &str) {
        self.diagnostics.push(reason.to_string());
        self.close_stdin(watcher);
        self.close_stdout(watcher);
        self.kill();
        self.response = Some(self.error_response(status));
        self.state = CgiState::Failed;
    }

    /// An upstream error, keeping any partial output on a best-effort basis.
    fn error_response(&self, status: u16) -> HttpResponse {
        if self.output.is_empty() {
            return HttpResponse::with_body(status, "text/html", default_error_page(status));
        }
        let mut response = parse_cgi_output(&self.output).response;
        response.status = status;
        response
    }

    fn kill(&mut self) {
        if self.reaped {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.kill() {
                debug!("kill cgi {}: {}", child_id(self.pid), err);
            }
        }
    }

    fn close_stdin(&mut self, watcher: &mut dyn PipeWatcher) {
        if let Some(stdin) = self.stdin.take() {
            watcher.unwatch(stdin.as_raw_fd());
        }
    }

    fn close_stdout(&mut self, watcher: &mut dyn PipeWatcher) {
        if let Some(stdout) = self.stdout.take() {
            watcher.unwatch(stdout.as_raw_fd());
        }
    }

    pub fn state(&self) -> CgiState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Descriptor of the child's stdin while the body is being written.
    pub fn write_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Descriptor of the child's stdout while output is expected.
    pub fn read_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.write_fd().into_iter().chain(self.read_fd()).collect()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// True while a spawned child has not been waited for.
    pub fn needs_reaping(&self) -> bool {
        self.child.is_some() && !self.reaped
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn bytes_written(&self) -> usize {
        self.written
    }

    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    /// The response for a finished session. Only the first call returns it.
    pub fn take_response(&mut self) -> Option<HttpResponse> {
        if !self.state.is_terminal() {
            return None;
        }
        self.response.take()
    }
}

impl Drop for CgiSession {
    fn drop(&mut self) {
        self.stdin = None;
        self.stdout = None;
        if let Some(child) = self.child.as_mut() {
            if !self.reaped {
                // Killed first, so the wait cannot hang.
                let _ = child.kill();
                match child.wait() {
                    Ok(status) => debug!("cgi {} reaped on drop: {}", child_id(self.pid), status),
                    Err(err) => warn!("reaping cgi {} failed: {}", child_id(self.pid), err),
                }
                self.reaped = true;
            }
        }
    }
}

/// A parsed CGI reply plus any complaints about its shape.
#[derive(Debug, Clone)]
pub struct CgiOutput {
    pub response: HttpResponse,
    pub diagnostics: Vec<String>,
}

/// Turns raw interpreter output into a response.
///
/// The header block ends at the first blank line (`\r\n\r\n` or `\n\n`).
/// `Status` sets the response status, `Content-Type` maps directly and every
/// other header is passed on as written. Output without a blank line is all
/// body.
pub fn parse_cgi_output(raw: &[u8]) -> CgiOutput {
    let mut diagnostics = Vec::new();
    let mut response = HttpResponse::new(200);

    let split = [&b"\r\n\r\n"[..], &b"\n\n"[..]]
        .iter()
        .filter_map(|separator| find(raw, separator).map(|pos| (pos, separator.len())))
        .min_by_key(|(pos, _)| *pos);

    let (head, body) = match split {
        Some((pos, len)) => (&raw[..pos], &raw[pos + len..]),
        None => {
            diagnostics.push("no header block in output, sending it all as the body".to_string());
            response.set_header("Content-Type", OCTET_STREAM);
            response.set_body(raw.to_vec());
            return CgiOutput {
                response,
                diagnostics,
            };
        }
    };

    let head = String::from_utf8_lossy(head);
    for line in head.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => {
                diagnostics.push(format!("ignoring header line without ':': {}", line));
                continue;
            }
        };
        if name.eq_ignore_ascii_case("Status") {
            match parse_status(value) {
                Some(status) => response.status = status,
                None => diagnostics.push(format!("unparseable Status '{}', using 200", value)),
            }
        } else if name.eq_ignore_ascii_case("Content-Type") {
            response.set_header("Content-Type", value);
        } else if name.eq_ignore_ascii_case("Content-Length") {
            // Recomputed from the body below.
        } else if HOP_BY_HOP.iter().any(|hop| name.eq_ignore_ascii_case(hop)) {
            diagnostics.push(format!("dropping {} header", name));
        } else {
            response.append_header(name, value);
        }
    }

    response.set_body(body.to_vec());
    if !response.has_header("Content-Type") {
        diagnostics.push(format!("no Content-Type, using {}", OCTET_STREAM));
        response.set_header("Content-Type", OCTET_STREAM);
    }
    CgiOutput {
        response,
        diagnostics,
    }
}

fn parse_status(value: &str) -> Option<u16> {
    value
        .split_whitespace()
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn child_id(pid: Option<u32>) -> String {
    pid.map_or_else(|| "-".to_string(), |pid| pid.to_string())
}
