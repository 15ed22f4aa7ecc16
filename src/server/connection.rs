use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::cgi::CgiSession;
use crate::http::{HttpResponse, RequestParser};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ReceivingRequest,
    /// Waiting on a CGI session; the socket is only watched for the peer
    /// going away.
    AwaitingHandlerResult,
    SendingResponse,
    Closing,
}

/// What one read pass saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStatus {
    pub bytes: usize,
    pub eof: bool,
}

/// One accepted client and everything it owns.
pub struct Connection {
    stream: TcpStream,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub parser: RequestParser,
    pub state: ConnectionState,
    pub cgi: Option<CgiSession>,
    outbound: Vec<u8>,
    written: usize,
    received: u64,
    last_activity: Instant,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, local: SocketAddr) -> Self {
        Connection {
            stream,
            peer,
            local,
            parser: RequestParser::new(),
            state: ConnectionState::ReceivingRequest,
            cgi: None,
            outbound: Vec::new(),
            written: 0,
            received: 0,
            last_activity: Instant::now(),
        }
    }

    /// Reads everything the socket has and feeds it to the parser, stopping
    /// early once the parser is done or more than `limit` bytes have arrived.
    pub fn receive(&mut self, limit: u64) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut status = ReadStatus {
            bytes: 0,
            eof: false,
        };
        while !self.parser.state().is_terminal() && self.received <= limit {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    status.eof = true;
                    break;
                }
                Ok(n) => {
                    status.bytes += n;
                    self.received += n as u64;
                    self.parser.feed(&chunk[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        if status.bytes > 0 {
            self.touch();
        }
        Ok(status)
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Serializes `response` as the connection's only reply.
    pub fn queue_response(&mut self, response: &HttpResponse) {
        self.outbound = response.to_bytes();
        self.written = 0;
        self.state = ConnectionState::SendingResponse;
        self.touch();
    }

    /// Writes queued bytes until the socket would block. `true` once all of
    /// them are out.
    pub fn flush(&mut self) -> io::Result<bool> {
        while self.written < self.outbound.len() {
            match self.stream.write(&self.outbound[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.written += n;
                    self.touch();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        self.state = ConnectionState::Closing;
        Ok(true)
    }

    pub fn pending(&self) -> usize {
        self.outbound.len() - self.written
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, limit: Duration) -> bool {
        self.last_activity.elapsed() >= limit
    }
}
