//! The single-threaded event loop.
//!
//! [`Server`] owns every descriptor the process polls: listeners, client
//! sockets and the pipes of running CGI sessions. Pipes are looked up through
//! `pipes`, which maps each pipe descriptor to the client that owns the
//! session. A pipe leaves `pipes` and the poller before the session closes it.

use std::collections::{BTreeSet, HashMap};
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cgi::{CgiSession, PipeWatcher};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use crate::handler::{self, Outcome};
use crate::http::{HttpResponse, ParseError};

pub mod connection;
pub mod poller;

use connection::{Connection, ConnectionState};
use poller::{Event, Interest, Poller};

pub struct Server {
    config: Arc<Config>,
    poller: Poller,
    listeners: HashMap<RawFd, TcpListener>,
    connections: HashMap<RawFd, Connection>,
    pipes: HashMap<RawFd, RawFd>,
}

/// Unregisters pipes on behalf of a session.
struct PipeRegistry<'a> {
    poller: &'a Poller,
    pipes: &'a mut HashMap<RawFd, RawFd>,
}

impl PipeWatcher for PipeRegistry<'_> {
    fn unwatch(&mut self, fd: RawFd) {
        self.pipes.remove(&fd);
        if let Err(err) = self.poller.delete(fd) {
            debug!("removing pipe {} from poller: {}", fd, err);
        }
    }
}

/// The addresses to listen on. A wildcard host on a port covers every
/// specific host declared on that port.
pub fn listen_addrs(config: &Config) -> Vec<SocketAddr> {
    let mut addrs = BTreeSet::new();
    for server in &config.servers {
        let wildcard = config
            .servers
            .iter()
            .find(|other| other.port == server.port && other.host.is_unspecified());
        let host = wildcard.map_or(server.host, |other| other.host);
        addrs.insert(SocketAddr::new(host, server.port));
    }
    addrs.into_iter().collect()
}

impl Server {
    /// Binds every listener the configuration asks for.
    pub fn bind(config: Config) -> Result<Server, ServerError> {
        let poller = Poller::new(config.runtime.max_events)?;
        let mut listeners = HashMap::new();
        for addr in listen_addrs(&config) {
            let listener =
                TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
            listener.set_nonblocking(true)?;
            poller.add(listener.as_raw_fd(), Interest::READABLE)?;
            info!("listening on http://{}", addr);
            listeners.insert(listener.as_raw_fd(), listener);
        }
        Ok(Server {
            config: Arc::new(config),
            poller,
            listeners,
            connections: HashMap::new(),
            pipes: HashMap::new(),
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// Runs until `shutdown` is set, then closes everything.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), ServerError> {
        info!("event loop started");
        while !shutdown.load(Ordering::Relaxed) {
            let events = self.poller.wait(self.config.runtime.poll_timeout_ms)?;
            for event in events {
                if self.listeners.contains_key(&event.fd) {
                    self.accept(event.fd);
                } else if let Some(&client) = self.pipes.get(&event.fd) {
                    self.on_pipe_event(client, event);
                } else if self.connections.contains_key(&event.fd) {
                    self.on_client_event(event);
                } else {
                    debug!("event for unknown fd {}", event.fd);
                }
            }
            self.reap_children();
            self.check_timeouts();
        }
        info!("shutting down, closing {} connections", self.connections.len());
        self.close_all();
        Ok(())
    }

    fn accept(&mut self, listener_fd: RawFd) {
        let listener = match self.listeners.get(&listener_fd) {
            Some(listener) => listener,
            None => return,
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let local = match stream.local_addr() {
                        Ok(local) => local,
                        Err(err) => {
                            warn!("local address of {}: {}", peer, err);
                            continue;
                        }
                    };
                    if let Err(err) = stream.set_nonblocking(true) {
                        warn!("cannot make {} non-blocking: {}", peer, err);
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    if let Err(err) = self.poller.add(fd, Interest::READABLE) {
                        error!("cannot poll {}: {}", peer, err);
                        continue;
                    }
                    debug!("accepted {} on {} (fd {})", peer, local, fd);
                    self.connections
                        .insert(fd, Connection::new(stream, peer, local));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn on_client_event(&mut self, event: Event) {
        let fd = event.fd;
        let state = match self.connections.get(&fd) {
            Some(connection) => connection.state,
            None => return,
        };
        if event.is_error() {
            debug!("socket error on fd {}", fd);
            self.close(fd);
            return;
        }
        match state {
            ConnectionState::ReceivingRequest => {
                if event.is_readable() || event.is_hangup() {
                    self.receive(fd);
                }
            }
            ConnectionState::AwaitingHandlerResult => {
                if event.is_hangup() || event.is_peer_closed() {
                    info!("client on fd {} went away during cgi", fd);
                    self.close(fd);
                }
            }
            ConnectionState::SendingResponse => {
                if event.is_writable() {
                    self.send(fd);
                } else if event.is_hangup() {
                    self.close(fd);
                }
            }
            ConnectionState::Closing => self.close(fd),
        }
    }

    fn receive(&mut self, fd: RawFd) {
        let limit = self.config.runtime.max_request_bytes;
        let connection = match self.connections.get_mut(&fd) {
            Some(connection) => connection,
            None => return,
        };
        let status = match connection.receive(limit) {
            Ok(status) => status,
            Err(err) => {
                warn!("read from {}: {}", connection.peer, err);
                self.close(fd);
                return;
            }
        };

        if connection.received() > limit {
            warn!(
                "{} sent more than {} bytes, giving up on the request",
                connection.peer, limit
            );
            self.respond(fd, handler::error_response(413, None));
        } else if let Some(err) = connection.parser.error() {
            warn!("bad request from {}: {}", connection.peer, err);
            let code = match err {
                ParseError::HeadTooLarge(_) => 431,
                _ => 400,
            };
            self.respond(fd, handler::error_response(code, None));
        } else if connection.parser.is_complete() {
            self.process(fd);
        } else if status.eof {
            debug!("{} closed the connection", connection.peer);
            self.close(fd);
        }
    }

    /// Dispatches a complete request and starts answering it.
    fn process(&mut self, fd: RawFd) {
        let config = Arc::clone(&self.config);
        let connection = match self.connections.get_mut(&fd) {
            Some(connection) => connection,
            None => return,
        };
        let request = connection.parser.request();
        let matched = Dispatcher::new(&config.servers).dispatch(
            request,
            connection.local.ip(),
            connection.local.port(),
        );
        let outcome = match matched {
            Some(matched) => handler::handle(request, &matched, connection.peer),
            None => {
                error!("no server configured for {}", connection.local);
                Outcome::Response(handler::error_response(500, None))
            }
        };

        match outcome {
            Outcome::Response(response) => {
                info!(
                    "{} \"{} {}\" {}",
                    connection.peer, request.method, request.uri, response.status
                );
                self.respond(fd, response);
            }
            Outcome::Cgi(session) => {
                info!(
                    "{} \"{} {}\" handed to cgi",
                    connection.peer, request.method, request.uri
                );
                self.attach_cgi(fd, session);
            }
        }
    }

    fn attach_cgi(&mut self, client: RawFd, mut session: CgiSession) {
        session.set_output_limit(
            usize::try_from(self.config.runtime.max_cgi_output).unwrap_or(usize::MAX),
        );
        let Server {
            poller,
            pipes,
            connections,
            ..
        } = self;
        let connection = match connections.get_mut(&client) {
            Some(connection) => connection,
            None => return,
        };

        let mut registered = Ok(());
        let wanted = [
            (session.write_fd(), Interest::WRITABLE),
            (session.read_fd(), Interest::READABLE),
        ];
        for (pipe, interest) in wanted.iter() {
            if let Some(pipe) = *pipe {
                registered = poller.add(pipe, *interest);
                if registered.is_err() {
                    break;
                }
                pipes.insert(pipe, client);
            }
        }
        if let Err(err) = registered {
            let mut registry = PipeRegistry {
                poller: &*poller,
                pipes: &mut *pipes,
            };
            session.abort(&mut registry, &format!("cannot poll cgi pipes: {}", err));
        }

        connection.state = ConnectionState::AwaitingHandlerResult;
        connection.cgi = Some(session);
        if let Err(err) = poller.modify(client, Interest::PEER_CLOSED) {
            warn!("cannot park client fd {}: {}", client, err);
        }
        self.finish_cgi(client);
    }

    fn on_pipe_event(&mut self, client: RawFd, event: Event) {
        let Server {
            poller,
            pipes,
            connections,
            ..
        } = self;
        let session = match connections
            .get_mut(&client)
            .and_then(|connection| connection.cgi.as_mut())
        {
            Some(session) => session,
            None => {
                pipes.remove(&event.fd);
                let _ = poller.delete(event.fd);
                return;
            }
        };

        let mut registry = PipeRegistry {
            poller: &*poller,
            pipes: &mut *pipes,
        };
        if session.write_fd() == Some(event.fd) {
            session.on_writable(&mut registry);
        } else if session.read_fd() == Some(event.fd) {
            session.on_readable(&mut registry);
        }
        self.finish_cgi(client);
    }

    /// Queues the response of a finished session for its client.
    fn finish_cgi(&mut self, client: RawFd) {
        let response = match self.connections.get_mut(&client) {
            Some(connection) if connection.state == ConnectionState::AwaitingHandlerResult => {
                match connection.cgi.as_mut() {
                    Some(session) if session.is_finished() => {
                        let response = session
                            .take_response()
                            .unwrap_or_else(|| handler::error_response(502, None));
                        info!(
                            "{} cgi finished ({:?}) with {}",
                            connection.peer,
                            session.state(),
                            response.status
                        );
                        response
                    }
                    _ => return,
                }
            }
            _ => return,
        };
        self.respond(client, response);
    }

    fn respond(&mut self, fd: RawFd, response: HttpResponse) {
        let connection = match self.connections.get_mut(&fd) {
            Some(connection) => connection,
            None => return,
        };
        connection.queue_response(&response);
        if let Err(err) = self.poller.modify(fd, Interest::WRITABLE) {
            warn!("cannot poll fd {} for writing: {}", fd, err);
            self.close(fd);
        }
    }

    fn send(&mut self, fd: RawFd) {
        let connection = match self.connections.get_mut(&fd) {
            Some(connection) => connection,
            None => return,
        };
        match connection.flush() {
            Ok(true) => {
                debug!("response to {} sent", connection.peer);
                self.close(fd);
            }
            Ok(false) => {}
            Err(err) => {
                warn!("write to {}: {}", connection.peer, err);
                self.close(fd);
            }
        }
    }

    /// Non-blocking reap of every child still running or unwaited.
    fn reap_children(&mut self) {
        let Server {
            poller,
            pipes,
            connections,
            ..
        } = self;
        let mut finished = Vec::new();
        for (&client, connection) in connections.iter_mut() {
            if let Some(session) = connection.cgi.as_mut() {
                if session.needs_reaping() {
                    let mut registry = PipeRegistry {
                        poller: &*poller,
                        pipes: &mut *pipes,
                    };
                    session.poll_exit(&mut registry);
                }
                if session.is_finished()
                    && connection.state == ConnectionState::AwaitingHandlerResult
                {
                    finished.push(client);
                }
            }
        }
        for client in finished {
            self.finish_cgi(client);
        }
    }

    fn check_timeouts(&mut self) {
        let cgi_limit = self.config.runtime.cgi_timeout;
        let client_limit = self.config.runtime.client_timeout;
        let Server {
            poller,
            pipes,
            connections,
            ..
        } = self;

        let mut timed_out = Vec::new();
        let mut idle = Vec::new();
        for (&fd, connection) in connections.iter_mut() {
            if let Some(session) = connection.cgi.as_mut() {
                if session.is_expired(cgi_limit) {
                    let mut registry = PipeRegistry {
                        poller: &*poller,
                        pipes: &mut *pipes,
                    };
                    session.timeout(&mut registry);
                    timed_out.push(fd);
                    continue;
                }
            }
            if connection.state != ConnectionState::AwaitingHandlerResult
                && connection.is_idle(client_limit)
            {
                idle.push(fd);
            }
        }

        for fd in timed_out {
            self.finish_cgi(fd);
        }
        for fd in idle {
            let waiting = match self.connections.get(&fd) {
                Some(connection) => {
                    connection.state == ConnectionState::ReceivingRequest
                        && connection.received() > 0
                }
                None => continue,
            };
            if waiting {
                info!("request on fd {} timed out", fd);
                self.respond(fd, handler::error_response(408, None));
            } else {
                debug!("closing idle fd {}", fd);
                self.close(fd);
            }
        }
    }

    /// Drops a connection after unregistering its socket and any CGI pipes.
    fn close(&mut self, fd: RawFd) {
        let connection = match self.connections.remove(&fd) {
            Some(connection) => connection,
            None => return,
        };
        if let Some(session) = connection.cgi.as_ref() {
            for pipe in session.fds() {
                self.pipes.remove(&pipe);
                if let Err(err) = self.poller.delete(pipe) {
                    debug!("removing pipe {} from poller: {}", pipe, err);
                }
            }
        }
        if let Err(err) = self.poller.delete(fd) {
            debug!("removing fd {} from poller: {}", fd, err);
        }
        debug!(
            "closed connection from {} ({} bytes unsent)",
            connection.peer,
            connection.pending()
        );
    }

    fn close_all(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            self.close(fd);
        }
    }
}
