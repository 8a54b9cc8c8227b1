/*
 * Copyright (C) 2025-2026 the tidepool authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::connection::{Connection, ConnectionHost, Transport, WebSocketHandler};
use crate::request::Request;
use crate::response::{HandlerError, Response};
use log::{debug, error, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::Socket;
use std::cell::RefCell;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);
const CONN_TOKEN_BASE: usize = 1;
const EVENTS_MAX: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

impl Transport for TcpStream {
    fn shutdown(&mut self) -> Result<(), io::Error> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

fn set_socket_opts(stream: &mut TcpStream) {
    // safety: we move the value out of stream and replace it at the end
    let ret = unsafe {
        let s = ptr::read(stream);
        let socket = Socket::from_raw_fd(s.into_raw_fd());
        let ret = socket.set_linger(Some(LINGER_TIMEOUT));
        ptr::write(stream, TcpStream::from_raw_fd(socket.into_raw_fd()));

        ret
    };

    if let Err(e) = ret {
        error!("set linger failed: {:?}", e);
    }
}

/// Application request handler. Handlers are tried in registration order;
/// the first to return a response wins.
pub trait PageHandler {
    fn handle(&mut self, request: &Request) -> Result<Option<Response>, HandlerError>;
}

struct WsEndpoint {
    uri: String,
    handler: Rc<RefCell<dyn WebSocketHandler>>,
    allow_cross_origin: bool,
}

/// The connection-facing half of the server: dispatch registries, the
/// thread-affinity assertion, and the intent log for write-event
/// subscription changes. Intents are recorded here and applied to the
/// poller once the connection returns control.
struct Dispatcher {
    owner: ThreadId,
    static_path: String,
    page_handlers: Vec<Box<dyn PageHandler>>,
    ws_endpoints: Vec<WsEndpoint>,
    write_subs: Vec<(usize, bool)>,
    started: Instant,
    active_connections: usize,
    total_connections: u64,
}

impl ConnectionHost for Dispatcher {
    fn subscribe_to_write_events(&mut self, connection_id: usize) -> bool {
        self.write_subs.push((connection_id, true));
        true
    }

    fn unsubscribe_from_write_events(&mut self, connection_id: usize) -> bool {
        self.write_subs.push((connection_id, false));
        true
    }

    fn check_thread(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "connection used off its owning thread"
        );
    }

    fn handle(&mut self, request: &Request) -> Result<Option<Response>, HandlerError> {
        for handler in self.page_handlers.iter_mut() {
            if let Some(response) = handler.handle(request)? {
                return Ok(Some(response));
            }
        }

        Ok(None)
    }

    fn web_socket_handler(&self, uri: &str) -> Option<Rc<RefCell<dyn WebSocketHandler>>> {
        let uri = match uri.find('?') {
            Some(pos) => &uri[..pos],
            None => uri,
        };

        self.ws_endpoints
            .iter()
            .find(|e| e.uri == uri)
            .map(|e| Rc::clone(&e.handler))
    }

    fn is_cross_origin_allowed(&self, uri: &str) -> bool {
        self.ws_endpoints
            .iter()
            .find(|e| e.uri == uri)
            .map_or(false, |e| e.allow_cross_origin)
    }

    fn stats_document(&self) -> String {
        format!(
            "var serverStats = {{\"activeConnections\": {}, \"totalConnections\": {}, \
             \"uptimeSeconds\": {}}};",
            self.active_connections,
            self.total_connections,
            self.started.elapsed().as_secs()
        )
    }

    fn static_path(&self) -> String {
        self.static_path.clone()
    }
}

/// Single-threaded poll loop owning the listener and every accepted
/// connection. All handlers run on the loop thread; the server must be
/// created and run on the same thread.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    conns: Slab<Connection<TcpStream>>,
    dispatcher: Dispatcher,
    local_addr: SocketAddr,
}

impl Server {
    pub fn new(static_path: &str, bind_addr: SocketAddr) -> Result<Server, io::Error> {
        assert!(!static_path.is_empty());

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(bind_addr)?;
        let local_addr = listener.local_addr()?;

        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Server {
            poll,
            listener,
            conns: Slab::new(),
            dispatcher: Dispatcher {
                owner: thread::current().id(),
                static_path: static_path.to_owned(),
                page_handlers: Vec::new(),
                ws_endpoints: Vec::new(),
                write_subs: Vec::new(),
                started: Instant::now(),
                active_connections: 0,
                total_connections: 0,
            },
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn add_page_handler(&mut self, handler: Box<dyn PageHandler>) {
        self.dispatcher.page_handlers.push(handler);
    }

    pub fn add_web_socket_handler(
        &mut self,
        uri: &str,
        handler: Rc<RefCell<dyn WebSocketHandler>>,
        allow_cross_origin: bool,
    ) {
        self.dispatcher.ws_endpoints.push(WsEndpoint {
            uri: uri.to_owned(),
            handler,
            allow_cross_origin,
        });
    }

    /// Runs the event loop until `stop` becomes true. The flag is checked
    /// between poll rounds, so shutdown latency is bounded by the poll
    /// timeout.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), io::Error> {
        let mut events = Events::with_capacity(EVENTS_MAX);

        while !stop.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_connections(),
                    token => {
                        let key = usize::from(token) - CONN_TOKEN_BASE;
                        self.drive_connection(key, event.is_readable(), event.is_writable());
                    }
                }
            }

            self.apply_write_subscriptions();
            self.reap_closed_connections();
        }

        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    set_socket_opts(&mut stream);

                    let entry = self.conns.vacant_entry();
                    let key = entry.key();
                    let token = Token(key + CONN_TOKEN_BASE);

                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        error!("unable to register connection: {}", e);
                        continue;
                    }

                    debug!("accepted connection {} from {}", key, peer_addr);

                    entry.insert(Connection::new(stream, key, peer_addr));
                    self.dispatcher.active_connections += 1;
                    self.dispatcher.total_connections += 1;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn drive_connection(&mut self, key: usize, readable: bool, writable: bool) {
        let conn = match self.conns.get_mut(key) {
            Some(conn) => conn,
            None => return,
        };

        // edge-triggered readiness: keep going until the socket runs dry
        if readable {
            while conn.on_readable(&mut self.dispatcher) {}
        }
        if writable {
            while conn.on_writable(&mut self.dispatcher) {}
        }
    }

    fn apply_write_subscriptions(&mut self) {
        let subs = std::mem::take(&mut self.dispatcher.write_subs);

        for (key, enable) in subs {
            let conn = match self.conns.get_mut(key) {
                Some(conn) => conn,
                None => continue,
            };

            if conn.closed() {
                continue;
            }

            let interest = if enable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            let token = Token(key + CONN_TOKEN_BASE);

            if let Err(e) = self
                .poll
                .registry()
                .reregister(conn.sock_mut(), token, interest)
            {
                warn!("connection {}: unable to update interest: {}", key, e);
            }
        }
    }

    fn reap_closed_connections(&mut self) {
        let closed: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.closed())
            .map(|(key, _)| key)
            .collect();

        for key in closed {
            let mut conn = self.conns.remove(key);

            conn.finalise(&mut self.dispatcher);

            if let Err(e) = self.poll.registry().deregister(conn.sock_mut()) {
                debug!("connection {}: deregister failed: {}", key, e);
            }

            self.dispatcher.active_connections -= 1;

            debug!(
                "connection {} removed ({} bytes in, {} bytes out)",
                key,
                conn.bytes_received(),
                conn.bytes_sent()
            );
        }
    }
}
