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

use crate::buffer::Buffer;
use crate::embedded::find_embedded_content;
use crate::request::{Credentials, Method, ParseError, Request};
use crate::response::{error_document, HandlerError, Response, Status};
use crate::static_files;
use crate::websocket;
use crate::websocket::{Message, MessageDecoder};
use log::{debug, error, warn};
use std::cell::RefCell;
use std::cmp;
use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

/// Once the output buffer reaches this size the connection is closed rather
/// than allowed to grow further.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Socket reads and static-file reads happen in chunks of this size.
pub const READ_WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Request headers larger than this draw a 501 before any parsing happens.
pub const MAX_HEADERS_SIZE: usize = 64 * 1024;

const SERVER_STRING: &str = concat!("tidepool/", env!("CARGO_PKG_VERSION"));

/// The byte stream a connection drives. Implemented for `mio::net::TcpStream`
/// by the server and by scripted in-memory streams in tests.
///
/// Reads and writes must be non-blocking: a stream with nothing to offer
/// returns `WouldBlock` rather than waiting.
pub trait Transport: Read + Write {
    fn shutdown(&mut self) -> Result<(), io::Error>;
}

/// What a connection needs from the server that owns it: write-readiness
/// subscription, the thread-affinity assertion, and request dispatch.
///
/// The connection never holds a reference to the server. The server passes
/// itself (or a stand-in) into each event entry point.
pub trait ConnectionHost {
    fn subscribe_to_write_events(&mut self, connection_id: usize) -> bool;
    fn unsubscribe_from_write_events(&mut self, connection_id: usize) -> bool;

    /// Asserts that the caller is on the event-loop thread that owns the
    /// connection.
    fn check_thread(&self);

    /// Dispatches a request to the application. `Ok(None)` means no handler
    /// claimed it and the static path (or websocket upgrade) should be
    /// tried. An error is rendered as a 500.
    fn handle(&mut self, request: &Request) -> Result<Option<Response>, HandlerError>;

    fn web_socket_handler(&self, uri: &str) -> Option<Rc<RefCell<dyn WebSocketHandler>>>;
    fn is_cross_origin_allowed(&self, uri: &str) -> bool;
    fn stats_document(&self) -> String;
    fn static_path(&self) -> String;
}

/// Capability handed to websocket handlers for talking back to the peer.
pub trait WebSocket {
    fn send_text(&mut self, text: &str);
    fn send_binary(&mut self, data: &[u8]);
    fn close(&mut self);
    fn connection_id(&self) -> usize;
    fn peer_addr(&self) -> SocketAddr;
}

/// Application-side websocket endpoint. One handler instance may serve many
/// connections; the `WebSocket` argument identifies which one an event is
/// for.
pub trait WebSocketHandler {
    fn on_connect(&mut self, _ws: &mut dyn WebSocket) {}
    fn on_text(&mut self, _ws: &mut dyn WebSocket, _text: &str) {}
    fn on_binary(&mut self, _ws: &mut dyn WebSocket, _data: &[u8]) {}
    fn on_disconnect(&mut self, _ws: &mut dyn WebSocket) {}
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum State {
    // initial. handle_headers consumes until the blank line
    ReadingHeaders,

    // a request with a body; accumulating content-length bytes
    BufferingPostData,

    // legacy upgrade: waiting for the 8 challenge bytes after the headers
    ReadingWebSocketKey3,

    // 0x00 ... 0xff framed text messages
    HandlingHixieWebSocket,

    // rfc 6455 frames
    HandlingHybiWebSocket,
}

/// One accepted socket and everything needed to drive it: input and output
/// buffers, the protocol state tag, and the latches controlling shutdown.
///
/// All methods must be called on the owning event-loop thread; entry points
/// assert this through the host.
pub struct Connection<S: Transport> {
    sock: S,
    id: usize,
    peer: SocketAddr,
    state: State,
    in_buf: Buffer,
    out_buf: Buffer,
    shutdown: bool,
    had_send_error: bool,
    close_on_empty: bool,
    registered_for_write_events: bool,
    bytes_sent: u64,
    bytes_received: u64,
    connected_at: Instant,
    ws_handler: Option<Rc<RefCell<dyn WebSocketHandler>>>,
    request: Option<Request>,
    hixie_keys: [u32; 2],
    hixie_extra_headers: String,
    shutdown_by_user: bool,
}

impl<S: Transport> Connection<S> {
    pub fn new(sock: S, id: usize, peer: SocketAddr) -> Connection<S> {
        Connection {
            sock,
            id,
            peer,
            state: State::ReadingHeaders,
            in_buf: Buffer::new(),
            out_buf: Buffer::new(),
            shutdown: false,
            had_send_error: false,
            close_on_empty: false,
            registered_for_write_events: false,
            bytes_sent: 0,
            bytes_received: 0,
            connected_at: Instant::now(),
            ws_handler: None,
            request: None,
            hixie_keys: [0, 0],
            hixie_extra_headers: String::new(),
            shutdown_by_user: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn closed(&self) -> bool {
        self.shutdown
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.request.as_ref().and_then(|r| r.credentials())
    }

    pub fn sock_mut(&mut self) -> &mut S {
        &mut self.sock
    }

    /// Application-requested close. Protocol and error paths use
    /// `close_internal`, which does not set the user latch.
    pub fn close(&mut self, host: &mut dyn ConnectionHost) {
        self.shutdown_by_user = true;
        self.close_internal(host);
    }

    /// Requests an orderly shutdown once everything buffered has reached the
    /// socket.
    pub fn close_when_empty(&mut self, host: &mut dyn ConnectionHost) {
        if self.out_buf.is_empty() {
            self.close_internal(host);
        } else {
            self.close_on_empty = true;
        }
    }

    fn close_internal(&mut self, host: &mut dyn ConnectionHost) {
        host.check_thread();

        if !self.shutdown {
            if let Err(e) = self.sock.shutdown() {
                warn!("connection {}: unable to shutdown socket: {}", self.id, e);
            }
        }
        self.shutdown = true;
    }

    /// Called by the server before the connection is dropped. Releases the
    /// websocket handler, telling it the peer is gone.
    pub fn finalise(&mut self, host: &mut dyn ConnectionHost) {
        host.check_thread();

        if let Some(handler) = self.ws_handler.take() {
            let mut ws = WebSocketContext { conn: self, host };
            handler.borrow_mut().on_disconnect(&mut ws);
        }
    }

    fn safe_send(&mut self, host: &mut dyn ConnectionHost, data: &[u8]) -> Option<usize> {
        if self.shutdown || self.had_send_error {
            // the socket is already closed or has had a send failure
            return None;
        }

        match self.sock.write(data) {
            Ok(size) => {
                self.bytes_sent += size as u64;
                Some(size)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Some(0),
            Err(e) => {
                warn!(
                    "connection {}: unable to write to socket: {}, disabling further writes",
                    self.id, e
                );
                self.had_send_error = true;
                self.close_internal(host);
                None
            }
        }
    }

    /// Queues bytes for the peer, sending directly when the output buffer is
    /// empty and a flush was requested. Growing the output buffer past
    /// `MAX_BUFFER_SIZE` closes the connection and fails the write.
    fn write(&mut self, host: &mut dyn ConnectionHost, data: &[u8], flush_it: bool) -> bool {
        if self.closed() || self.close_on_empty {
            return false;
        }

        if !data.is_empty() {
            let mut bytes_sent = 0;

            if self.out_buf.is_empty() && flush_it {
                // fast path: send directly, skipping the buffer
                match self.safe_send(host, data) {
                    Some(size) if size == data.len() => return true,
                    Some(size) => bytes_sent = size,
                    None => return false,
                }
            }

            let bytes_to_buffer = data.len() - bytes_sent;
            let new_buffer_size = self.out_buf.read_avail() + bytes_to_buffer;

            if new_buffer_size >= MAX_BUFFER_SIZE {
                warn!(
                    "connection {}: closing, buffer size too large ({} >= {})",
                    self.id, new_buffer_size, MAX_BUFFER_SIZE
                );
                self.close_internal(host);
                return false;
            }

            self.out_buf.extend(&data[bytes_sent..]);
        }

        if flush_it {
            return self.flush(host);
        }

        true
    }

    fn buffer_line(&mut self, host: &mut dyn ConnectionHost, line: &str) -> bool {
        if !self.write(host, line.as_bytes(), false) {
            return false;
        }
        self.write(host, b"\r\n", false)
    }

    /// Drains the output buffer to the socket as far as it will go, then
    /// reconciles the write-event subscription with whether anything is
    /// still pending.
    fn flush(&mut self, host: &mut dyn ConnectionHost) -> bool {
        if self.out_buf.is_empty() {
            return true;
        }

        if self.shutdown || self.had_send_error {
            return false;
        }

        let num_sent = match self.sock.write(self.out_buf.read_buf()) {
            Ok(size) => {
                self.bytes_sent += size as u64;
                size
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                warn!(
                    "connection {}: unable to write to socket: {}, disabling further writes",
                    self.id, e
                );
                self.had_send_error = true;
                self.close_internal(host);
                return false;
            }
        };

        self.out_buf.read_commit(num_sent);

        if !self.out_buf.is_empty() && !self.registered_for_write_events {
            if !host.subscribe_to_write_events(self.id) {
                return false;
            }
            self.registered_for_write_events = true;
        } else if self.out_buf.is_empty() && self.registered_for_write_events {
            if !host.unsubscribe_from_write_events(self.id) {
                return false;
            }
            self.registered_for_write_events = false;
        }

        if self.out_buf.is_empty() && !self.closed() && self.close_on_empty {
            debug!("connection {}: output drained, closing", self.id);
            self.close_internal(host);
        }

        true
    }

    /// One read of up to `READ_WRITE_BUFFER_SIZE` bytes. Returns true when a
    /// full chunk arrived and the caller should call again (edge-triggered
    /// hosts drain the socket by looping).
    pub fn on_readable(&mut self, host: &mut dyn ConnectionHost) -> bool {
        host.check_thread();

        if self.closed() {
            return false;
        }

        let result = self.in_buf.write_from(&mut self.sock, READ_WRITE_BUFFER_SIZE);

        match result {
            Ok(0) => {
                debug!("connection {}: remote end closed connection", self.id);
                self.close_internal(host);
                false
            }
            Ok(size) => {
                self.bytes_received += size as u64;
                self.handle_new_data(host);
                size == READ_WRITE_BUFFER_SIZE && !self.closed()
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                warn!("connection {}: unable to read from socket: {}", self.id, e);
                false
            }
        }
    }

    /// One flush attempt. Returns true when bytes moved and more remain, so
    /// edge-triggered hosts can loop until the socket stops accepting.
    pub fn on_writable(&mut self, host: &mut dyn ConnectionHost) -> bool {
        host.check_thread();

        if self.closed() {
            return false;
        }

        let before = self.out_buf.read_avail();

        if !self.flush(host) {
            return false;
        }

        let after = self.out_buf.read_avail();

        after < before && after > 0 && !self.closed()
    }

    fn handle_new_data(&mut self, host: &mut dyn ConnectionHost) {
        match self.state {
            State::ReadingHeaders => self.handle_headers(host),
            State::BufferingPostData => self.handle_buffering_post_data(host),
            State::ReadingWebSocketKey3 => self.handle_web_socket_key3(host),
            State::HandlingHixieWebSocket => self.handle_hixie_web_socket(host),
            State::HandlingHybiWebSocket => self.handle_hybi_web_socket(host),
        }
    }

    fn handle_headers(&mut self, host: &mut dyn ConnectionHost) {
        if self.in_buf.read_avail() < 4 {
            return;
        }

        let mut header_end = None;

        {
            let buf = self.in_buf.read_buf();
            for i in 0..=(buf.len() - 4) {
                if &buf[i..(i + 4)] == b"\r\n\r\n" {
                    header_end = Some(i + 4);
                    break;
                }
            }
        }

        match header_end {
            Some(end) => {
                // the input buffer is erased before dispatch, so the parse
                // works over an owned copy of the header block
                let header_bytes = self.in_buf.read_buf()[..end].to_vec();

                if !self.process_headers(host, &header_bytes) {
                    self.close_internal(host);
                    return;
                }

                self.in_buf.read_commit(end);
                self.handle_new_data(host);
            }
            None => {
                if self.in_buf.read_avail() > MAX_HEADERS_SIZE {
                    self.send_unsupported_error(host, "Headers too big");
                }
            }
        }
    }

    fn process_headers(&mut self, host: &mut dyn ConnectionHost, buf: &[u8]) -> bool {
        let mut request = match Request::parse(buf, self.peer) {
            Ok(request) => request,
            Err(ParseError::UnsupportedVersion) => {
                return self.send_unsupported_error(host, "Unsupported HTTP version");
            }
            Err(ParseError::InvalidContentLength) => {
                return self.send_bad_request(host, "Invalid content length");
            }
            Err(ParseError::Parse(
                httparse::Error::HeaderName | httparse::Error::HeaderValue,
            )) => {
                return self.send_bad_request(host, "Malformed header");
            }
            Err(_) => {
                return self.send_bad_request(host, "Malformed request line");
            }
        };

        debug!(
            "connection {}: request: {:?} {}",
            self.id,
            request.method(),
            request.uri()
        );

        let uri = request.uri().to_owned();
        let allow_cross_origin = host.is_cross_origin_allowed(&uri);

        self.hixie_extra_headers.clear();

        if allow_cross_origin {
            if let Some(origin) = request.header("origin") {
                self.hixie_extra_headers
                    .push_str(&format!("Sec-WebSocket-Origin: {}\r\n", origin));
            }
        }
        if let Some(host_header) = request.header("host") {
            if !allow_cross_origin {
                self.hixie_extra_headers
                    .push_str(&format!("Sec-WebSocket-Origin: http://{}\r\n", host_header));
            }
            self.hixie_extra_headers.push_str(&format!(
                "Sec-WebSocket-Location: ws://{}{}\r\n",
                host_header, uri
            ));
        }

        self.hixie_keys[0] = request
            .header("sec-websocket-key1")
            .map(websocket::parse_hixie_key)
            .unwrap_or(0);
        self.hixie_keys[1] = request
            .header("sec-websocket-key2")
            .map(websocket::parse_hixie_key)
            .unwrap_or(0);

        let have_connection_upgrade = request
            .header("connection")
            .map_or(false, |v| v.eq_ignore_ascii_case("upgrade"));
        let have_websocket_upgrade = request
            .header("upgrade")
            .map_or(false, |v| v.eq_ignore_ascii_case("websocket"));

        if have_connection_upgrade && have_websocket_upgrade {
            if request.method() != Method::Get {
                return self.send_bad_request(host, "Non-GET WebSocket request");
            }

            match host.web_socket_handler(&uri) {
                Some(handler) => {
                    self.ws_handler = Some(handler);
                    request.set_method(Method::WebSocket);
                }
                None => {
                    warn!(
                        "connection {}: no websocket end point for '{}'",
                        self.id, uri
                    );
                    return self.send_404(host, &uri);
                }
            }
        }

        if request.method() == Method::Get {
            if let Some(content) = find_embedded_content(&uri) {
                return self.send_data(host, static_files::content_type(&uri), content.data);
            }
        }

        let content_length = request.content_length();

        if content_length > MAX_BUFFER_SIZE {
            return self.send_bad_request(host, "Content length too long");
        }

        self.request = Some(request);

        if content_length == 0 {
            return self.handle_page_request(host);
        }

        self.state = State::BufferingPostData;
        true
    }

    fn handle_buffering_post_data(&mut self, host: &mut dyn ConnectionHost) {
        let complete = match &mut self.request {
            Some(request) => request.consume_content(&mut self.in_buf),
            None => {
                self.close_internal(host);
                return;
            }
        };

        if complete {
            self.state = State::ReadingHeaders;
            if !self.handle_page_request(host) {
                self.close_internal(host);
            }
        }
    }

    fn handle_page_request(&mut self, host: &mut dyn ConnectionHost) -> bool {
        let request = match self.request.take() {
            Some(request) => request,
            None => return false,
        };

        let result = host.handle(&request);

        let uri = request.uri().to_owned();
        let method = request.method();
        let range_header = request.header("range").map(str::to_owned);
        let ws_version = request
            .header("sec-websocket-version")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0);
        let hybi_key = request.header("sec-websocket-key").map(str::to_owned);

        self.request = Some(request);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!("connection {}: page error: {}", self.id, e);
                return self.send_ise(host, &e.to_string());
            }
        };

        match response {
            Some(response) => self.send_response(host, response, &uri),
            None => {
                if method == Method::WebSocket {
                    if self.ws_handler.is_none() {
                        self.ws_handler = host.web_socket_handler(&uri);
                    }
                    if self.ws_handler.is_none() {
                        warn!(
                            "connection {}: no websocket end point for '{}'",
                            self.id, uri
                        );
                        return self.send_404(host, &uri);
                    }

                    if ws_version == 0 {
                        debug!(
                            "connection {}: legacy websocket with key1=0x{:x}, key2=0x{:x}",
                            self.id, self.hixie_keys[0], self.hixie_keys[1]
                        );
                        self.state = State::ReadingWebSocketKey3;
                        return true;
                    }

                    let key = hybi_key.unwrap_or_default();
                    self.handle_hybi_handshake(host, ws_version, &key)
                } else {
                    self.send_static_data(host, &uri, range_header.as_deref())
                }
            }
        }
    }

    fn send_response(
        &mut self,
        host: &mut dyn ConnectionHost,
        response: Response,
        uri: &str,
    ) -> bool {
        if response.status() == Status::NotFound {
            return self.send_404(host, uri);
        }

        if !response.status().is_ok() {
            let body = String::from_utf8_lossy(response.payload()).into_owned();
            return self.send_error(host, response.status(), &body);
        }

        self.buffer_response_and_common_headers(host, response.status());
        self.buffer_line(
            host,
            &format!("Content-Length: {}", response.payload().len()),
        );
        self.buffer_line(host, &format!("Content-Type: {}", response.content_type()));
        if response.keeps_connection_alive() {
            self.buffer_line(host, "Connection: keep-alive");
        } else {
            self.buffer_line(host, "Connection: close");
        }
        self.buffer_line(host, &format!("Last-Modified: {}", static_files::now()));
        self.buffer_line(host, "Cache-Control: no-store");
        self.buffer_line(host, "Pragma: no-cache");
        self.buffer_line(host, &format!("Expires: {}", static_files::now()));
        for (name, value) in response.additional_headers() {
            self.buffer_line(host, &format!("{}: {}", name, value));
        }
        self.buffer_line(host, "");

        if !self.write(host, response.payload(), true) {
            return false;
        }

        if !response.keeps_connection_alive() {
            self.close_when_empty(host);
        }
        true
    }

    fn handle_hybi_handshake(
        &mut self,
        host: &mut dyn ConnectionHost,
        version: u32,
        key: &str,
    ) -> bool {
        if version != 8 && version != 13 {
            return self.send_bad_request(host, "Invalid websocket version");
        }

        debug!(
            "connection {}: websocket upgrade with key={}",
            self.id, key
        );

        let accept = match websocket::calculate_accept_key(key.as_bytes()) {
            Ok(accept) => accept,
            Err(()) => return self.send_bad_request(host, "Invalid websocket key"),
        };

        self.buffer_response_and_common_headers(host, Status::WebSocketProtocolHandshake);
        self.buffer_line(host, "Upgrade: websocket");
        self.buffer_line(host, "Connection: Upgrade");
        self.buffer_line(host, &format!("Sec-WebSocket-Accept: {}", accept));
        self.buffer_line(host, "");
        self.flush(host);

        self.dispatch_connect(host);
        self.state = State::HandlingHybiWebSocket;
        true
    }

    fn handle_web_socket_key3(&mut self, host: &mut dyn ConnectionHost) {
        if self.in_buf.read_avail() < 8 {
            return;
        }

        let mut key3 = [0; 8];
        key3.copy_from_slice(&self.in_buf.read_buf()[..8]);

        let digest = websocket::hixie_digest(self.hixie_keys[0], self.hixie_keys[1], &key3);

        debug!("connection {}: attempting websocket upgrade", self.id);

        self.buffer_response_and_common_headers(host, Status::WebSocketProtocolHandshake);
        self.buffer_line(host, "Upgrade: websocket");
        self.buffer_line(host, "Connection: Upgrade");
        let extra_headers = self.hixie_extra_headers.clone();
        self.write(host, extra_headers.as_bytes(), false);
        self.buffer_line(host, "");

        self.write(host, &digest, true);

        self.state = State::HandlingHixieWebSocket;
        self.in_buf.read_commit(8);

        self.dispatch_connect(host);
    }

    fn handle_hixie_web_socket(&mut self, host: &mut dyn ConnectionHost) {
        if self.in_buf.is_empty() {
            return;
        }

        let mut message_start = 0;

        while message_start < self.in_buf.read_avail() {
            let buf = self.in_buf.read_buf();

            if buf[message_start] != 0x00 {
                warn!(
                    "connection {}: error in websocket input stream (got 0x{:02x})",
                    self.id, buf[message_start]
                );
                self.close_internal(host);
                return;
            }

            let mut end_of_message = None;
            for (i, &b) in buf.iter().enumerate().skip(message_start + 1) {
                if b == 0xff {
                    end_of_message = Some(i);
                    break;
                }
            }

            match end_of_message {
                Some(end) => {
                    let payload = buf[(message_start + 1)..end].to_vec();

                    match String::from_utf8(payload) {
                        Ok(text) => self.deliver_text(host, &text),
                        Err(_) => {
                            warn!(
                                "connection {}: invalid utf-8 in websocket message",
                                self.id
                            );
                            self.close_internal(host);
                            return;
                        }
                    }

                    message_start = end + 1;
                }
                None => break,
            }
        }

        if message_start != 0 {
            self.in_buf.read_commit(message_start);
        }

        if self.in_buf.read_avail() > websocket::MESSAGE_SIZE_MAX {
            warn!("connection {}: websocket message too long", self.id);
            self.close_internal(host);
        }
    }

    fn handle_hybi_web_socket(&mut self, host: &mut dyn ConnectionHost) {
        if self.in_buf.is_empty() {
            return;
        }

        let mut num_decoded = 0;

        loop {
            let buf = self.in_buf.read_buf();
            let mut decoder = MessageDecoder::new(&buf[num_decoded..]);

            let decoded = match decoder.decode_next() {
                Ok(Some(msg)) => {
                    num_decoded += decoder.bytes_decoded();
                    msg
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("connection {}: websocket protocol error: {}", self.id, e);
                    self.close_internal(host);
                    return;
                }
            };

            match decoded {
                Message::Text(payload) => match String::from_utf8(payload) {
                    Ok(text) => self.deliver_text(host, &text),
                    Err(_) => {
                        warn!(
                            "connection {}: invalid utf-8 in websocket message",
                            self.id
                        );
                        self.close_internal(host);
                        return;
                    }
                },
                Message::Binary(payload) => self.deliver_binary(host, &payload),
                Message::Ping(payload) => {
                    self.send_hybi(host, websocket::OPCODE_PONG, &payload);
                }
                Message::Pong(_) => {
                    debug!("connection {}: ignoring pong", self.id);
                }
                Message::Close => {
                    debug!("connection {}: received websocket close", self.id);
                    self.close_internal(host);
                    return;
                }
            }
        }

        if num_decoded != 0 {
            self.in_buf.read_commit(num_decoded);
        }

        if self.in_buf.read_avail() > websocket::MESSAGE_SIZE_MAX {
            warn!("connection {}: websocket message too long", self.id);
            self.close_internal(host);
        }
    }

    fn deliver_text(&mut self, host: &mut dyn ConnectionHost, text: &str) {
        debug!("connection {}: got text message: '{}'", self.id, text);

        if let Some(handler) = self.ws_handler.clone() {
            let mut ws = WebSocketContext { conn: self, host };
            handler.borrow_mut().on_text(&mut ws, text);
        }
    }

    fn deliver_binary(&mut self, host: &mut dyn ConnectionHost, data: &[u8]) {
        debug!(
            "connection {}: got binary message (size: {})",
            self.id,
            data.len()
        );

        if let Some(handler) = self.ws_handler.clone() {
            let mut ws = WebSocketContext { conn: self, host };
            handler.borrow_mut().on_binary(&mut ws, data);
        }
    }

    fn dispatch_connect(&mut self, host: &mut dyn ConnectionHost) {
        if let Some(handler) = self.ws_handler.clone() {
            let mut ws = WebSocketContext { conn: self, host };
            handler.borrow_mut().on_connect(&mut ws);
        }
    }

    fn send_text_message(&mut self, host: &mut dyn ConnectionHost, text: &str) {
        host.check_thread();

        if self.shutdown {
            if self.shutdown_by_user {
                error!(
                    "connection {}: wrote to connection after closing it",
                    self.id
                );
            }
            return;
        }

        if self.state == State::HandlingHixieWebSocket {
            if !self.write(host, &[0x00], false) {
                return;
            }
            if !self.write(host, text.as_bytes(), false) {
                return;
            }
            self.write(host, &[0xff], true);
            return;
        }

        self.send_hybi(host, websocket::OPCODE_TEXT, text.as_bytes());
    }

    fn send_binary_message(&mut self, host: &mut dyn ConnectionHost, data: &[u8]) {
        host.check_thread();

        if self.shutdown {
            if self.shutdown_by_user {
                error!(
                    "connection {}: wrote to connection after closing it",
                    self.id
                );
            }
            return;
        }

        if self.state == State::HandlingHixieWebSocket {
            error!(
                "connection {}: legacy websocket does not support binary",
                self.id
            );
            return;
        }

        self.send_hybi(host, websocket::OPCODE_BINARY, data);
    }

    fn send_hybi(&mut self, host: &mut dyn ConnectionHost, opcode: u8, payload: &[u8]) -> bool {
        let mut header = [0; websocket::HEADER_SIZE_MAX];

        let size = match websocket::write_header(true, opcode, payload.len(), None, &mut header) {
            Ok(size) => size,
            Err(_) => return false,
        };

        if !self.write(host, &header[..size], false) {
            return false;
        }
        self.write(host, payload, true)
    }

    fn send_error(&mut self, host: &mut dyn ConnectionHost, status: Status, body: &str) -> bool {
        assert!(self.state != State::HandlingHixieWebSocket);

        self.buffer_response_and_common_headers(host, status);

        let document = error_document(status, body);

        self.buffer_line(host, &format!("Content-Length: {}", document.len()));
        self.buffer_line(host, "Connection: close");
        self.buffer_line(host, "");
        self.buffer_line(host, &document);

        if !self.flush(host) {
            return false;
        }
        self.close_when_empty(host);
        true
    }

    fn send_unsupported_error(&mut self, host: &mut dyn ConnectionHost, reason: &str) -> bool {
        self.send_error(host, Status::NotImplemented, reason)
    }

    fn send_bad_request(&mut self, host: &mut dyn ConnectionHost, reason: &str) -> bool {
        self.send_error(host, Status::BadRequest, reason)
    }

    fn send_ise(&mut self, host: &mut dyn ConnectionHost, error: &str) -> bool {
        self.send_error(host, Status::InternalServerError, error)
    }

    fn send_404(&mut self, host: &mut dyn ConnectionHost, path: &str) -> bool {
        if let Some(content) = find_embedded_content(path) {
            return self.send_data(host, static_files::content_type(path), content.data);
        }

        if path == "/_livestats.js" {
            let stats = host.stats_document();
            return self.send_data(host, "text/javascript", stats.as_bytes());
        }

        self.send_error(
            host,
            Status::NotFound,
            &format!("Unable to find resource for: {}", path),
        )
    }

    fn send_data(
        &mut self,
        host: &mut dyn ConnectionHost,
        content_type: &str,
        data: &[u8],
    ) -> bool {
        self.buffer_response_and_common_headers(host, Status::Ok);
        self.buffer_line(host, &format!("Content-Type: {}", content_type));
        self.buffer_line(host, &format!("Content-Length: {}", data.len()));
        self.buffer_line(host, "Connection: keep-alive");
        self.buffer_line(host, "");
        self.write(host, data, true)
    }

    fn buffer_response_and_common_headers(
        &mut self,
        host: &mut dyn ConnectionHost,
        status: Status,
    ) {
        let response_line = format!("HTTP/1.1 {} {}", status.code(), status.reason());

        debug!("connection {}: response: {}", self.id, response_line);

        self.buffer_line(host, &response_line);
        self.buffer_line(host, &format!("Server: {}", SERVER_STRING));
        self.buffer_line(host, &format!("Date: {}", static_files::now()));
        self.buffer_line(host, "Access-Control-Allow-Origin: *");
    }

    /// Sends 200 or 206 plus content-length and range headers as needed,
    /// returning the normalized file ranges to stream.
    fn process_ranges_for_static_data(
        &mut self,
        host: &mut dyn ConnectionHost,
        ranges: &[static_files::Range],
        file_size: i64,
    ) -> Vec<static_files::Range> {
        if ranges.is_empty() {
            // easy case: a non-range request
            self.buffer_response_and_common_headers(host, Status::Ok);
            self.buffer_line(host, &format!("Content-Length: {}", file_size));
            return vec![static_files::Range {
                start: 0,
                end: file_size - 1,
            }];
        }

        self.buffer_response_and_common_headers(host, Status::PartialContent);

        let mut content_length = 0;
        let mut range_line = String::from("Content-Range: bytes ");
        let mut send_ranges = Vec::new();

        for range in ranges {
            let actual = static_files::normalize_range(*range, file_size);
            content_length += actual.length();
            range_line.push_str(&format!("{}-{}", actual.start, actual.end));
            send_ranges.push(actual);
        }
        range_line.push_str(&format!("/{}", file_size));

        self.buffer_line(host, &range_line);
        self.buffer_line(host, &format!("Content-Length: {}", content_length));

        send_ranges
    }

    fn send_static_data(
        &mut self,
        host: &mut dyn ConnectionHost,
        uri: &str,
        range_header: Option<&str>,
    ) -> bool {
        let mut path = format!("{}{}", host.static_path(), uri);

        // trim any trailing query
        if let Some(query_pos) = path.find('?') {
            path.truncate(query_pos);
        }
        if path.ends_with('/') {
            path.push_str("index.html");
        }

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => return self.send_404(host, uri),
        };
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(_) => return self.send_404(host, uri),
        };
        let file_size = meta.len() as i64;

        let ranges = match range_header {
            Some(header) if !header.is_empty() => match static_files::parse_ranges(header) {
                Some(ranges) => ranges,
                None => return self.send_bad_request(host, "Bad range header"),
            },
            _ => Vec::new(),
        };

        let ranges = self.process_ranges_for_static_data(host, &ranges, file_size);

        self.buffer_line(
            host,
            &format!("Content-Type: {}", static_files::content_type(&path)),
        );
        self.buffer_line(host, "Connection: keep-alive");
        self.buffer_line(host, "Accept-Ranges: bytes");

        let mtime = match meta.modified() {
            Ok(mtime) => mtime,
            Err(_) => std::time::SystemTime::now(),
        };
        self.buffer_line(
            host,
            &format!("Last-Modified: {}", static_files::webtime(mtime)),
        );

        if !static_files::is_cacheable(&path) {
            self.buffer_line(host, "Cache-Control: no-store");
            self.buffer_line(host, "Pragma: no-cache");
            self.buffer_line(host, &format!("Expires: {}", static_files::now()));
        }
        self.buffer_line(host, "");

        if !self.flush(host) {
            return false;
        }

        for range in &ranges {
            if file.seek(SeekFrom::Start(range.start as u64)).is_err() {
                // headers may already be on the wire, no recovery
                return false;
            }

            let mut bytes_left = range.length();

            while bytes_left > 0 {
                let mut buf = [0u8; READ_WRITE_BUFFER_SIZE];
                let want = cmp::min(buf.len() as u64, bytes_left) as usize;

                let bytes_read = match file.read(&mut buf[..want]) {
                    Ok(0) => {
                        error!("connection {}: error reading file: unexpected eof", self.id);
                        return false;
                    }
                    Ok(size) => size,
                    Err(e) => {
                        error!("connection {}: error reading file: {}", self.id, e);
                        return false;
                    }
                };

                bytes_left -= bytes_read as u64;

                if !self.write(host, &buf[..bytes_read], true) {
                    return false;
                }
            }
        }

        true
    }
}

/// Pairs a connection with its host for the duration of a handler callback.
pub struct WebSocketContext<'a, S: Transport> {
    conn: &'a mut Connection<S>,
    host: &'a mut dyn ConnectionHost,
}

impl<S: Transport> WebSocket for WebSocketContext<'_, S> {
    fn send_text(&mut self, text: &str) {
        self.conn.send_text_message(&mut *self.host, text);
    }

    fn send_binary(&mut self, data: &[u8]) {
        self.conn.send_binary_message(&mut *self.host, data);
    }

    fn close(&mut self) {
        self.conn.close(&mut *self.host);
    }

    fn connection_id(&self) -> usize {
        self.conn.id
    }

    fn peer_addr(&self) -> SocketAddr {
        self.conn.peer
    }
}
