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
use std::cmp;
use std::collections::HashMap;
use std::net::SocketAddr;

pub const HEADERS_MAX: usize = 64;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    // assigned after upgrade negotiation, never parsed off the wire
    WebSocket,
}

impl Method {
    fn from_token(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Parse(httparse::Error),

    #[error("unsupported HTTP version")]
    UnsupportedVersion,

    #[error("unrecognized method")]
    BadMethod,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("incomplete request")]
    Incomplete,
}

/// Authentication info attached to a request. Populated by embedding
/// applications; the core server does not authenticate.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub authenticated: bool,
    pub username: String,
    pub attributes: HashMap<String, String>,
}

/// A parsed request with owned header copies.
///
/// Header values are copied out of the connection's input buffer during
/// parsing because that buffer is erased as soon as dispatch begins. Keys
/// are canonicalized to lowercase on insert; duplicates overwrite.
pub struct Request {
    peer: SocketAddr,
    method: Method,
    uri: String,
    headers: HashMap<String, String>,
    content_length: usize,
    body: Vec<u8>,
    credentials: Option<Credentials>,
}

impl Request {
    /// Parses a complete header block, including the terminating blank line.
    /// The caller has already located the blank line; anything short of a
    /// complete request here is an error.
    pub fn parse(buf: &[u8], peer: SocketAddr) -> Result<Request, ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; HEADERS_MAX];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(ParseError::Incomplete),
            Err(httparse::Error::Version) => return Err(ParseError::UnsupportedVersion),
            Err(e) => return Err(ParseError::Parse(e)),
        }

        if req.version != Some(1) {
            return Err(ParseError::UnsupportedVersion);
        }

        let method = match Method::from_token(req.method.unwrap()) {
            Some(method) => method,
            None => return Err(ParseError::BadMethod),
        };

        let uri = req.path.unwrap().to_owned();

        let mut header_map = HashMap::with_capacity(req.headers.len());

        for h in req.headers.iter() {
            let value = String::from_utf8_lossy(h.value).into_owned();
            header_map.insert(h.name.to_ascii_lowercase(), value);
        }

        let content_length = match header_map.get("content-length") {
            Some(v) => match v.trim().parse() {
                Ok(len) => len,
                Err(_) => return Err(ParseError::InvalidContentLength),
            },
            None => 0,
        };

        Ok(Request {
            peer,
            method,
            uri,
            headers: header_map,
            content_length,
            body: Vec::new(),
            credentials: None,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    /// Moves buffered content bytes into the body. Returns true once the
    /// whole declared content length has arrived.
    pub fn consume_content(&mut self, in_buf: &mut Buffer) -> bool {
        let needed = self.content_length - self.body.len();
        let take = cmp::min(needed, in_buf.read_avail());

        if take > 0 {
            self.body.extend_from_slice(&in_buf.read_buf()[..take]);
            in_buf.read_commit(take);
        }

        self.body.len() == self.content_length
    }
}
