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

use crate::embedded::find_embedded_content;
use std::error::Error;
use std::str;

/// Errors returned by page handlers are rendered as a 500 with the error
/// text as the body.
pub type HandlerError = Box<dyn Error>;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Status {
    WebSocketProtocolHandshake,
    Ok,
    PartialContent,
    BadRequest,
    Forbidden,
    NotFound,
    InternalServerError,
    NotImplemented,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::WebSocketProtocolHandshake => 101,
            Status::Ok => 200,
            Status::PartialContent => 206,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalServerError => 500,
            Status::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::WebSocketProtocolHandshake => "WebSocket Protocol Handshake",
            Status::Ok => "OK",
            Status::PartialContent => "Partial Content",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalServerError => "Internal Server Error",
            Status::NotImplemented => "Not Implemented",
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok | Status::PartialContent)
    }
}

/// A response produced by a page handler, consumed once by the connection.
pub struct Response {
    status: Status,
    content_type: String,
    payload: Vec<u8>,
    keep_alive: bool,
    headers: Vec<(String, String)>,
}

impl Response {
    pub fn new(status: Status, content_type: &str, payload: Vec<u8>) -> Response {
        Response {
            status,
            content_type: content_type.to_owned(),
            payload,
            keep_alive: true,
            headers: Vec::new(),
        }
    }

    pub fn html(body: &str) -> Response {
        Self::new(Status::Ok, "text/html", body.as_bytes().to_vec())
    }

    pub fn text(body: &str) -> Response {
        Self::new(Status::Ok, "text/plain", body.as_bytes().to_vec())
    }

    pub fn json(body: &str) -> Response {
        Self::new(Status::Ok, "application/json", body.as_bytes().to_vec())
    }

    pub fn error(status: Status, message: &str) -> Response {
        Self::new(status, "text/html", message.as_bytes().to_vec())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Response {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Response {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn keeps_connection_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn additional_headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

/// Renders the HTML document for an error response, using the embedded
/// template when present and a synthesized minimal page otherwise.
pub fn error_document(status: Status, body: &str) -> String {
    let code = status.code();
    let message = status.reason();

    match find_embedded_content("/_error.html") {
        Some(content) => {
            let template = str::from_utf8(content.data).unwrap_or("");
            template
                .replace("%%ERRORCODE%%", &code.to_string())
                .replace("%%MESSAGE%%", message)
                .replace("%%BODY%%", body)
        }
        None => format!(
            "<html><head><title>{} - {}</title></head>\
             <body><h1>{} - {}</h1>\
             <div>{}</div><hr/><div><i>Powered by tidepool</i></div></body></html>",
            code, message, code, message, body
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Ok.code(), 200);
        assert_eq!(Status::Ok.reason(), "OK");
        assert_eq!(Status::PartialContent.code(), 206);
        assert_eq!(
            Status::WebSocketProtocolHandshake.reason(),
            "WebSocket Protocol Handshake"
        );
        assert_eq!(Status::NotImplemented.code(), 501);

        assert!(Status::Ok.is_ok());
        assert!(Status::PartialContent.is_ok());
        assert!(!Status::NotFound.is_ok());
        assert!(!Status::WebSocketProtocolHandshake.is_ok());
    }

    #[test]
    fn test_error_document_substitution() {
        let doc = error_document(Status::NotFound, "no such thing");

        assert!(doc.contains("404 - Not Found"));
        assert!(doc.contains("no such thing"));
        assert!(!doc.contains("%%ERRORCODE%%"));
        assert!(!doc.contains("%%MESSAGE%%"));
        assert!(!doc.contains("%%BODY%%"));
    }

    #[test]
    fn test_response_builder() {
        let resp = Response::json("{}")
            .with_header("X-Extra", "1")
            .keep_alive(false);

        assert_eq!(resp.status(), Status::Ok);
        assert_eq!(resp.content_type(), "application/json");
        assert_eq!(resp.payload(), b"{}");
        assert_eq!(resp.keeps_connection_alive(), false);
        assert_eq!(resp.additional_headers().len(), 1);
    }
}
