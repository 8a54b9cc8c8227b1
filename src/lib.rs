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

//! Embeddable single-threaded HTTP/1.1 server with WebSocket support
//! (RFC 6455 and the legacy hixie-76 handshake), static-file serving with
//! byte ranges, and application page handlers, all driven by one poll loop.

pub mod buffer;
pub mod connection;
pub mod embedded;
pub mod logger;
pub mod request;
pub mod response;
pub mod server;
pub mod static_files;
pub mod websocket;
