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

use std::io;
use std::io::{Read, Write};

// consumed prefixes shorter than this are kept as a head offset instead of
// shifting the remaining bytes down
const COMPACT_THRESHOLD: usize = 16 * 1024;

/// Growable byte queue with cheap prefix consumption.
///
/// Bytes are appended at the tail and consumed from the head. The head is
/// tracked as an offset so that consuming a prefix does not shift the
/// remainder on every call. Capacity is unbounded; callers that need a cap
/// enforce it on top of `read_avail`.
pub struct Buffer {
    buf: Vec<u8>,
    start: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            buf: Vec::new(),
            start: 0,
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.start = 0;
    }

    pub fn read_avail(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.read_avail() == 0
    }

    pub fn read_buf(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    pub fn read_commit(&mut self, amount: usize) {
        assert!(self.start + amount <= self.buf.len());

        self.start += amount;

        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start >= COMPACT_THRESHOLD {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Reads up to `max` bytes from `r` and appends them. Returns the number
    /// of bytes read. A `WouldBlock` from `r` is returned as-is.
    pub fn write_from(&mut self, r: &mut dyn Read, max: usize) -> Result<usize, io::Error> {
        let cur = self.buf.len();
        self.buf.resize(cur + max, 0);

        match r.read(&mut self.buf[cur..]) {
            Ok(size) => {
                self.buf.truncate(cur + size);
                Ok(size)
            }
            Err(e) => {
                self.buf.truncate(cur);
                Err(e)
            }
        }
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.buf.extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}
