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

use arrayvec::ArrayString;
use md5::Md5;
use sha1::{Digest, Sha1};
use std::io;
use std::io::Write;
use std::str;
use std::str::FromStr;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// 1 byte flags + 9 bytes payload size + 4 bytes mask
pub const HEADER_SIZE_MAX: usize = 14;

const PSIZE_3BYTE: usize = 126;
const PSIZE_9BYTE: usize = 65536;

pub const OPCODE_CONTINUATION: u8 = 0;
pub const OPCODE_TEXT: u8 = 1;
pub const OPCODE_BINARY: u8 = 2;
pub const OPCODE_CLOSE: u8 = 8;
pub const OPCODE_PING: u8 = 9;
pub const OPCODE_PONG: u8 = 10;

/// Largest message payload accepted from a peer. Anything bigger closes the
/// connection.
pub const MESSAGE_SIZE_MAX: usize = 16384;

const WS_HASH_INPUT_MAX: usize = 256;
pub const WS_ACCEPT_MAX: usize = 28; // base64_encode(sha1_hash) = 28 bytes

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("reserved bits set")]
    ReservedBits,

    #[error("unmasked frame from client")]
    UnmaskedFrame,

    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u8),

    #[error("message too large ({0} bytes)")]
    MessageTooLarge(usize),
}

#[derive(Clone, Copy, Debug)]
pub struct FrameInfo {
    pub fin: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_offset: usize,
    pub payload_size: usize,
}

fn header_size(payload_size: usize, masked: bool) -> usize {
    let size = if payload_size < PSIZE_3BYTE {
        1 + 1
    } else if payload_size < PSIZE_9BYTE {
        1 + 3
    } else {
        1 + 9
    };

    if masked {
        size + 4
    } else {
        size
    }
}

/// Parses a frame header from the front of `buf`. Returns `None` when more
/// bytes are needed, without consuming anything.
pub fn read_header(buf: &[u8]) -> Result<Option<FrameInfo>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    if buf[0] & 0x70 != 0 {
        return Err(FrameError::ReservedBits);
    }

    let b1 = buf[1] & 0x7f;

    let (mut hsize, psize) = if b1 < (PSIZE_3BYTE as u8) {
        (2, b1 as usize)
    } else if b1 == (PSIZE_3BYTE as u8) {
        if buf.len() < 2 + 2 {
            return Ok(None);
        }

        let mut arr = [0; 2];
        arr.copy_from_slice(&buf[2..4]);
        (4, u16::from_be_bytes(arr) as usize)
    } else {
        if buf.len() < 2 + 8 {
            return Ok(None);
        }

        let mut arr = [0; 8];
        arr.copy_from_slice(&buf[2..10]);
        (10, u64::from_be_bytes(arr) as usize)
    };

    let mask = if buf[1] & 0x80 != 0 {
        if buf.len() < hsize + 4 {
            return Ok(None);
        }

        let mut mask = [0; 4];
        mask.copy_from_slice(&buf[hsize..hsize + 4]);
        hsize += 4;

        Some(mask)
    } else {
        None
    };

    Ok(Some(FrameInfo {
        fin: buf[0] & 0x80 != 0,
        opcode: buf[0] & 0x0f,
        mask,
        payload_offset: hsize,
        payload_size: psize,
    }))
}

// returns the payload offset
pub fn write_header(
    fin: bool,
    opcode: u8,
    payload_size: usize,
    mask: Option<[u8; 4]>,
    buf: &mut [u8],
) -> Result<usize, io::Error> {
    let hsize = header_size(payload_size, mask.is_some());
    if buf.len() < hsize {
        return Err(io::Error::from(io::ErrorKind::WriteZero));
    }

    let mut b0 = 0;
    if fin {
        b0 |= 0x80;
    }
    b0 |= opcode & 0x0f;

    buf[0] = b0;

    let hsize = if payload_size < PSIZE_3BYTE {
        buf[1] = payload_size as u8;
        2
    } else if payload_size < PSIZE_9BYTE {
        buf[1] = PSIZE_3BYTE as u8;
        let arr = (payload_size as u16).to_be_bytes();
        buf[2..4].copy_from_slice(&arr);
        4
    } else {
        buf[1] = 0x7f;
        let arr = (payload_size as u64).to_be_bytes();
        buf[2..10].copy_from_slice(&arr);
        10
    };

    if let Some(mask) = mask {
        buf[1] |= 0x80;
        buf[hsize..hsize + 4].copy_from_slice(&mask);
        Ok(hsize + 4)
    } else {
        Ok(hsize)
    }
}

pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, c) in buf.iter_mut().enumerate() {
        *c ^= mask[(offset + i) % 4];
    }
}

/// Writes one unfragmented, unmasked server-to-client frame.
pub fn write_frame(dest: &mut dyn Write, opcode: u8, payload: &[u8]) -> Result<(), io::Error> {
    let mut header = [0; HEADER_SIZE_MAX];

    let size = write_header(true, opcode, payload.len(), None, &mut header)?;

    dest.write_all(&header[..size])?;
    dest.write_all(payload)
}

#[derive(Debug, PartialEq)]
pub enum Message {
    Text(Vec<u8>),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Resumable decoder over a contiguous input buffer.
///
/// Each call to `decode_next` yields at most one complete message and
/// advances the internal cursor past it. Incomplete input yields `Ok(None)`
/// and leaves the cursor where it was, so the caller can retry with more
/// bytes after erasing `bytes_decoded()` from the front of its buffer.
///
/// The decoder takes the server role: client frames must carry a mask.
/// Fragmentation is not supported, so a continuation opcode is an error.
pub struct MessageDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes_decoded(&self) -> usize {
        self.pos
    }

    pub fn decode_next(&mut self) -> Result<Option<Message>, FrameError> {
        let buf = &self.buf[self.pos..];

        let fi = match read_header(buf)? {
            Some(fi) => fi,
            None => return Ok(None),
        };

        if fi.payload_size > MESSAGE_SIZE_MAX {
            return Err(FrameError::MessageTooLarge(fi.payload_size));
        }

        let mask = match fi.mask {
            Some(mask) => mask,
            None => return Err(FrameError::UnmaskedFrame),
        };

        let end = fi.payload_offset + fi.payload_size;
        if buf.len() < end {
            return Ok(None);
        }

        let mut payload = buf[fi.payload_offset..end].to_vec();
        apply_mask(&mut payload, mask, 0);

        let msg = match fi.opcode {
            OPCODE_TEXT => Message::Text(payload),
            OPCODE_BINARY => Message::Binary(payload),
            OPCODE_PING => Message::Ping(payload),
            OPCODE_PONG => Message::Pong(payload),
            OPCODE_CLOSE => Message::Close,
            opcode => return Err(FrameError::UnsupportedOpcode(opcode)),
        };

        self.pos += end;

        Ok(Some(msg))
    }
}

/// Hixie-76 key derivation: the digits of the header value concatenated,
/// divided by the number of spaces. No spaces yields zero.
pub fn parse_hixie_key(value: &str) -> u32 {
    let mut key_number: u32 = 0;
    let mut num_spaces: u32 = 0;

    for c in value.bytes() {
        if c.is_ascii_digit() {
            key_number = key_number
                .wrapping_mul(10)
                .wrapping_add((c - b'0') as u32);
        } else if c == b' ' {
            num_spaces += 1;
        }
    }

    if num_spaces > 0 {
        key_number / num_spaces
    } else {
        0
    }
}

/// Hixie-76 handshake digest: MD5 over the two derived keys in network byte
/// order followed by the 8 challenge bytes sent after the headers.
pub fn hixie_digest(key1: u32, key2: u32, key3: &[u8; 8]) -> [u8; 16] {
    let mut input = [0; 16];
    input[..4].copy_from_slice(&key1.to_be_bytes());
    input[4..8].copy_from_slice(&key2.to_be_bytes());
    input[8..].copy_from_slice(key3);

    let mut hasher = Md5::new();
    hasher.update(input);
    let digest = hasher.finalize();

    let mut out = [0; 16];
    out.copy_from_slice(&digest);
    out
}

/// RFC 6455 accept key: `base64(sha1(key + WS_GUID))`.
pub fn calculate_accept_key(key: &[u8]) -> Result<ArrayString<WS_ACCEPT_MAX>, ()> {
    let input_len = key.len() + WS_GUID.len();

    if input_len > WS_HASH_INPUT_MAX {
        return Err(());
    }

    let mut input = [0; WS_HASH_INPUT_MAX];

    input[..key.len()].copy_from_slice(key);
    input[key.len()..input_len].copy_from_slice(WS_GUID.as_bytes());

    let input = &input[..input_len];

    let mut hasher = Sha1::new();
    hasher.update(input);
    let digest = hasher.finalize();

    let mut output = [0; WS_ACCEPT_MAX];

    let size = base64::encode_config_slice(&digest, base64::STANDARD, &mut output);

    let output = match str::from_utf8(&output[..size]) {
        Ok(s) => s,
        Err(_) => return Err(()),
    };

    Ok(ArrayString::from_str(output).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(header_size(0, false), 2);
        assert_eq!(header_size(125, false), 2);
        assert_eq!(header_size(125, true), 6);

        assert_eq!(header_size(126, false), 4);
        assert_eq!(header_size(65535, false), 4);
        assert_eq!(header_size(65535, true), 8);

        assert_eq!(header_size(65536, false), 10);
        assert_eq!(header_size(65536, true), HEADER_SIZE_MAX);
    }

    #[test]
    fn test_read_write_header() {
        let buf = [
            0x81, 0x85, 0x01, 0x02, 0x03, 0x04, 0x69, 0x67, 0x6f, 0x68, 0x6e,
        ];

        let fi = read_header(&buf).unwrap().unwrap();
        assert_eq!(fi.fin, true);
        assert_eq!(fi.opcode, OPCODE_TEXT);
        assert_eq!(fi.mask, Some([0x01, 0x02, 0x03, 0x04]));
        assert_eq!(fi.payload_offset, 6);
        assert_eq!(fi.payload_size, 5);

        let payload = b"hello";
        let mut buf2 = vec![0; header_size(payload.len(), true) + payload.len()];
        let offset = write_header(
            true,
            OPCODE_TEXT,
            payload.len(),
            Some([0x01, 0x02, 0x03, 0x04]),
            &mut buf2,
        )
        .unwrap();

        assert_eq!(offset, 6);

        let mut masked = *payload;
        apply_mask(&mut masked, [0x01, 0x02, 0x03, 0x04], 0);
        buf2[offset..].copy_from_slice(&masked);
        assert_eq!(buf2, buf);
    }

    #[test]
    fn test_read_header_incomplete() {
        assert!(read_header(&[0x81]).unwrap().is_none());
        assert!(read_header(&[0x81, 0xfe, 0x01]).unwrap().is_none());
        assert!(read_header(&[0x81, 0xff, 0, 0, 0, 0]).unwrap().is_none());
        assert!(read_header(&[0x81, 0x85, 0x01, 0x02]).unwrap().is_none());
    }

    #[test]
    fn test_read_header_reserved_bits() {
        let r = read_header(&[0xc1, 0x85]);
        assert_eq!(r.unwrap_err(), FrameError::ReservedBits);
    }

    #[test]
    fn test_apply_mask() {
        let mut buf = [b'a', b'b', b'c', b'd', b'e'];
        apply_mask(&mut buf, [0x01, 0x02, 0x03, 0x04], 0);
        assert_eq!(buf, [0x60, 0x60, 0x60, 0x60, 0x64]);
    }

    #[test]
    fn test_decode_text() {
        // masked "Hello"
        let data = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];

        let mut d = MessageDecoder::new(&data);

        let msg = d.decode_next().unwrap().unwrap();
        assert_eq!(msg, Message::Text(b"Hello".to_vec()));
        assert_eq!(d.bytes_decoded(), data.len());

        let msg = d.decode_next().unwrap();
        assert!(msg.is_none());
        assert_eq!(d.bytes_decoded(), data.len());
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let data = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f];

        let mut d = MessageDecoder::new(&data);

        let msg = d.decode_next().unwrap();
        assert!(msg.is_none());
        assert_eq!(d.bytes_decoded(), 0);
    }

    #[test]
    fn test_decode_unmasked_is_error() {
        let data = [0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f];

        let mut d = MessageDecoder::new(&data);

        assert_eq!(d.decode_next().unwrap_err(), FrameError::UnmaskedFrame);
    }

    #[test]
    fn test_decode_continuation_is_error() {
        let data = [0x80, 0x82, 0x01, 0x02, 0x03, 0x04, 0x60, 0x60];

        let mut d = MessageDecoder::new(&data);

        assert_eq!(
            d.decode_next().unwrap_err(),
            FrameError::UnsupportedOpcode(OPCODE_CONTINUATION)
        );
    }

    #[test]
    fn test_decode_oversized() {
        let mut data = vec![0x81, 0xfe];
        data.extend_from_slice(&((MESSAGE_SIZE_MAX + 1) as u16).to_be_bytes());
        data.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);

        let mut d = MessageDecoder::new(&data);

        assert_eq!(
            d.decode_next().unwrap_err(),
            FrameError::MessageTooLarge(MESSAGE_SIZE_MAX + 1)
        );
    }

    #[test]
    fn test_decode_control_frames() {
        // masked ping "ab", then masked close
        let data = [
            0x89, 0x82, 0x01, 0x02, 0x03, 0x04, 0x60, 0x60, //
            0x88, 0x80, 0x01, 0x02, 0x03, 0x04,
        ];

        let mut d = MessageDecoder::new(&data);

        let msg = d.decode_next().unwrap().unwrap();
        assert_eq!(msg, Message::Ping(b"ab".to_vec()));
        assert_eq!(d.bytes_decoded(), 8);

        let msg = d.decode_next().unwrap().unwrap();
        assert_eq!(msg, Message::Close);
        assert_eq!(d.bytes_decoded(), data.len());
    }

    #[test]
    fn test_write_frame() {
        let mut out = Vec::new();
        write_frame(&mut out, OPCODE_TEXT, b"hello").unwrap();
        assert_eq!(out, b"\x81\x05hello");

        let payload = vec![b'x'; 300];
        let mut out = Vec::new();
        write_frame(&mut out, OPCODE_BINARY, &payload).unwrap();
        assert_eq!(out[0], 0x82);
        assert_eq!(out[1], 126);
        assert_eq!(&out[2..4], &300u16.to_be_bytes());
        assert_eq!(out.len(), 4 + 300);

        // 8-byte length encoding, header only
        let mut header = [0; HEADER_SIZE_MAX];
        let size = write_header(true, OPCODE_BINARY, 65536, None, &mut header).unwrap();
        assert_eq!(size, 10);
        assert_eq!(header[1], 127);
        assert_eq!(&header[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn test_parse_hixie_key() {
        // the two sample keys from the hixie-76 draft
        assert_eq!(parse_hixie_key("4 @1  46546xW%0l 1 5"), 829309203);
        assert_eq!(parse_hixie_key("12998 5 Y3 1  .P00"), 259970620);

        // no spaces yields zero
        assert_eq!(parse_hixie_key("12345"), 0);
        assert_eq!(parse_hixie_key(""), 0);
    }

    #[test]
    fn test_hixie_digest() {
        // the worked handshake example from the hixie-76 draft
        let d = hixie_digest(829309203, 259970620, b"^n:ds[4U");
        assert_eq!(&d, b"8jKS'y:G*Co,Wxa-");
    }

    #[test]
    fn test_calculate_accept_key() {
        let key = calculate_accept_key(b"dGhlIHNhbXBsZSBub25jZQ==").unwrap();
        assert_eq!(key.as_str(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
