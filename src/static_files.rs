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

use std::time::SystemTime;
use time::macros::format_description;
use time::OffsetDateTime;

fn ext(path: &str) -> &str {
    match path.rfind('.') {
        Some(pos) => &path[(pos + 1)..],
        None => "",
    }
}

pub fn content_type(path: &str) -> &'static str {
    match ext(path) {
        "txt" => "text/plain",
        "css" => "text/css",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "xml" => "text/xml",
        // application/javascript per RFC 4329, but older IE chokes on it
        "js" => "text/javascript",
        "xhtml" => "application/xhtml+xml",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gif" => "image/gif",
        "jpeg" | "jpg" => "image/jpeg",
        "tiff" | "tif" => "image/tiff",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "swf" => "application/x-shockwave-flash",
        "mp3" => "audio/mpeg",
        "wav" => "audio/x-wav",
        "ttf" => "font/ttf",
        _ => "text/html",
    }
}

// Cache headers are only offered for resources that require caching for
// browser playback support. Everything else is served no-store to avoid
// stale-reload headaches during development.
pub fn is_cacheable(path: &str) -> bool {
    matches!(ext(path), "mp3" | "wav")
}

/// One requested byte range, inclusive on both ends.
///
/// A suffix request like `bytes=-500` is represented with a negative start
/// and normalized against the file size before use.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Range {
    pub start: i64,
    pub end: i64,
}

impl Range {
    pub fn length(&self) -> u64 {
        (self.end - self.start + 1) as u64
    }
}

fn parse_range(s: &str) -> Option<Range> {
    let s = s.trim();
    let minus_pos = s.find('-')?;

    if minus_pos == 0 {
        // "-500" means the last 500 bytes of the file
        let start: i64 = s.parse().ok()?;
        Some(Range {
            start,
            end: i64::MAX,
        })
    } else {
        let start: i64 = s[..minus_pos].trim().parse().ok()?;
        let end = if minus_pos == s.len() - 1 {
            i64::MAX
        } else {
            s[(minus_pos + 1)..].trim().parse().ok()?
        };
        Some(Range { start, end })
    }
}

/// Parses a `Range` header value: `bytes=<range>(,<range>)*`. Returns `None`
/// on any malformed component.
pub fn parse_ranges(header: &str) -> Option<Vec<Range>> {
    let spec = header.strip_prefix("bytes=")?;

    let mut ranges = Vec::new();

    for part in spec.split(',') {
        ranges.push(parse_range(part)?);
    }

    if ranges.is_empty() {
        None
    } else {
        Some(ranges)
    }
}

/// Resolves a parsed range against the actual file size: suffix starts are
/// rebased from the end of the file, and both ends are clamped to the last
/// byte.
pub fn normalize_range(range: Range, file_size: i64) -> Range {
    let mut range = range;

    if range.start < 0 {
        range.start += file_size;
    }
    if range.start >= file_size {
        range.start = file_size - 1;
    }
    if range.end >= file_size {
        range.end = file_size - 1;
    }

    range
}

/// Formats a timestamp the way HTTP wants it: `Wed, 20 Apr 2011 17:31:28 GMT`.
pub fn webtime(t: SystemTime) -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] \
         [hour]:[minute]:[second] GMT"
    );

    OffsetDateTime::from(t)
        .format(&format)
        .expect("failed to format http date")
}

pub fn now() -> String {
    webtime(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("/index.html"), "text/html");
        assert_eq!(content_type("/a/b/style.css"), "text/css");
        assert_eq!(content_type("/script.js"), "text/javascript");
        assert_eq!(content_type("/data.json"), "application/json");
        assert_eq!(content_type("/pic.jpg"), "image/jpeg");
        assert_eq!(content_type("/song.mp3"), "audio/mpeg");

        // unknown and missing extensions fall back to html
        assert_eq!(content_type("/strange.qqq"), "text/html");
        assert_eq!(content_type("/noext"), "text/html");
    }

    #[test]
    fn test_is_cacheable() {
        assert!(is_cacheable("/song.mp3"));
        assert!(is_cacheable("/clip.wav"));
        assert!(!is_cacheable("/index.html"));
        assert!(!is_cacheable("/pic.png"));
    }

    #[test]
    fn test_parse_ranges() {
        assert_eq!(
            parse_ranges("bytes=0-499"),
            Some(vec![Range { start: 0, end: 499 }])
        );
        assert_eq!(
            parse_ranges("bytes=500-"),
            Some(vec![Range {
                start: 500,
                end: i64::MAX,
            }])
        );
        assert_eq!(
            parse_ranges("bytes=-500"),
            Some(vec![Range {
                start: -500,
                end: i64::MAX,
            }])
        );
        assert_eq!(
            parse_ranges("bytes=0-0,-1"),
            Some(vec![
                Range { start: 0, end: 0 },
                Range {
                    start: -1,
                    end: i64::MAX,
                },
            ])
        );

        assert_eq!(parse_ranges("bytes="), None);
        assert_eq!(parse_ranges("bytes=elephant"), None);
        assert_eq!(parse_ranges("lines=0-4"), None);
        assert_eq!(parse_ranges(""), None);
    }

    #[test]
    fn test_normalize_range() {
        // plain range inside the file
        let r = normalize_range(Range { start: 1, end: 3 }, 5);
        assert_eq!(r, Range { start: 1, end: 3 });
        assert_eq!(r.length(), 3);

        // open end clamps to the last byte
        let r = normalize_range(
            Range {
                start: 2,
                end: i64::MAX,
            },
            5,
        );
        assert_eq!(r, Range { start: 2, end: 4 });

        // suffix start is rebased from the end
        let r = normalize_range(
            Range {
                start: -2,
                end: i64::MAX,
            },
            5,
        );
        assert_eq!(r, Range { start: 3, end: 4 });
        assert_eq!(r.length(), 2);

        // start past the end clamps to the last byte
        let r = normalize_range(Range { start: 9, end: 12 }, 5);
        assert_eq!(r, Range { start: 4, end: 4 });
    }

    #[test]
    fn test_webtime() {
        // 2011-04-20 17:31:28 UTC
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1303320688);
        assert_eq!(webtime(t), "Wed, 20 Apr 2011 17:31:28 GMT");
    }
}
