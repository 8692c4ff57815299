//! `multipart/x-mixed-replace` framing for MJPEG streams.
//!
//! Each part on the wire looks like:
//!
//! ```text
//! --<boundary>\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <len>\r\n
//! \r\n
//! <len bytes of JPEG>\r\n
//! ```

use bytes::{Bytes, BytesMut};
use tracing::debug;

const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_HEADER_BYTES: usize = 8 * 1024;
pub const MAX_PART_BYTES: usize = 16 * 1024 * 1024;

/// Value of the `Content-Type` header for a stream using `boundary`.
pub fn content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={boundary}")
}

/// Headers that precede a JPEG part of `len` bytes.
pub fn part_header(boundary: &str, len: usize) -> String {
    format!("--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n")
}

/// Extract the boundary parameter from a multipart `Content-Type` value.
pub fn boundary_from_content_type(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then_some(value)
        } else {
            None
        }
    })
}

/// RFC 2046 boundary: 1 to 70 characters from a restricted set, not ending in a space.
pub fn is_valid_boundary(boundary: &str) -> bool {
    const SPECIALS: &str = "'()+_,-./:=? ";
    !boundary.is_empty()
        && boundary.len() <= 70
        && !boundary.ends_with(' ')
        && boundary
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || SPECIALS.contains(c))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MultipartError {
    #[error("invalid Content-Length header: {0:?}")]
    BadContentLength(String),
    #[error("part of {len} bytes exceeds limit of {max}")]
    PartTooLarge { len: usize, max: usize },
    #[error("part headers exceed {0} bytes")]
    HeadersTooLarge(usize),
}

/// Parse state for the multipart stream.
#[derive(Clone, Copy)]
enum ParseState {
    /// Looking for the `--boundary` delimiter.
    SeekingBoundary,
    /// Found a delimiter, now looking for the end of the part headers.
    SeekingHeaderEnd,
    /// Collecting exactly `len` payload bytes.
    Sized { len: usize },
    /// No Content-Length: collecting until the next delimiter. `scanned` avoids
    /// re-searching bytes already known not to contain it.
    Unsized { scanned: usize },
}

/// Incremental parser that turns an MJPEG byte stream into JPEG payloads.
///
/// Feed arbitrary chunks with [`push`](Self::push) and drain complete parts
/// with [`next_part`](Self::next_part). Parts carrying a `Content-Length` are
/// cut by length, so payloads may contain the boundary text; parts without one
/// end at the next delimiter.
pub struct MultipartParser {
    delimiter: Vec<u8>,
    /// `\r\n--boundary`, which terminates an unsized part.
    terminator: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let delimiter = format!("--{boundary}").into_bytes();
        let terminator = [b"\r\n".as_slice(), &delimiter].concat();
        Self {
            delimiter,
            terminator,
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes received but not yet consumed by a complete part.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete payload, `Ok(None)` if more input is needed.
    ///
    /// After an error the parser resynchronises on the next delimiter, so the
    /// caller may keep calling it.
    pub fn next_part(&mut self) -> Result<Option<Bytes>, MultipartError> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.delimiter) {
                        let _ = self.buffer.split_to(pos + self.delimiter.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the delimiter spans chunks
                        let keep = self.delimiter.len().saturating_sub(1);
                        if self.buffer.len() > keep {
                            let _ = self.buffer.split_to(self.buffer.len() - keep);
                        }
                        return Ok(None);
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let Some(pos) = find_subsequence(&self.buffer, HEADER_END) else {
                        if self.buffer.len() > MAX_HEADER_BYTES {
                            self.state = ParseState::SeekingBoundary;
                            return Err(MultipartError::HeadersTooLarge(MAX_HEADER_BYTES));
                        }
                        return Ok(None);
                    };
                    let headers = self.buffer.split_to(pos + HEADER_END.len());
                    match content_length(&headers[..pos]) {
                        Ok(Some(len)) if len > MAX_PART_BYTES => {
                            self.state = ParseState::SeekingBoundary;
                            return Err(MultipartError::PartTooLarge {
                                len,
                                max: MAX_PART_BYTES,
                            });
                        }
                        Ok(Some(len)) => self.state = ParseState::Sized { len },
                        Ok(None) => self.state = ParseState::Unsized { scanned: 0 },
                        Err(e) => {
                            self.state = ParseState::SeekingBoundary;
                            return Err(e);
                        }
                    }
                }
                ParseState::Sized { len } => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(len).freeze();
                    // The trailing CRLF is skipped by the next delimiter search.
                    self.state = ParseState::SeekingBoundary;
                    return Ok(Some(payload));
                }
                ParseState::Unsized { scanned } => {
                    match find_subsequence(&self.buffer[scanned..], &self.terminator) {
                        Some(pos) => {
                            let payload = self.buffer.split_to(scanned + pos).freeze();
                            self.state = ParseState::SeekingBoundary;
                            debug!(bytes = payload.len(), "part without Content-Length");
                            return Ok(Some(payload));
                        }
                        None => {
                            if self.buffer.len() > MAX_PART_BYTES {
                                let len = self.buffer.len();
                                self.buffer.clear();
                                self.state = ParseState::SeekingBoundary;
                                return Err(MultipartError::PartTooLarge {
                                    len,
                                    max: MAX_PART_BYTES,
                                });
                            }
                            let keep = self.terminator.len().saturating_sub(1);
                            self.state = ParseState::Unsized {
                                scanned: self.buffer.len().saturating_sub(keep),
                            };
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }
}

fn content_length(headers: &[u8]) -> Result<Option<usize>, MultipartError> {
    let text = String::from_utf8_lossy(headers);
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map(Some)
                .map_err(|_| MultipartError::BadContentLength(value.to_string()));
        }
    }
    Ok(None)
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
