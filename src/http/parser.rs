//! Incremental parser for the one request shape the server accepts.
//!
//! The parser is a pure state machine: no I/O, no allocation. It consumes
//! whatever bytes the caller hands it, writes the request path and Host
//! header value into a caller-owned field buffer, and persists enough state
//! in itself to resume at any byte boundary, including mid-way through a
//! literal match.
//!
//! ## Field buffer layout
//!
//! The path is written forward from offset 0 and terminated with a NUL.
//! The host value's length is unknown until its CR arrives, so it is written
//! backwards from the tail of the buffer; the two fill cursors approaching
//! each other is the overflow check. On completion the reversed host span is
//! reversed back and moved to sit directly after the path's NUL, producing
//! `path \0 host [\0]` with no second allocation and no second pass over the
//! path. Rejecting NUL bytes in the request keeps the separator unambiguous.

/// The only accepted request line prefix, matched byte-for-byte.
const METHOD: &[u8] = b"GET ";

/// The one header of interest, matched case-sensitively.
const HOST_HEADER: &[u8] = b"Host: ";

/// Outcome of feeding bytes to the parser.
///
/// All variants except `NeedMoreData` are terminal; the parser must not be
/// fed again after reporting one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedResult {
    /// The path and host are packed in the field buffer, ready for response
    /// generation.
    Complete,
    /// The input ran out mid-request; feed more bytes when they arrive.
    NeedMoreData,
    /// The bytes do not form an acceptable request.
    Malformed,
    /// The combined path and host do not fit the field buffer.
    FieldsTooSmall,
}

/// Parser position, including the sub-index of any in-progress literal match
/// and the fill cursors of the two field regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Matching the method literal; `matched` bytes already compared.
    Method { matched: usize },
    /// Copying the path into the front of the field buffer.
    Path { len: usize },
    /// Discarding the rest of a line up to its CR.
    SkipLine,
    /// The byte after a CR must be LF.
    LineFeed,
    /// Matching the Host header literal at the start of a line.
    HeaderName { matched: usize },
    /// Copying the host value backwards from the buffer tail; `cursor` is
    /// the next write position.
    Host { cursor: usize },
}

/// Resumable request parser. One per connection, reset on slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestParser {
    state: State,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: State::Method { matched: 0 },
        }
    }

    /// Reset to the initial state for slot reuse.
    pub fn reset(&mut self) {
        self.state = State::Method { matched: 0 };
    }

    /// Advance the parse with newly received bytes.
    ///
    /// `fields` must be the same buffer across all calls for one request,
    /// zeroed before the first call, and at least 4 bytes long.
    pub fn feed(&mut self, input: &[u8], fields: &mut [u8]) -> FeedResult {
        let mut pos = 0;

        while pos < input.len() {
            let byte = input[pos];

            match self.state {
                State::Method { matched } => {
                    if byte != METHOD[matched] {
                        return FeedResult::Malformed;
                    }
                    pos += 1;
                    self.state = if matched + 1 == METHOD.len() {
                        State::Path { len: 0 }
                    } else {
                        State::Method {
                            matched: matched + 1,
                        }
                    };
                }
                State::Path { len } => match byte {
                    // NUL is reserved as the internal path/host separator.
                    0 => return FeedResult::Malformed,
                    b' ' => {
                        if len == 0 {
                            return FeedResult::Malformed;
                        }
                        fields[len] = 0;
                        self.state = State::SkipLine;
                        pos += 1;
                    }
                    _ => {
                        if len == 0 && byte != b'/' {
                            return FeedResult::Malformed;
                        }
                        // Keep room for the separator and at least one host byte.
                        if len == fields.len() - 2 {
                            return FeedResult::FieldsTooSmall;
                        }
                        fields[len] = byte;
                        self.state = State::Path { len: len + 1 };
                        pos += 1;
                    }
                },
                State::SkipLine => {
                    if byte == b'\r' {
                        self.state = State::LineFeed;
                    }
                    pos += 1;
                }
                State::LineFeed => {
                    if byte != b'\n' {
                        return FeedResult::Malformed;
                    }
                    self.state = State::HeaderName { matched: 0 };
                    pos += 1;
                }
                State::HeaderName { matched } => {
                    if byte == HOST_HEADER[matched] {
                        pos += 1;
                        self.state = if matched + 1 == HOST_HEADER.len() {
                            State::Host {
                                cursor: fields.len() - 1,
                            }
                        } else {
                            State::HeaderName {
                                matched: matched + 1,
                            }
                        };
                    } else if matched == HOST_HEADER.len() - 1 {
                        // The header name matched through the colon but the
                        // value separator is missing.
                        return FeedResult::Malformed;
                    } else {
                        // Some other header; skip the rest of its line.
                        self.state = State::SkipLine;
                        pos += 1;
                    }
                }
                State::Host { cursor } => {
                    if byte == b'\r' {
                        if cursor == fields.len() - 1 {
                            // Empty host value.
                            return FeedResult::Malformed;
                        }
                        finish_fields(fields, cursor + 1);
                        return FeedResult::Complete;
                    }
                    if byte == 0 {
                        return FeedResult::Malformed;
                    }
                    // The byte below the write position must still be NUL,
                    // otherwise the host has collided with the path.
                    if cursor == 0 || fields[cursor - 1] != 0 {
                        return FeedResult::FieldsTooSmall;
                    }
                    fields[cursor] = byte;
                    self.state = State::Host { cursor: cursor - 1 };
                    pos += 1;
                }
            }
        }

        FeedResult::NeedMoreData
    }
}

/// Put the tail-written host into its final position: reverse the span back
/// into forward order, move it to sit directly after the path's NUL, and
/// terminate it with a NUL if the buffer has room.
fn finish_fields(fields: &mut [u8], host_tail_start: usize) {
    let host_len = fields.len() - host_tail_start;
    fields[host_tail_start..].reverse();

    // The path state always writes its terminator before the host state is
    // reachable, so the first NUL is the separator.
    let mut sep = 0;
    while fields[sep] != 0 {
        sep += 1;
    }

    fields.copy_within(host_tail_start.., sep + 1);

    let end = sep + 1 + host_len;
    if end < fields.len() {
        fields[end] = 0;
    }
}

/// Split a packed field buffer into `(path, host)`.
///
/// Reads the path as the leading NUL-terminated run and the host as the
/// following run, which may extend to the end of the buffer. Returns `None`
/// if either is empty.
pub fn split_fields(fields: &[u8]) -> Option<(&[u8], &[u8])> {
    let sep = fields.iter().position(|&b| b == 0)?;
    if sep == 0 {
        return None;
    }
    let rest = &fields[sep + 1..];
    let host_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    if host_end == 0 {
        return None;
    }
    Some((&fields[..sep], &rest[..host_end]))
}
