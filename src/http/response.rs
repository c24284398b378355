//! Fixed-template response rendering.
//!
//! Responses are rebuilt into the worker's scratch buffer on every write
//! attempt; the packed fields persist on the connection, so the bytes are
//! identical across attempts and only the sent counter advances.

/// Everything before the Location value. The path keeps its leading slash,
/// so host and path concatenate with no join character.
const REDIRECT_HEAD: &[u8] = b"HTTP/1.1 301 Moved Permanently\r\nLocation: https://";

const REDIRECT_TAIL: &[u8] = b"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Response for requests whose path and host overflow the field buffer.
const TOO_LONG: &[u8] = b"HTTP/1.1 414 URI Too Long\r\nContent-Length: 45\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nThe combined URL host and path is too large!\n";

/// Serialize the redirect response for `path` and `host` into `out`.
///
/// Returns the response length, or 0 if `out` cannot hold it.
pub fn render_redirect(path: &[u8], host: &[u8], out: &mut [u8]) -> usize {
    let needed = REDIRECT_HEAD.len() + host.len() + path.len() + REDIRECT_TAIL.len();
    if out.len() < needed {
        return 0;
    }

    let mut cursor = 0;
    for part in [REDIRECT_HEAD, host, path, REDIRECT_TAIL] {
        out[cursor..cursor + part.len()].copy_from_slice(part);
        cursor += part.len();
    }

    cursor
}

/// Serialize the 414 response into `out`.
///
/// Returns the response length, or 0 if `out` cannot hold it.
pub fn render_too_long(out: &mut [u8]) -> usize {
    if out.len() < TOO_LONG.len() {
        return 0;
    }
    out[..TOO_LONG.len()].copy_from_slice(TOO_LONG);
    TOO_LONG.len()
}
