//! # Memcached-ASCII Wire Codec
//!
//! Purpose: encode the same header/argument/CRLF request shape
//! `hkv-common::protocol` parses, and decode the response lines
//! `hkv-common::protocol::dispatch` writes, so the client and the server
//! agree on the wire without sharing a dependency on either's internals.
//!
//! ## Design Principles
//! 1. **Binary-safe values**: a `VALUE` reply's payload is read by declared
//!    length, never by scanning for a terminator, so values may contain any
//!    byte including `\r\n`.
//! 2. **Buffer reuse**: callers supply the line buffer so a long-lived
//!    connection performs no per-request header allocation.
//! 3. **Fail fast**: any reply that doesn't match one of the fixed response
//!    words is a protocol error, never a best-effort guess.

use std::io::BufRead;

use crate::client::{ClientError, ClientResult};

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Stored,
    NotStored,
    Deleted,
    NotFound,
    /// `get` hit: the value bytes (already stripped of the trailing CRLF and
    /// the `END` terminator line).
    Value(Vec<u8>),
    /// `get` miss.
    End,
    Version(Vec<u8>),
    ClientError(Vec<u8>),
    ServerError(Vec<u8>),
}

/// Encodes `get <key>\r\n`.
pub fn encode_get(key: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(b"get ");
    out.extend_from_slice(key);
    out.extend_from_slice(b"\r\n");
}

/// Encodes `delete <key>\r\n`.
pub fn encode_delete(key: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(b"delete ");
    out.extend_from_slice(key);
    out.extend_from_slice(b"\r\n");
}

/// Encodes `version\r\n`.
pub fn encode_version(out: &mut Vec<u8>) {
    out.extend_from_slice(b"version\r\n");
}

/// Encodes a header-plus-argument command: `<cmd> <key> <len>\r\n<value>\r\n`.
pub fn encode_with_value(cmd: &str, key: &[u8], value: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(cmd.as_bytes());
    out.push(b' ');
    out.extend_from_slice(key);
    out.push(b' ');
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

/// Reads and parses exactly one reply from `reader`, consuming the `VALUE`
/// payload and its `END` terminator inline when present.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<Response> {
    read_line(reader, line_buf)?;

    if line_buf == b"STORED" {
        return Ok(Response::Stored);
    }
    if line_buf == b"NOT_STORED" {
        return Ok(Response::NotStored);
    }
    if line_buf == b"DELETED" {
        return Ok(Response::Deleted);
    }
    if line_buf == b"NOT_FOUND" {
        return Ok(Response::NotFound);
    }
    if line_buf == b"END" {
        return Ok(Response::End);
    }
    if let Some(rest) = strip_prefix(line_buf, b"VERSION ") {
        return Ok(Response::Version(rest.to_vec()));
    }
    if let Some(rest) = strip_prefix(line_buf, b"CLIENT_ERROR ") {
        return Ok(Response::ClientError(rest.to_vec()));
    }
    if let Some(rest) = strip_prefix(line_buf, b"SERVER_ERROR ") {
        return Ok(Response::ServerError(rest.to_vec()));
    }
    if let Some(rest) = strip_prefix(line_buf, b"VALUE ") {
        return read_value_body(reader, rest, line_buf);
    }

    Err(ClientError::Protocol)
}

fn read_value_body<R: BufRead>(
    reader: &mut R,
    header_rest: &[u8],
    line_buf: &mut Vec<u8>,
) -> ClientResult<Response> {
    // `<key> <flags> <len>` — only the length is needed, the rest is
    // positional and must simply be present.
    let mut fields = header_rest.split(|&b| b == b' ').filter(|tok| !tok.is_empty());
    let _key = fields.next().ok_or(ClientError::Protocol)?;
    let _flags = fields.next().ok_or(ClientError::Protocol)?;
    let len_tok = fields.next().ok_or(ClientError::Protocol)?;
    let len = parse_usize(len_tok).ok_or(ClientError::Protocol)?;

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != *b"\r\n" {
        return Err(ClientError::Protocol);
    }

    read_line(reader, line_buf)?;
    if line_buf != b"END" {
        return Err(ClientError::Protocol);
    }

    Ok(Response::Value(data))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ClientError::Protocol);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn strip_prefix<'a>(line: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn parse_usize(data: &[u8]) -> Option<usize> {
    if data.is_empty() {
        return None;
    }
    let mut value: usize = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encodes_get() {
        let mut buf = Vec::new();
        encode_get(b"k", &mut buf);
        assert_eq!(buf, b"get k\r\n");
    }

    #[test]
    fn encodes_set_style_command() {
        let mut buf = Vec::new();
        encode_with_value("set", b"k", b"value", &mut buf);
        assert_eq!(buf, b"set k 5\r\nvalue\r\n");
    }

    #[test]
    fn parses_stored() {
        let mut reader = Cursor::new(b"STORED\r\n".to_vec());
        let mut line = Vec::new();
        assert_eq!(read_response(&mut reader, &mut line).unwrap(), Response::Stored);
    }

    #[test]
    fn parses_value_hit() {
        let mut reader = Cursor::new(b"VALUE k 0 5\r\nhello\r\nEND\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, Response::Value(b"hello".to_vec()));
    }

    #[test]
    fn parses_get_miss() {
        let mut reader = Cursor::new(b"END\r\n".to_vec());
        let mut line = Vec::new();
        assert_eq!(read_response(&mut reader, &mut line).unwrap(), Response::End);
    }

    #[test]
    fn parses_version() {
        let mut reader = Cursor::new(b"VERSION hkv-0.1.0\r\n".to_vec());
        let mut line = Vec::new();
        assert_eq!(
            read_response(&mut reader, &mut line).unwrap(),
            Response::Version(b"hkv-0.1.0".to_vec())
        );
    }

    #[test]
    fn value_with_embedded_crlf_is_read_by_length() {
        let mut reader = Cursor::new(b"VALUE k 0 6\r\na\r\nb\r\r\nEND\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, Response::Value(b"a\r\nb\r".to_vec()));
    }
}
