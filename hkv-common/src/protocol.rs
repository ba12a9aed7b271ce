//! # Wire Protocol
//!
//! A minimal Memcached-style ASCII protocol: a header line naming a command
//! and its key (plus a declared byte length for commands that carry a
//! value), followed by that many argument bytes and a trailing CRLF.
//!
//! ## Design Principles
//! 1. **Header/argument split**: the parser only ever looks at complete
//!    lines; the caller (the connection state machine) is responsible for
//!    accumulating the declared argument bytes separately. This keeps the
//!    parser itself allocation-free and trivially restartable.
//! 2. **Never guess at intent on malformed input**: a bad header produces a
//!    `ProtocolError`, not a panic or a best-effort command.
//! 3. **Storage-agnostic dispatch**: `dispatch` takes `&dyn Storage`, so the
//!    same command set drives either a bare `LruShard` or a `StripedCache`.

use std::fmt;

use crate::error::HkvError;

/// Maximum key length, matching real Memcached's 250-byte key ceiling.
pub const MAX_KEY_LEN: usize = 250;

/// Storage operations a parsed command may invoke.
///
/// Implemented by both the single-shard LRU and the striped cache so command
/// dispatch never needs to know which variant backs the server.
pub trait Storage: Send + Sync {
    /// Inserts or replaces `key`; evicts to make room. `false` only on
    /// oversized-entry rejection.
    fn put(&self, key: &[u8], value: &[u8]) -> bool;
    /// Inserts only if `key` is absent.
    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool;
    /// Replaces only if `key` is already present.
    fn set(&self, key: &[u8], value: &[u8]) -> bool;
    /// Removes `key`; `false` if it was absent.
    fn delete(&self, key: &[u8]) -> bool;
    /// Looks up `key`, promoting it to most-recently-used on a hit.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// A recognized header, prior to the argument bytes (if any) arriving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandHeader {
    Get { key: Vec<u8> },
    Set { key: Vec<u8>, len: usize },
    Add { key: Vec<u8>, len: usize },
    Replace { key: Vec<u8>, len: usize },
    Delete { key: Vec<u8> },
    Version,
}

impl CommandHeader {
    /// Argument bytes this header declares, `0` for headers with no value.
    pub fn arg_len(&self) -> usize {
        match self {
            CommandHeader::Set { len, .. }
            | CommandHeader::Add { len, .. }
            | CommandHeader::Replace { len, .. } => *len,
            CommandHeader::Get { .. } | CommandHeader::Delete { .. } | CommandHeader::Version => 0,
        }
    }
}

/// Result of feeding bytes to the parser.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// No complete header line yet; wait for more bytes.
    Incomplete,
    /// A header was recognized; `header_len` bytes (including the CRLF) were
    /// consumed from the front of the buffer.
    Consumed {
        header_len: usize,
        header: CommandHeader,
    },
    /// The line was malformed. `header_len` still counts the bytes up to and
    /// including the newline, so the caller can always resynchronize by
    /// discarding exactly that many bytes — a bad line never strands the
    /// parser mid-stream.
    Error { header_len: usize, error: ProtocolError },
}

/// Malformed-input reasons, rendered back to the client as `ERROR`/`CLIENT_ERROR` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    UnknownCommand,
    MissingKey,
    KeyTooLong,
    BadLength,
    WrongArgCount,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownCommand => write!(f, "unknown command"),
            ProtocolError::MissingKey => write!(f, "missing key"),
            ProtocolError::KeyTooLong => write!(f, "key too long"),
            ProtocolError::BadLength => write!(f, "bad data chunk length"),
            ProtocolError::WrongArgCount => write!(f, "wrong number of arguments"),
        }
    }
}

impl From<ProtocolError> for HkvError {
    fn from(err: ProtocolError) -> Self {
        HkvError::Protocol(err.to_string())
    }
}

/// Stateless header parser. The connection owns the byte buffer; the parser
/// only ever inspects the prefix it is handed and reports how much of it was
/// consumed, matching the external-parser contract the connection relies on.
#[derive(Debug, Default)]
pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Parser
    }

    /// Looks for one complete `\r\n`-terminated header line in `buf` and, if
    /// found, parses it. Returns `Incomplete` if no line terminator is
    /// present yet.
    pub fn feed(&mut self, buf: &[u8]) -> ParseOutcome {
        let newline = match buf.iter().position(|&b| b == b'\n') {
            Some(idx) => idx,
            None => return ParseOutcome::Incomplete,
        };

        let header_len = newline + 1;
        let mut line_end = newline;
        if line_end > 0 && buf[line_end - 1] == b'\r' {
            line_end -= 1;
        }
        let line = &buf[..line_end];

        match parse_header(line) {
            Ok(header) => ParseOutcome::Consumed { header_len, header },
            Err(error) => ParseOutcome::Error { header_len, error },
        }
    }
}

fn parse_header(line: &[u8]) -> Result<CommandHeader, ProtocolError> {
    let mut tokens = line
        .split(|&b| b == b' ')
        .filter(|tok| !tok.is_empty());

    let cmd = tokens.next().ok_or(ProtocolError::UnknownCommand)?;

    if eq_ignore_ascii_case(cmd, b"version") {
        if tokens.next().is_some() {
            return Err(ProtocolError::WrongArgCount);
        }
        return Ok(CommandHeader::Version);
    }

    if eq_ignore_ascii_case(cmd, b"get") {
        let key = take_key(&mut tokens)?;
        if tokens.next().is_some() {
            return Err(ProtocolError::WrongArgCount);
        }
        return Ok(CommandHeader::Get { key });
    }

    if eq_ignore_ascii_case(cmd, b"delete") {
        let key = take_key(&mut tokens)?;
        if tokens.next().is_some() {
            return Err(ProtocolError::WrongArgCount);
        }
        return Ok(CommandHeader::Delete { key });
    }

    let make_with_len: Option<fn(Vec<u8>, usize) -> CommandHeader> = if eq_ignore_ascii_case(cmd, b"set") {
        Some(|key, len| CommandHeader::Set { key, len })
    } else if eq_ignore_ascii_case(cmd, b"add") {
        Some(|key, len| CommandHeader::Add { key, len })
    } else if eq_ignore_ascii_case(cmd, b"replace") {
        Some(|key, len| CommandHeader::Replace { key, len })
    } else {
        None
    };

    if let Some(make) = make_with_len {
        let key = take_key(&mut tokens)?;
        let len_tok = tokens.next().ok_or(ProtocolError::WrongArgCount)?;
        let len = parse_usize(len_tok).ok_or(ProtocolError::BadLength)?;
        if tokens.next().is_some() {
            return Err(ProtocolError::WrongArgCount);
        }
        return Ok(make(key, len));
    }

    Err(ProtocolError::UnknownCommand)
}

fn take_key<'a, I: Iterator<Item = &'a [u8]>>(tokens: &mut I) -> Result<Vec<u8>, ProtocolError> {
    let key = tokens.next().ok_or(ProtocolError::MissingKey)?;
    if key.is_empty() {
        return Err(ProtocolError::MissingKey);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ProtocolError::KeyTooLong);
    }
    Ok(key.to_vec())
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

fn eq_ignore_ascii_case(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Executes a parsed command against `storage` and renders the Memcached-style
/// response line (including its trailing CRLF).
pub fn dispatch(header: &CommandHeader, arg: &[u8], storage: &dyn Storage) -> Vec<u8> {
    match header {
        CommandHeader::Get { key } => match storage.get(key) {
            Some(value) => {
                let mut out = Vec::with_capacity(key.len() + value.len() + 32);
                out.extend_from_slice(b"VALUE ");
                out.extend_from_slice(key);
                out.extend_from_slice(b" 0 ");
                out.extend_from_slice(value.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(&value);
                out.extend_from_slice(b"\r\nEND\r\n");
                out
            }
            None => b"END\r\n".to_vec(),
        },
        CommandHeader::Set { key, .. } => {
            if storage.put(key, arg) {
                b"STORED\r\n".to_vec()
            } else {
                b"SERVER_ERROR object too large for cache\r\n".to_vec()
            }
        }
        CommandHeader::Add { key, .. } => {
            if storage.put_if_absent(key, arg) {
                b"STORED\r\n".to_vec()
            } else {
                b"NOT_STORED\r\n".to_vec()
            }
        }
        CommandHeader::Replace { key, .. } => {
            if storage.set(key, arg) {
                b"STORED\r\n".to_vec()
            } else {
                b"NOT_STORED\r\n".to_vec()
            }
        }
        CommandHeader::Delete { key } => {
            if storage.delete(key) {
                b"DELETED\r\n".to_vec()
            } else {
                b"NOT_FOUND\r\n".to_vec()
            }
        }
        CommandHeader::Version => {
            let mut out = Vec::with_capacity(32);
            out.extend_from_slice(b"VERSION hkv-");
            out.extend_from_slice(env!("CARGO_PKG_VERSION").as_bytes());
            out.extend_from_slice(b"\r\n");
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeStorage {
        map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    }

    impl Storage for FakeStorage {
        fn put(&self, key: &[u8], value: &[u8]) -> bool {
            self.map.lock().unwrap().insert(key.to_vec(), value.to_vec());
            true
        }
        fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool {
            let mut map = self.map.lock().unwrap();
            if map.contains_key(key) {
                false
            } else {
                map.insert(key.to_vec(), value.to_vec());
                true
            }
        }
        fn set(&self, key: &[u8], value: &[u8]) -> bool {
            let mut map = self.map.lock().unwrap();
            if map.contains_key(key) {
                map.insert(key.to_vec(), value.to_vec());
                true
            } else {
                false
            }
        }
        fn delete(&self, key: &[u8]) -> bool {
            self.map.lock().unwrap().remove(key).is_some()
        }
        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.map.lock().unwrap().get(key).cloned()
        }
    }

    #[test]
    fn parses_get_header() {
        let mut parser = Parser::new();
        let outcome = parser.feed(b"get a\r\nrest");
        match outcome {
            ParseOutcome::Consumed { header_len, header } => {
                assert_eq!(header_len, 7);
                assert_eq!(header, CommandHeader::Get { key: b"a".to_vec() });
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn incomplete_without_newline() {
        let mut parser = Parser::new();
        assert_eq!(parser.feed(b"get a"), ParseOutcome::Incomplete);
    }

    #[test]
    fn rejects_unknown_command() {
        let mut parser = Parser::new();
        assert_eq!(
            parser.feed(b"frobnicate a\r\n"),
            ParseOutcome::Error {
                header_len: 14,
                error: ProtocolError::UnknownCommand,
            }
        );
    }

    #[test]
    fn set_then_get_roundtrip() {
        let storage = FakeStorage {
            map: Mutex::new(HashMap::new()),
        };
        let set = CommandHeader::Set { key: b"a".to_vec(), len: 1 };
        assert_eq!(dispatch(&set, b"1", &storage), b"STORED\r\n".to_vec());

        let get = CommandHeader::Get { key: b"a".to_vec() };
        assert_eq!(dispatch(&get, b"", &storage), b"VALUE a 0 1\r\n1\r\nEND\r\n".to_vec());
    }

    #[test]
    fn get_missing_key_returns_end() {
        let storage = FakeStorage {
            map: Mutex::new(HashMap::new()),
        };
        let get = CommandHeader::Get { key: b"missing".to_vec() };
        assert_eq!(dispatch(&get, b"", &storage), b"END\r\n".to_vec());
    }
}
