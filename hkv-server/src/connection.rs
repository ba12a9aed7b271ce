//! # Connection State Machine
//!
//! One `Connection` per accepted socket: a fixed input buffer, the header
//! parser's resumable state, and an output queue drained by vectored writes.
//! Nothing here blocks — `readable`/`writable` are called only when `mio`
//! reports the socket ready, and both return as soon as the kernel reports
//! `WouldBlock`, which is treated as a normal, expected loop exit rather than
//! an error in either reactor mode.
//!
//! ## Design Principles
//! 1. **Resumable parsing, not buffering whole requests**: a command header
//!    and its argument bytes may each arrive split across many `read` calls;
//!    `pending`/`arg_remains` carry the parser's place across them.
//! 2. **Edge-triggered means drain-to-`WouldBlock`**: both `readable` and
//!    `writable` loop until the kernel has nothing left to give or take,
//!    since another edge never fires just because bytes are still sitting
//!    there.
//! 3. **Backpressure by hysteresis**: read interest is dropped once the
//!    number of queued response frames crosses `hi` and is not restored
//!    until it falls back to `lo`, so one slow reader cannot make the
//!    server buffer unbounded responses in front of it.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};

use mio::net::TcpStream;

use hkv_common::{dispatch, CommandHeader, ParseOutcome, Parser, ProtocolError, Storage};

use crate::config::ReactorMode;

/// Input buffer size. A single header line or a single `set`/`add`/`replace`
/// value may still exceed this and is accumulated incrementally; only the
/// *unconsumed tail* of the socket's bytes needs to fit here at once.
const IN_BUF_CAP: usize = 4096;

/// Maximum `IoSlice` entries per `write_vectored` call.
const MAX_IOVECS: usize = 16;

fn protocol_error_response(error: &ProtocolError) -> Vec<u8> {
    format!("CLIENT_ERROR {error}\r\n").into_bytes()
}

/// Per-connection state. Not `Sync`; the reactor either owns all connections
/// on a single thread (single-threaded mode) or guards each one behind its
/// own mutex before handing it to a worker (multithreaded mode).
pub struct Connection {
    stream: TcpStream,
    in_buf: Box<[u8; IN_BUF_CAP]>,
    pos: usize,
    parser: Parser,
    pending: Option<CommandHeader>,
    arg_remains: usize,
    arg_buf: Vec<u8>,
    out_q: VecDeque<Vec<u8>>,
    out_off: usize,
    read_interest: bool,
    write_interest: bool,
    close_after_drain: bool,
    alive: bool,
    hi: usize,
    lo: usize,
    mode: ReactorMode,
}

impl Connection {
    pub fn new(stream: TcpStream, hi: usize, lo: usize, mode: ReactorMode) -> Self {
        Connection {
            stream,
            in_buf: Box::new([0u8; IN_BUF_CAP]),
            pos: 0,
            parser: Parser::new(),
            pending: None,
            arg_remains: 0,
            arg_buf: Vec::new(),
            out_q: VecDeque::new(),
            out_off: 0,
            read_interest: true,
            write_interest: false,
            close_after_drain: false,
            alive: true,
            hi,
            lo,
            mode,
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// The reactor's fourth entry point: an unrecoverable socket condition
    /// (kernel-reported error, or a hangup with nothing left to drain) that
    /// is not routed through `readable`/`writable` because no read or write
    /// was attempted. Kills the connection outright; a half-closed peer with
    /// still-queued output is drained instead, not hung up on.
    pub fn hangup(&mut self) {
        self.alive = false;
    }

    /// Read interest and write interest the reactor should register for this
    /// socket right now.
    pub fn interest(&self) -> Option<mio::Interest> {
        match (self.read_interest && !self.close_after_drain, self.write_interest) {
            (false, false) => None,
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (true, true) => Some(mio::Interest::READABLE.add(mio::Interest::WRITABLE)),
        }
    }

    /// Drains the socket until `WouldBlock`, feeding every complete command
    /// to `storage` and queuing its response. Returns `Ok(())` on a clean
    /// `WouldBlock` exit; an `Err` or EOF marks the connection for closing.
    pub fn readable(&mut self, storage: &dyn Storage) -> io::Result<()> {
        loop {
            if self.pos == IN_BUF_CAP {
                // Nothing was consumed last pass: a single header line or
                // declared-length argument does not fit in the buffer at all.
                self.enqueue(b"CLIENT_ERROR line too long\r\n".to_vec());
                self.close_after_drain = true;
                return Ok(());
            }

            match self.stream.read(&mut self.in_buf[self.pos..]) {
                Ok(0) => {
                    match self.mode {
                        // A shared connection may still have another worker
                        // draining queued output; let `writable` retire it
                        // once the queue empties instead of cutting it off
                        // here.
                        ReactorMode::Multithreaded => {
                            self.close_after_drain = true;
                            self.read_interest = false;
                        }
                        // Single-threaded mode never hands this connection to
                        // another worker, so there is no one left to drain
                        // queued output later; drop it immediately.
                        ReactorMode::SingleThreaded => {
                            self.alive = false;
                        }
                    }
                    return Ok(());
                }
                Ok(n) => {
                    self.pos += n;
                    self.process_buffer(storage);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes queued responses until `WouldBlock` or the queue drains. If the
    /// peer has already sent EOF and the queue empties here, the connection
    /// is retired.
    pub fn writable(&mut self) -> io::Result<()> {
        loop {
            if self.out_q.is_empty() {
                self.write_interest = false;
                if self.close_after_drain {
                    self.alive = false;
                }
                return Ok(());
            }

            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_IOVECS);
            for (idx, frame) in self.out_q.iter().enumerate().take(MAX_IOVECS) {
                let bytes = if idx == 0 { &frame[self.out_off..] } else { &frame[..] };
                slices.push(IoSlice::new(bytes));
            }

            match self.stream.write_vectored(&slices) {
                Ok(0) => return Ok(()),
                Ok(n) => self.advance_out(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn process_buffer(&mut self, storage: &dyn Storage) {
        loop {
            if self.pending.is_none() {
                match self.parser.feed(&self.in_buf[..self.pos]) {
                    ParseOutcome::Incomplete => break,
                    ParseOutcome::Consumed { header_len, header } => {
                        self.consume(header_len);
                        let arg_len = header.arg_len();
                        if arg_len == 0 {
                            let response = dispatch(&header, &[], storage);
                            self.enqueue(response);
                        } else {
                            self.arg_buf.clear();
                            self.arg_buf.reserve(arg_len + 2);
                            // +2 accounts for the trailing CRLF after the value.
                            self.arg_remains = arg_len + 2;
                            self.pending = Some(header);
                        }
                    }
                    ParseOutcome::Error { header_len, error } => {
                        self.consume(header_len);
                        self.enqueue(protocol_error_response(&error));
                    }
                }
            } else {
                let take = self.arg_remains.min(self.pos);
                self.arg_buf.extend_from_slice(&self.in_buf[..take]);
                self.consume(take);
                self.arg_remains -= take;

                if self.arg_remains > 0 {
                    break;
                }

                let header = self.pending.take().expect("pending header set");
                let total = self.arg_buf.len();
                let well_formed = total >= 2 && &self.arg_buf[total - 2..] == b"\r\n";
                if well_formed {
                    let value = &self.arg_buf[..total - 2];
                    let response = dispatch(&header, value, storage);
                    self.enqueue(response);
                } else {
                    self.enqueue(b"CLIENT_ERROR bad data chunk\r\n".to_vec());
                }
                self.arg_buf.clear();
            }
        }
    }

    /// Shifts the unconsumed tail of `in_buf` down to index 0.
    fn consume(&mut self, n: usize) {
        self.in_buf.copy_within(n..self.pos, 0);
        self.pos -= n;
    }

    fn enqueue(&mut self, frame: Vec<u8>) {
        self.out_q.push_back(frame);
        self.write_interest = true;
        self.update_read_interest();
    }

    fn advance_out(&mut self, mut n: usize) {
        while n > 0 {
            let front_len = self.out_q.front().map(|f| f.len() - self.out_off).unwrap_or(0);
            if front_len == 0 {
                break;
            }
            if n >= front_len {
                n -= front_len;
                self.out_q.pop_front();
                self.out_off = 0;
            } else {
                self.out_off += n;
                n = 0;
            }
        }
        self.update_read_interest();
    }

    /// Hysteresis: stop reading once the number of queued response frames
    /// crosses `hi`, resume only once it falls back to `lo`.
    fn update_read_interest(&mut self) {
        let queued = self.out_q.len();
        if self.read_interest && queued > self.hi {
            self.read_interest = false;
        } else if !self.read_interest && queued <= self.lo {
            self.read_interest = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write as _;
    use std::net::TcpListener as StdListener;
    use std::sync::Mutex;
    use std::thread;

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

    /// Builds a connected `mio::net::TcpStream` pair without going through a
    /// real reactor, so the state machine can be exercised directly.
    fn connected_pair() -> (mio::net::TcpStream, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || listener.accept().unwrap().0);
        let client = std::net::TcpStream::connect(addr).unwrap();
        let server_std = handle.join().unwrap();
        server_std.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(server_std), client)
    }

    #[test]
    fn split_header_across_two_reads_still_dispatches() {
        let (server_stream, mut client) = connected_pair();
        let mut conn = Connection::new(server_stream, 100, 20, ReactorMode::Multithreaded);
        let storage = FakeStorage { map: Mutex::new(HashMap::new()) };

        client.write_all(b"set a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let _ = conn.readable(&storage);

        client.write_all(b" 1\r\nx\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let _ = conn.readable(&storage);

        assert_eq!(conn.out_q.len(), 1);
        assert_eq!(conn.out_q.front().unwrap(), b"STORED\r\n");
    }

    #[test]
    fn malformed_header_resynchronizes_without_closing() {
        let (server_stream, mut client) = connected_pair();
        let mut conn = Connection::new(server_stream, 100, 20, ReactorMode::Multithreaded);
        let storage = FakeStorage { map: Mutex::new(HashMap::new()) };

        client.write_all(b"bogus line\r\nversion\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.readable(&storage).unwrap();

        assert!(conn.is_alive());
        assert_eq!(conn.out_q.len(), 2);
        assert!(conn.out_q[0].starts_with(b"CLIENT_ERROR"));
        assert!(conn.out_q[1].starts_with(b"VERSION"));
    }

    #[test]
    fn backpressure_drops_read_interest_past_high_watermark() {
        let (server_stream, _client) = connected_pair();
        let mut conn = Connection::new(server_stream, 4, 2, ReactorMode::Multithreaded);
        for _ in 0..5 {
            conn.enqueue(vec![0u8; 1]);
        }
        assert_eq!(conn.out_q.len(), 5);
        assert!(!conn.read_interest);
        // Draining three single-byte frames brings the queue from 5 down to
        // the low watermark (2), which must reassert read interest.
        conn.advance_out(3);
        assert_eq!(conn.out_q.len(), 2);
        assert!(conn.read_interest);
    }

    #[test]
    fn eof_marks_close_after_drain_in_multithreaded_mode() {
        let (server_stream, client) = connected_pair();
        let mut conn = Connection::new(server_stream, 100, 20, ReactorMode::Multithreaded);
        let storage = FakeStorage { map: Mutex::new(HashMap::new()) };
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.readable(&storage).unwrap();
        assert!(conn.close_after_drain);
        assert!(conn.is_alive());
    }

    #[test]
    fn eof_kills_the_connection_immediately_in_single_threaded_mode() {
        let (server_stream, client) = connected_pair();
        let mut conn = Connection::new(server_stream, 100, 20, ReactorMode::SingleThreaded);
        let storage = FakeStorage { map: Mutex::new(HashMap::new()) };
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.readable(&storage).unwrap();
        assert!(!conn.is_alive());
        assert!(!conn.close_after_drain);
    }

    #[test]
    fn hangup_kills_the_connection_immediately() {
        let (server_stream, _client) = connected_pair();
        let mut conn = Connection::new(server_stream, 100, 20, ReactorMode::Multithreaded);
        assert!(conn.is_alive());
        conn.hangup();
        assert!(!conn.is_alive());
    }
}
