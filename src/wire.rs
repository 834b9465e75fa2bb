//! # Wire Format and Transport Shim
//!
//! Inter-node tuples travel as framed messages: a length prefix, a crc32 of
//! the body, then the body. The body leads with a polarity byte, then the
//! table name, the schema tag (the table's canonical name), and the typed
//! column payloads. Numeric columns are little-endian; strings are
//! length-prefixed UTF-8.
//!
//! Outbound dispatch goes through the `Outbound` trait so the engine never
//! sees sockets. The default implementation dials `tcp:host:port` addresses
//! and caches connections. Delivery is at-most-once: a failed send is logged
//! by the caller and the derivation is lost.

use crate::error::WireError;
use crate::table::Polarity;
use crate::value::Datum;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const TAG_BOOL: u8 = 0x01;
const TAG_CHAR: u8 = 0x02;
const TAG_INT16: u8 = 0x03;
const TAG_INT32: u8 = 0x04;
const TAG_INT64: u8 = 0x05;
const TAG_FLOAT64: u8 = 0x06;
const TAG_STRING: u8 = 0x07;

const POLARITY_INSERT: u8 = 0x00;
const POLARITY_DELETE: u8 = 0x01;

/// A decoded inbound tuple message.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFact {
    pub table: String,
    pub schema_tag: String,
    pub polarity: Polarity,
    pub values: Vec<Datum>,
}

// === Body encoding ===

pub fn encode_datum(buf: &mut Vec<u8>, d: &Datum) {
    match d {
        Datum::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*v));
        }
        Datum::Char(v) => {
            buf.push(TAG_CHAR);
            buf.extend_from_slice(&(*v as u32).to_le_bytes());
        }
        Datum::Int16(v) => {
            buf.push(TAG_INT16);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Int32(v) => {
            buf.push(TAG_INT32);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Int64(v) => {
            buf.push(TAG_INT64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float64(v) => {
            buf.push(TAG_FLOAT64);
            buf.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Datum::String(v) => {
            buf.push(TAG_STRING);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    fn string(&mut self, len: usize) -> Result<String, WireError> {
        Ok(String::from_utf8(self.take(len)?.to_vec())?)
    }

    fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }
}

fn decode_datum(r: &mut Reader<'_>) -> Result<Datum, WireError> {
    let tag = r.u8()?;
    match tag {
        TAG_BOOL => Ok(Datum::Bool(r.u8()? != 0)),
        TAG_CHAR => {
            let code = r.u32()?;
            char::from_u32(code).map(Datum::Char).ok_or(WireError::BadTag(tag))
        }
        TAG_INT16 => {
            let b = r.take(2)?;
            Ok(Datum::Int16(i16::from_le_bytes([b[0], b[1]])))
        }
        TAG_INT32 => Ok(Datum::Int32(r.u32()? as i32)),
        TAG_INT64 => Ok(Datum::Int64(r.u64()? as i64)),
        TAG_FLOAT64 => Ok(Datum::Float64(f64::from_bits(r.u64()?))),
        TAG_STRING => {
            let len = r.u32()? as usize;
            Ok(Datum::string(r.string(len)?))
        }
        other => Err(WireError::BadTag(other)),
    }
}

fn encode_name(buf: &mut Vec<u8>, name: &str) {
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
}

/// Encode a tuple message body.
pub fn encode_fact(table: &str, polarity: Polarity, values: &[Datum]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + table.len() * 2);
    buf.push(match polarity {
        Polarity::Insert => POLARITY_INSERT,
        Polarity::Delete => POLARITY_DELETE,
    });
    encode_name(&mut buf, table);
    // The schema tag is the table's canonical name; the receiver must hold
    // an identical define or reject the tuple.
    encode_name(&mut buf, table);
    buf.extend_from_slice(&(values.len() as u16).to_le_bytes());
    for d in values {
        encode_datum(&mut buf, d);
    }
    buf
}

/// Decode a tuple message body.
pub fn decode_fact(body: &[u8]) -> Result<RemoteFact, WireError> {
    let mut r = Reader::new(body);
    let polarity = match r.u8()? {
        POLARITY_INSERT => Polarity::Insert,
        POLARITY_DELETE => Polarity::Delete,
        other => return Err(WireError::BadPolarity(other)),
    };
    let table_len = r.u16()? as usize;
    let table = r.string(table_len)?;
    let tag_len = r.u16()? as usize;
    let schema_tag = r.string(tag_len)?;
    let ncols = r.u16()? as usize;
    let mut values = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        values.push(decode_datum(&mut r)?);
    }
    if !r.at_end() {
        return Err(WireError::Truncated);
    }
    Ok(RemoteFact { table, schema_tag, polarity, values })
}

// === Stream framing ===

/// Wrap a body with its length prefix and crc32.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Read one framed body from a stream. `Ok(None)` means a clean end of
/// stream at a frame boundary; a checksum mismatch or torn frame is an
/// error.
pub fn read_frame(r: &mut impl Read) -> Result<Option<Vec<u8>>, FrameReadError> {
    let mut header = [0u8; 8];
    match r.read_exact(&mut header[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FrameReadError::Io(e)),
    }
    r.read_exact(&mut header[1..])?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    if crc32fast::hash(&body) != crc {
        return Err(FrameReadError::Wire(WireError::BadChecksum));
    }
    Ok(Some(body))
}

/// Failure while reading a framed stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameReadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

// === Outbound shim ===

/// Opaque send interface the router dispatches remote-headed derivations
/// through. Implementations must be thread-safe on their own; the router
/// only ever calls from its single thread.
pub trait Outbound: Send {
    fn send(&mut self, addr: &str, body: &[u8]) -> io::Result<()>;
}

/// Split `tcp:host:port` into host and port.
pub fn parse_addr(addr: &str) -> Option<(&str, u16)> {
    let rest = addr.strip_prefix("tcp:")?;
    let (host, port) = rest.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

/// TCP dialer with cached connections.
#[derive(Default)]
pub struct TcpOutbound {
    conns: HashMap<String, TcpStream>,
}

impl TcpOutbound {
    pub fn new() -> TcpOutbound {
        TcpOutbound { conns: HashMap::new() }
    }
}

impl Outbound for TcpOutbound {
    fn send(&mut self, addr: &str, body: &[u8]) -> io::Result<()> {
        let (host, port) = parse_addr(addr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("bad address: {addr}"))
        })?;
        if !self.conns.contains_key(addr) {
            let stream = TcpStream::connect((host, port))?;
            stream.set_nodelay(true)?;
            self.conns.insert(addr.to_string(), stream);
        }
        let framed = frame(body);
        let result = self
            .conns
            .get_mut(addr)
            .map(|s| s.write_all(&framed))
            .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::NotConnected, "no connection")));
        if result.is_err() {
            // Drop the broken connection; the next send redials.
            self.conns.remove(addr);
        }
        result
    }
}

// === Inbound listener ===

/// Accepts peer connections and decodes framed tuple messages, handing each
/// decoded fact to the supplied sink (which deposits it in the mailbox).
pub struct Listener {
    port: u16,
    host: String,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `host:port` (port 0 selects an ephemeral port) and start the
    /// accept loop.
    pub fn spawn<F>(host: &str, port: u16, sink: F) -> io::Result<Listener>
    where
        F: Fn(RemoteFact) + Send + Clone + 'static,
    {
        let listener = TcpListener::bind((host, port))?;
        let port = listener.local_addr()?.port();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let accept_thread = std::thread::Builder::new()
            .name("cascade-listener".to_string())
            .spawn(move || {
                for conn in listener.incoming() {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match conn {
                        Ok(stream) => {
                            let sink = sink.clone();
                            let peer = stream
                                .peer_addr()
                                .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
                            if let Err(e) = std::thread::Builder::new()
                                .name("cascade-peer".to_string())
                                .spawn(move || serve_peer(stream, &peer, &sink))
                            {
                                tracing::warn!(error = %e, "failed to spawn peer thread");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            })?;

        Ok(Listener { port, host: host.to_string(), stop, accept_thread: Some(accept_thread) })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the accept loop and join the thread. Peer threads exit when
    /// their connections close.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.accept_thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        // Wake the blocking accept with a throwaway connection.
        let _ = TcpStream::connect((self.host.as_str(), self.port));
        let _ = handle.join();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_peer<F: Fn(RemoteFact)>(mut stream: TcpStream, peer: &str, sink: &F) {
    loop {
        match read_frame(&mut stream) {
            Ok(Some(body)) => match decode_fact(&body) {
                Ok(fact) => sink(fact),
                Err(e) => {
                    tracing::warn!(peer, error = %e, "rejected inbound tuple");
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer, error = %e, "peer stream failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_types() -> Vec<Datum> {
        vec![
            Datum::Bool(true),
            Datum::Char('x'),
            Datum::Int16(-7),
            Datum::Int32(42),
            Datum::Int64(-9_000_000_000),
            Datum::Float64(2.5),
            Datum::string("hello"),
        ]
    }

    #[test]
    fn test_fact_roundtrip() {
        let body = encode_fact("events", Polarity::Insert, &all_types());
        let fact = decode_fact(&body).expect("well-formed body");
        assert_eq!(fact.table, "events");
        assert_eq!(fact.schema_tag, "events");
        assert_eq!(fact.polarity, Polarity::Insert);
        assert_eq!(fact.values, all_types());
    }

    #[test]
    fn test_delete_polarity_leads_the_payload() {
        let body = encode_fact("t", Polarity::Delete, &[Datum::Int32(1)]);
        assert_eq!(body[0], POLARITY_DELETE);
        let fact = decode_fact(&body).expect("well-formed body");
        assert_eq!(fact.polarity, Polarity::Delete);
    }

    #[test]
    fn test_truncated_body_rejected() {
        let body = encode_fact("t", Polarity::Insert, &all_types());
        assert!(decode_fact(&body[..body.len() - 1]).is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut body = encode_fact("t", Polarity::Insert, &[Datum::Int32(1)]);
        body.push(0xFF);
        assert!(decode_fact(&body).is_err());
    }

    #[test]
    fn test_frame_roundtrip() {
        let body = encode_fact("t", Polarity::Insert, &[Datum::Int32(1)]);
        let framed = frame(&body);
        let mut cursor = io::Cursor::new(framed);
        let read = read_frame(&mut cursor).expect("valid frame").expect("one frame");
        assert_eq!(read, body);
        assert!(read_frame(&mut cursor).expect("clean eof").is_none());
    }

    #[test]
    fn test_corrupt_frame_rejected() {
        let body = encode_fact("t", Polarity::Insert, &[Datum::Int32(1)]);
        let mut framed = frame(&body);
        let last = framed.len() - 1;
        framed[last] ^= 0x01;
        let mut cursor = io::Cursor::new(framed);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("tcp:127.0.0.1:4000"), Some(("127.0.0.1", 4000)));
        assert_eq!(parse_addr("udp:127.0.0.1:4000"), None);
        assert_eq!(parse_addr("tcp:nope"), None);
    }
}
