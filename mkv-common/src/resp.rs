//! # RESP3 Encoding and Parsing
//!
//! Purpose: Encode client commands as arrays of bulk strings and decode
//! server frames incrementally out of a read buffer.
//!
//! ## Design Principles
//! 1. **Check, Then Parse**: A frame is first validated for completeness
//!    without allocating, then split off the buffer and parsed zero-copy.
//! 2. **Buffer Reuse**: Encoders append into caller-provided buffers.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, ProtocolError, Result};

/// Maximum nesting of aggregate frames accepted from the server.
const MAX_DEPTH: usize = 128;

/// Largest blob payload accepted, matching the server's own limit.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Decoded RESP3 reply.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// `+OK` style status replies.
    Simple(Bytes),
    /// `-ERR ...` replies.
    Error(Bytes),
    /// `!<len>` bulk errors.
    BulkError(Bytes),
    /// `:123` replies.
    Integer(i64),
    /// `,3.14` replies.
    Double(f64),
    /// `#t` / `#f` replies.
    Boolean(bool),
    /// `(<digits>` replies, kept as text.
    BigNumber(Bytes),
    /// `$<len>` bulk strings.
    Bulk(Bytes),
    /// `=<len>` verbatim strings, split into format and payload.
    Verbatim { format: Bytes, data: Bytes },
    /// `_`, `$-1` and `*-1`.
    Null,
    /// `*<len>` arrays.
    Array(Vec<RespValue>),
    /// `~<len>` sets.
    Set(Vec<RespValue>),
    /// `%<len>` maps, in wire order.
    Map(Vec<(RespValue, RespValue)>),
    /// `><len>` out-of-band pushes.
    Push(Vec<RespValue>),
}

impl RespValue {
    /// Short variant name used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            RespValue::Simple(_) => "simple string",
            RespValue::Error(_) => "error",
            RespValue::BulkError(_) => "bulk error",
            RespValue::Integer(_) => "integer",
            RespValue::Double(_) => "double",
            RespValue::Boolean(_) => "boolean",
            RespValue::BigNumber(_) => "big number",
            RespValue::Bulk(_) => "bulk string",
            RespValue::Verbatim { .. } => "verbatim string",
            RespValue::Null => "null",
            RespValue::Array(_) => "array",
            RespValue::Set(_) => "set",
            RespValue::Map(_) => "map",
            RespValue::Push(_) => "push",
        }
    }

    /// True for `-ERR` and `!` replies.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_) | RespValue::BulkError(_))
    }

    /// True for the null reply.
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// Error message of an error reply.
    pub fn error_message(&self) -> Option<&[u8]> {
        match self {
            RespValue::Error(msg) | RespValue::BulkError(msg) => Some(&msg[..]),
            _ => None,
        }
    }

    /// Converts error replies into [`Error::Server`] and null into [`Error::Nil`].
    pub fn into_result(self) -> Result<RespValue> {
        match self {
            RespValue::Error(msg) | RespValue::BulkError(msg) => {
                Err(Error::Server(String::from_utf8_lossy(&msg).into_owned()))
            }
            RespValue::Null => Err(Error::Nil),
            other => Ok(other),
        }
    }

    /// Payload of a string-like reply.
    pub fn as_bytes(&self) -> Result<&Bytes> {
        match self {
            RespValue::Simple(data)
            | RespValue::Bulk(data)
            | RespValue::BigNumber(data)
            | RespValue::Verbatim { data, .. } => Ok(data),
            other => Err(other.mismatch("string")),
        }
    }

    /// Payload of a string-like reply as UTF-8.
    pub fn as_str(&self) -> Result<&str> {
        let data = self.as_bytes()?;
        std::str::from_utf8(data).map_err(|_| Error::UnexpectedType {
            expected: "utf-8 string",
            actual: "binary string",
        })
    }

    /// Integer reply.
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            RespValue::Integer(value) => Ok(*value),
            other => Err(other.mismatch("integer")),
        }
    }

    /// Elements of an array, set or push.
    pub fn as_array(&self) -> Result<&[RespValue]> {
        match self {
            RespValue::Array(items) | RespValue::Set(items) | RespValue::Push(items) => Ok(items.as_slice()),
            other => Err(other.mismatch("array")),
        }
    }

    /// Takes the elements of an array, set or push.
    pub fn into_array(self) -> Result<Vec<RespValue>> {
        match self {
            RespValue::Array(items) | RespValue::Set(items) | RespValue::Push(items) => Ok(items),
            other => Err(other.mismatch("array")),
        }
    }

    /// Takes the pairs of a map. Flat arrays of even length are accepted
    /// as well, matching RESP2-style replies.
    pub fn into_map(self) -> Result<Vec<(RespValue, RespValue)>> {
        match self {
            RespValue::Map(pairs) => Ok(pairs),
            RespValue::Array(items) if items.len() % 2 == 0 => {
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                Ok(pairs)
            }
            other => Err(other.mismatch("map")),
        }
    }

    /// Approximate heap footprint, used for cache accounting.
    pub fn weight(&self) -> usize {
        const HEADER: usize = 16;
        match self {
            RespValue::Simple(b)
            | RespValue::Error(b)
            | RespValue::BulkError(b)
            | RespValue::BigNumber(b)
            | RespValue::Bulk(b) => HEADER + b.len(),
            RespValue::Verbatim { format, data } => HEADER + format.len() + data.len(),
            RespValue::Integer(_) | RespValue::Double(_) | RespValue::Boolean(_) | RespValue::Null => {
                HEADER
            }
            RespValue::Array(items) | RespValue::Set(items) | RespValue::Push(items) => {
                HEADER + items.iter().map(RespValue::weight).sum::<usize>()
            }
            RespValue::Map(pairs) => {
                HEADER
                    + pairs
                        .iter()
                        .map(|(k, v)| k.weight() + v.weight())
                        .sum::<usize>()
            }
        }
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        match self {
            RespValue::Null => Error::Nil,
            RespValue::Error(msg) | RespValue::BulkError(msg) => {
                Error::Server(String::from_utf8_lossy(msg).into_owned())
            }
            other => Error::UnexpectedType {
                expected,
                actual: other.type_name(),
            },
        }
    }

    /// Serializes the value in RESP3 form.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::Simple(s) => push_line(out, b'+', s),
            RespValue::Error(s) => push_line(out, b'-', s),
            RespValue::BigNumber(s) => push_line(out, b'(', s),
            RespValue::BulkError(s) => push_blob(out, b'!', s),
            RespValue::Bulk(s) => push_blob(out, b'$', s),
            RespValue::Verbatim { format, data } => {
                out.push(b'=');
                push_usize(out, format.len() + 1 + data.len());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(format);
                out.push(b':');
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(v) => push_line(out, b':', v.to_string().as_bytes()),
            RespValue::Double(v) => push_line(out, b',', v.to_string().as_bytes()),
            RespValue::Boolean(v) => push_line(out, b'#', if *v { b"t" } else { b"f" }),
            RespValue::Null => out.extend_from_slice(b"_\r\n"),
            RespValue::Array(items) => push_aggregate(out, b'*', items),
            RespValue::Set(items) => push_aggregate(out, b'~', items),
            RespValue::Push(items) => push_aggregate(out, b'>', items),
            RespValue::Map(pairs) => {
                out.push(b'%');
                push_usize(out, pairs.len());
                out.extend_from_slice(b"\r\n");
                for (k, v) in pairs {
                    k.encode(out);
                    v.encode(out);
                }
            }
        }
    }
}

/// Encodes a RESP array-of-bulk-strings request into the provided buffer.
pub fn encode_args(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        push_bulk_arg(out, arg);
    }
}

/// Appends one `$<len>\r\n<data>\r\n` argument.
pub(crate) fn push_bulk_arg(out: &mut Vec<u8>, arg: &[u8]) {
    out.push(b'$');
    push_usize(out, arg.len());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(arg);
    out.extend_from_slice(b"\r\n");
}

/// Decodes one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; nothing is consumed in
/// that case. Stateless: a partial frame is walked again on the next call.
/// Long-lived readers use a [`Decoder`] instead.
pub fn decode(buf: &mut BytesMut) -> std::result::Result<Option<RespValue>, ProtocolError> {
    Decoder::new().decode(buf)
}

/// Incremental frame decoder for one byte stream.
///
/// Completeness scanning resumes where the previous call stopped, so a
/// large reply arriving in many reads is walked once. Between calls the
/// buffer may only grow at the back.
#[derive(Debug, Default)]
pub struct Decoder {
    /// Offset just past the last fully scanned element of the front frame.
    scanned: usize,
    /// Open aggregates of the front frame: elements each still expects.
    open: Vec<usize>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one complete frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; nothing is consumed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<RespValue>, ProtocolError> {
        let len = match self.scan(&buf[..])? {
            Some(end) => end,
            None => return Ok(None),
        };
        self.scanned = 0;
        self.open.clear();
        let frame = buf.split_to(len).freeze();
        let (value, end) = parse(&frame, 0, 0)?;
        debug_assert_eq!(end, len);
        Ok(Some(value))
    }

    /// Walks elements from `self.scanned` and returns the frame length once
    /// the outermost element is complete.
    fn scan(&mut self, data: &[u8]) -> std::result::Result<Option<usize>, ProtocolError> {
        loop {
            if self.open.len() > MAX_DEPTH {
                return Err(ProtocolError::TooDeep(MAX_DEPTH));
            }
            let Some(&kind) = data.get(self.scanned) else {
                return Ok(None);
            };
            let Some((line, next)) = read_line(data, self.scanned + 1)? else {
                return Ok(None);
            };

            let (end, children) = match kind {
                b'+' | b'-' | b':' | b',' | b'#' | b'(' | b'_' => (next, 0),
                b'$' | b'!' | b'=' => match bulk_len(line)? {
                    None => (next, 0),
                    Some(len) => {
                        let end = next + len;
                        if data.len() < end + 2 {
                            return Ok(None);
                        }
                        if &data[end..end + 2] != b"\r\n" {
                            return Err(ProtocolError::MissingCrlf);
                        }
                        (end + 2, 0)
                    }
                },
                b'*' | b'~' | b'>' => {
                    let len = parse_i64(line)?;
                    (next, usize::try_from(len).unwrap_or(0))
                }
                b'%' | b'|' => {
                    let len = parse_i64(line)?;
                    let pairs = usize::try_from(len).map_err(|_| ProtocolError::InvalidLength(len))?;
                    let items = pairs.checked_mul(2).ok_or(ProtocolError::InvalidLength(len))?;
                    // Attributes decorate the frame that follows them.
                    (next, if kind == b'|' { items + 1 } else { items })
                }
                other => return Err(ProtocolError::InvalidType(other)),
            };

            self.scanned = end;
            if children > 0 {
                self.open.push(children);
                continue;
            }
            // A leaf or empty aggregate finished; close every parent it completes.
            loop {
                let Some(remaining) = self.open.last_mut() else {
                    return Ok(Some(self.scanned));
                };
                *remaining -= 1;
                if *remaining > 0 {
                    break;
                }
                self.open.pop();
            }
        }
    }
}

/// Payload length of a blob header; `None` for the `-1` null form.
fn bulk_len(line: &[u8]) -> std::result::Result<Option<usize>, ProtocolError> {
    let len = parse_i64(line)?;
    if len < 0 {
        return Ok(None);
    }
    if len > MAX_BULK_LEN {
        return Err(ProtocolError::InvalidLength(len));
    }
    Ok(Some(len as usize))
}

/// Parses a frame known to be complete.
fn parse(frame: &Bytes, pos: usize, depth: usize) -> std::result::Result<(RespValue, usize), ProtocolError> {
    let kind = frame[pos];
    let (line, next) = read_line(frame, pos + 1)?.ok_or(ProtocolError::MissingCrlf)?;
    let line_range = pos + 1..pos + 1 + line.len();

    match kind {
        b'+' => Ok((RespValue::Simple(frame.slice(line_range)), next)),
        b'-' => Ok((RespValue::Error(frame.slice(line_range)), next)),
        b'(' => Ok((RespValue::BigNumber(frame.slice(line_range)), next)),
        b':' => Ok((RespValue::Integer(parse_i64(line)?), next)),
        b'_' => Ok((RespValue::Null, next)),
        b',' => {
            let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidDouble)?;
            let value = text.parse::<f64>().map_err(|_| ProtocolError::InvalidDouble)?;
            Ok((RespValue::Double(value), next))
        }
        b'#' => match line {
            b"t" => Ok((RespValue::Boolean(true), next)),
            b"f" => Ok((RespValue::Boolean(false), next)),
            _ => Err(ProtocolError::InvalidBoolean),
        },
        b'$' | b'!' | b'=' => {
            let len = parse_i64(line)?;
            if len < 0 {
                return Ok((RespValue::Null, next));
            }
            let end = next + len as usize;
            let payload = frame.slice(next..end);
            let value = match kind {
                b'$' => RespValue::Bulk(payload),
                b'!' => RespValue::BulkError(payload),
                _ => {
                    if payload.len() < 4 || payload[3] != b':' {
                        return Err(ProtocolError::InvalidLength(len));
                    }
                    RespValue::Verbatim {
                        format: payload.slice(..3),
                        data: payload.slice(4..),
                    }
                }
            };
            Ok((value, end + 2))
        }
        b'*' | b'~' | b'>' => {
            let len = parse_i64(line)?;
            if len < 0 {
                return Ok((RespValue::Null, next));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut cursor = next;
            for _ in 0..len {
                let (item, end) = parse(frame, cursor, depth + 1)?;
                items.push(item);
                cursor = end;
            }
            let value = match kind {
                b'*' => RespValue::Array(items),
                b'~' => RespValue::Set(items),
                _ => RespValue::Push(items),
            };
            Ok((value, cursor))
        }
        b'%' | b'|' => {
            let len = parse_i64(line)?;
            if len < 0 {
                return Err(ProtocolError::InvalidLength(len));
            }
            let mut pairs = Vec::with_capacity(len as usize);
            let mut cursor = next;
            for _ in 0..len {
                let (key, end) = parse(frame, cursor, depth + 1)?;
                let (value, end) = parse(frame, end, depth + 1)?;
                pairs.push((key, value));
                cursor = end;
            }
            if kind == b'|' {
                return parse(frame, cursor, depth + 1);
            }
            Ok((RespValue::Map(pairs), cursor))
        }
        other => Err(ProtocolError::InvalidType(other)),
    }
}

/// Returns the line starting at `pos` (without CRLF) and the offset after it.
fn read_line(data: &[u8], pos: usize) -> std::result::Result<Option<(&[u8], usize)>, ProtocolError> {
    if pos > data.len() {
        return Ok(None);
    }
    let rest = &data[pos..];
    match rest.iter().position(|&b| b == b'\n') {
        Some(idx) => {
            if idx == 0 || rest[idx - 1] != b'\r' {
                return Err(ProtocolError::MissingCrlf);
            }
            Ok(Some((&rest[..idx - 1], pos + idx + 1)))
        }
        None => Ok(None),
    }
}

fn parse_i64(data: &[u8]) -> std::result::Result<i64, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        b'+' => (false, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or(ProtocolError::InvalidInteger)?;
    }

    Ok(if negative { -value } else { value })
}

fn push_line(out: &mut Vec<u8>, kind: u8, line: &[u8]) {
    out.push(kind);
    out.extend_from_slice(line);
    out.extend_from_slice(b"\r\n");
}

fn push_blob(out: &mut Vec<u8>, kind: u8, data: &[u8]) {
    out.push(kind);
    push_usize(out, data.len());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn push_aggregate(out: &mut Vec<u8>, kind: u8, items: &[RespValue]) {
    out.push(kind);
    push_usize(out, items.len());
    out.extend_from_slice(b"\r\n");
    for item in items {
        item.encode(out);
    }
}

pub(crate) fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
