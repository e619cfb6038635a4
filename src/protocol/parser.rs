use super::types::RespValue;
use crate::error::{ParseError, Result};
use bytes::{Buf, Bytes, BytesMut};

/// Simple lines and length prefixes must terminate within this many bytes;
/// a longer run without CRLF means the stream is desynchronized.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Upper bound on a single blob body (matches the server's default
/// proto-max-bulk-len).
const MAX_BLOB_LEN: usize = 512 * 1024 * 1024;

/// Outcome of one parse attempt over buffered bytes.
///
/// `Incomplete` is ordinary backpressure: keep the bytes, feed more, retry.
/// `Invalid` is fatal: the connection must be dropped, never resynchronized.
#[derive(Debug)]
enum ParseFault {
    Incomplete,
    Invalid(ParseError),
}

type ParseResult<T> = std::result::Result<T, ParseFault>;

fn invalid<T>(e: ParseError) -> ParseResult<T> {
    Err(ParseFault::Invalid(e))
}

/// Sequential read view over the buffered bytes of one parse attempt.
/// Consumed positions are committed to the buffer only after a complete
/// value parsed, so a partial value costs nothing but the re-scan.
struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn peek_byte(&self) -> ParseResult<u8> {
        self.data.get(self.pos).copied().ok_or(ParseFault::Incomplete)
    }

    fn read_byte(&mut self) -> ParseResult<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        Ok(b)
    }

    fn read_exact(&mut self, len: usize) -> ParseResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(ParseFault::Incomplete);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Bytes up to the next CRLF, consuming the terminator.
    fn read_line(&mut self) -> ParseResult<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let scan = rest.len().min(MAX_LINE_LEN + 2);
        for i in 0..scan.saturating_sub(1) {
            if rest[i] == b'\r' && rest[i + 1] == b'\n' {
                self.pos += i + 2;
                return Ok(&rest[..i]);
            }
        }
        if rest.len() > MAX_LINE_LEN {
            return invalid(ParseError::MissingCrlf);
        }
        Err(ParseFault::Incomplete)
    }
}

/// Length prefix of a blob or aggregate: a decimal count, `-1` for the
/// null variants, or `?` announcing the streamed form.
enum LenPrefix {
    Fixed(usize),
    Null,
    Streamed,
}

/// Incremental RESP2/RESP3 parser.
///
/// Bytes are fed into an internal buffer; [`parse`](Self::parse) yields one
/// complete value at a time and keeps partial input buffered across calls.
pub struct RespParser {
    buffer: BytesMut,
}

impl RespParser {
    /// Create a new parser with a given buffer capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Get a mutable reference to the buffer, for zero-copy reads into it
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// True when no partial value is buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard all buffered bytes (connection teardown)
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Try to parse one complete RESP value from the buffer.
    ///
    /// `Ok(None)` means more bytes are needed; buffered input is kept.
    /// `Err` means the stream is desynchronized: the caller must drop the
    /// connection, as no recovery point exists in the wire format.
    pub fn parse(&mut self) -> Result<Option<RespValue>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut cursor = ByteCursor::new(&self.buffer[..]);
        match self.parse_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position();
                self.buffer.advance(consumed);
                Ok(Some(value))
            }
            Err(ParseFault::Incomplete) => Ok(None),
            Err(ParseFault::Invalid(e)) => Err(e.into()),
        }
    }

    fn parse_value(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let byte = cursor.read_byte()?;

        match byte {
            // RESP2 types
            b'+' => self.parse_simple_string(cursor),
            b'-' => self.parse_error(cursor),
            b':' => self.parse_integer(cursor),
            b'$' => self.parse_bulk_string(cursor),
            b'*' => self.parse_array(cursor),
            // RESP3 types
            b'_' => self.parse_null(cursor),
            b'#' => self.parse_boolean(cursor),
            b',' => self.parse_double(cursor),
            b'(' => self.parse_big_number(cursor),
            b'!' => self.parse_bulk_error(cursor),
            b'=' => self.parse_verbatim_string(cursor),
            b'%' => self.parse_map(cursor),
            b'~' => self.parse_set(cursor),
            b'>' => self.parse_push(cursor),
            b'|' => self.parse_attribute(cursor),
            // Chunk and end markers are consumed inside the streamed
            // parsers; meeting one here means the stream slipped.
            other => invalid(ParseError::UnknownMarker(other)),
        }
    }

    fn read_len(&self, cursor: &mut ByteCursor, what: &str) -> ParseResult<LenPrefix> {
        let line = cursor.read_line()?;
        if line == b"?" {
            return Ok(LenPrefix::Streamed);
        }
        let text = std::str::from_utf8(line)
            .map_err(|_| ParseFault::Invalid(ParseError::BadLength(what.to_string())))?;
        let n = text.parse::<i64>().map_err(|_| {
            ParseFault::Invalid(ParseError::BadLength(format!("{} {:?}", what, text)))
        })?;
        match n {
            -1 => Ok(LenPrefix::Null),
            n if n < 0 => invalid(ParseError::BadLength(format!("{} {}", what, n))),
            n => Ok(LenPrefix::Fixed(n as usize)),
        }
    }

    fn parse_simple_string(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let line = cursor.read_line()?;
        Ok(RespValue::SimpleString(
            String::from_utf8_lossy(line).to_string(),
        ))
    }

    fn parse_error(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let line = cursor.read_line()?;
        Ok(RespValue::Error(String::from_utf8_lossy(line).to_string()))
    }

    fn parse_integer(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let line = cursor.read_line()?;
        let text = String::from_utf8_lossy(line);
        let num = text.parse::<i64>().map_err(|_| {
            ParseFault::Invalid(ParseError::Malformed(format!("invalid integer {:?}", text)))
        })?;
        Ok(RespValue::Integer(num))
    }

    fn parse_null(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let line = cursor.read_line()?;
        if !line.is_empty() {
            return invalid(ParseError::Malformed("null with trailing bytes".to_string()));
        }
        Ok(RespValue::Null)
    }

    fn parse_boolean(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let line = cursor.read_line()?;
        match line {
            b"t" => Ok(RespValue::Boolean(true)),
            b"f" => Ok(RespValue::Boolean(false)),
            _ => invalid(ParseError::Malformed(format!(
                "invalid boolean {:?}",
                String::from_utf8_lossy(line)
            ))),
        }
    }

    fn parse_double(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let line = cursor.read_line()?;
        let num = match line {
            b"inf" => f64::INFINITY,
            b"-inf" => f64::NEG_INFINITY,
            b"nan" => f64::NAN,
            _ => {
                let text = String::from_utf8_lossy(line);
                text.parse::<f64>().map_err(|_| {
                    ParseFault::Invalid(ParseError::Malformed(format!(
                        "invalid double {:?}",
                        text
                    )))
                })?
            }
        };
        Ok(RespValue::Double(num))
    }

    fn parse_big_number(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let line = cursor.read_line()?;
        let text = String::from_utf8_lossy(line).to_string();
        if text.is_empty()
            || !text
                .bytes()
                .enumerate()
                .all(|(i, b)| b.is_ascii_digit() || (i == 0 && (b == b'-' || b == b'+')))
        {
            return invalid(ParseError::Malformed(format!(
                "invalid big number {:?}",
                text
            )));
        }
        Ok(RespValue::BigNumber(text))
    }

    fn parse_bulk_string(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        match self.read_len(cursor, "bulk string length")? {
            LenPrefix::Null => Ok(RespValue::BulkString(None)),
            LenPrefix::Streamed => self.parse_streamed_blob(cursor),
            LenPrefix::Fixed(len) => {
                let body = self.read_blob_body(cursor, len)?;
                Ok(RespValue::BulkString(Some(body)))
            }
        }
    }

    fn parse_bulk_error(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        match self.read_len(cursor, "bulk error length")? {
            LenPrefix::Fixed(len) => {
                let body = self.read_blob_body(cursor, len)?;
                Ok(RespValue::BulkError(
                    String::from_utf8_lossy(&body).to_string(),
                ))
            }
            _ => invalid(ParseError::Malformed(
                "bulk error has no null or streamed form".to_string(),
            )),
        }
    }

    fn parse_verbatim_string(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let len = match self.read_len(cursor, "verbatim string length")? {
            LenPrefix::Fixed(len) => len,
            _ => {
                return invalid(ParseError::Malformed(
                    "verbatim string has no null or streamed form".to_string(),
                ))
            }
        };
        let body = self.read_blob_body(cursor, len)?;

        // format:payload, format conventionally three characters
        let colon = body.iter().position(|&b| b == b':').ok_or_else(|| {
            ParseFault::Invalid(ParseError::Malformed(
                "verbatim string missing format separator".to_string(),
            ))
        })?;
        let format = String::from_utf8_lossy(&body[..colon]).to_string();
        let data = body.slice(colon + 1..);

        Ok(RespValue::VerbatimString { format, data })
    }

    fn parse_array(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        match self.read_len(cursor, "array count")? {
            LenPrefix::Null => Ok(RespValue::Array(None)),
            LenPrefix::Fixed(count) => {
                Ok(RespValue::Array(Some(self.parse_elements(cursor, count)?)))
            }
            LenPrefix::Streamed => {
                Ok(RespValue::Array(Some(self.parse_streamed_elements(cursor)?)))
            }
        }
    }

    fn parse_set(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        match self.read_len(cursor, "set count")? {
            LenPrefix::Fixed(count) => Ok(RespValue::Set(self.parse_elements(cursor, count)?)),
            LenPrefix::Streamed => Ok(RespValue::Set(self.parse_streamed_elements(cursor)?)),
            LenPrefix::Null => invalid(ParseError::Malformed("set has no null form".to_string())),
        }
    }

    fn parse_push(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        match self.read_len(cursor, "push count")? {
            LenPrefix::Fixed(count) => Ok(RespValue::Push(self.parse_elements(cursor, count)?)),
            LenPrefix::Streamed => Ok(RespValue::Push(self.parse_streamed_elements(cursor)?)),
            LenPrefix::Null => invalid(ParseError::Malformed("push has no null form".to_string())),
        }
    }

    fn parse_map(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        match self.read_len(cursor, "map count")? {
            LenPrefix::Fixed(count) => Ok(RespValue::Map(self.parse_pairs(cursor, count)?)),
            LenPrefix::Streamed => {
                let mut pairs = Vec::new();
                while !self.at_stream_end(cursor)? {
                    let key = self.parse_value(cursor)?;
                    let value = self.parse_value(cursor)?;
                    pairs.push((key, value));
                }
                Ok(RespValue::Map(pairs))
            }
            LenPrefix::Null => invalid(ParseError::Malformed("map has no null form".to_string())),
        }
    }

    fn parse_attribute(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let count = match self.read_len(cursor, "attribute count")? {
            LenPrefix::Fixed(count) => count,
            _ => {
                return invalid(ParseError::Malformed(
                    "attribute has no null or streamed form".to_string(),
                ))
            }
        };
        let attributes = self.parse_pairs(cursor, count)?;

        // The decorated value follows immediately in the same stream
        let data = self.parse_value(cursor)?;

        Ok(RespValue::Attribute {
            attributes,
            data: Box::new(data),
        })
    }

    fn parse_elements(&self, cursor: &mut ByteCursor, count: usize) -> ParseResult<Vec<RespValue>> {
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(self.parse_value(cursor)?);
        }
        Ok(items)
    }

    fn parse_streamed_elements(&self, cursor: &mut ByteCursor) -> ParseResult<Vec<RespValue>> {
        let mut items = Vec::new();
        while !self.at_stream_end(cursor)? {
            items.push(self.parse_value(cursor)?);
        }
        Ok(items)
    }

    fn parse_pairs(
        &self,
        cursor: &mut ByteCursor,
        count: usize,
    ) -> ParseResult<Vec<(RespValue, RespValue)>> {
        let mut pairs = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let key = self.parse_value(cursor)?;
            let value = self.parse_value(cursor)?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    /// True when the next token is the `.` end marker of a streamed
    /// aggregate; the marker is consumed.
    fn at_stream_end(&self, cursor: &mut ByteCursor) -> ParseResult<bool> {
        if cursor.peek_byte()? != b'.' {
            return Ok(false);
        }
        cursor.read_byte()?;
        let line = cursor.read_line()?;
        if !line.is_empty() {
            return invalid(ParseError::Malformed(
                "end marker with trailing bytes".to_string(),
            ));
        }
        Ok(true)
    }

    /// Chunked body of a `$?` blob: `;n`-prefixed chunks down to the `;0`
    /// terminator, concatenated into a plain bulk string.
    fn parse_streamed_blob(&self, cursor: &mut ByteCursor) -> ParseResult<RespValue> {
        let mut body = BytesMut::new();

        loop {
            let marker = cursor.read_byte()?;
            if marker != b';' {
                return invalid(ParseError::Malformed(format!(
                    "expected chunk marker, got 0x{:02x}",
                    marker
                )));
            }

            let len = match self.read_len(cursor, "chunk length")? {
                LenPrefix::Fixed(len) => len,
                _ => {
                    return invalid(ParseError::BadLength("chunk length".to_string()));
                }
            };

            // Zero-length chunk terminates the stream
            if len == 0 {
                break;
            }

            let chunk = self.read_blob_body(cursor, len)?;
            body.extend_from_slice(&chunk);
        }

        Ok(RespValue::BulkString(Some(body.freeze())))
    }

    fn read_blob_body(&self, cursor: &mut ByteCursor, len: usize) -> ParseResult<Bytes> {
        if len > MAX_BLOB_LEN {
            return invalid(ParseError::BadLength(format!("blob of {} bytes", len)));
        }
        let body = cursor.read_exact(len)?;
        let bytes = Bytes::copy_from_slice(body);
        let tail = cursor.read_exact(2)?;
        if tail != b"\r\n" {
            return invalid(ParseError::MissingCrlf);
        }
        Ok(bytes)
    }
}
