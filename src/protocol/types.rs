use bytes::{BufMut, Bytes, BytesMut};

/// RESP (REdis Serialization Protocol) value types, covering both the
/// RESP2 core and the RESP3 extensions.
///
/// Streamed blobs and streamed aggregates exist only on the wire: the
/// parser folds them into the equivalent fixed-size variant below, so
/// chunk and terminator artifacts never reach callers.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Null: _\r\n (RESP3; RESP2 nulls arrive as null bulk/array)
    Null,

    /// Boolean: #t\r\n or #f\r\n
    Boolean(bool),

    /// Integer: :1000\r\n
    Integer(i64),

    /// Double: ,3.25\r\n, with inf / -inf / nan spelled literally
    Double(f64),

    /// Big number: (3492890328409238509324850943850943825024385\r\n
    BigNumber(String),

    /// Simple String: +OK\r\n
    SimpleString(String),

    /// Error: -Error message\r\n
    Error(String),

    /// Bulk String: $6\r\nfoobar\r\n or $-1\r\n for null
    BulkString(Option<Bytes>),

    /// Bulk Error: !21\r\nSYNTAX invalid syntax\r\n
    BulkError(String),

    /// Verbatim String: =15\r\ntxt:Some string\r\n
    VerbatimString { format: String, data: Bytes },

    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n or *-1\r\n for null
    Array(Option<Vec<RespValue>>),

    /// Map: %1\r\n+key\r\n+value\r\n (ordered key/value pairs)
    Map(Vec<(RespValue, RespValue)>),

    /// Set: ~2\r\n+a\r\n+b\r\n
    Set(Vec<RespValue>),

    /// Push: >2\r\n+message\r\n+hello\r\n (server-initiated, out of band)
    Push(Vec<RespValue>),

    /// Attribute: |1\r\n+ttl\r\n:100\r\n followed by the decorated value.
    /// Side-channel metadata; use [`payload`](Self::payload) to look
    /// through it.
    Attribute {
        attributes: Vec<(RespValue, RespValue)>,
        data: Box<RespValue>,
    },
}

impl RespValue {
    /// Create a simple string value
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Create an error value
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Create an integer value
    pub fn integer(i: i64) -> Self {
        RespValue::Integer(i)
    }

    /// Create a double value
    pub fn double(d: f64) -> Self {
        RespValue::Double(d)
    }

    /// Create a boolean value
    pub fn boolean(b: bool) -> Self {
        RespValue::Boolean(b)
    }

    /// Create a big number value
    pub fn big_number(s: impl Into<String>) -> Self {
        RespValue::BigNumber(s.into())
    }

    /// Create a bulk string value
    pub fn bulk_string(s: impl Into<Bytes>) -> Self {
        RespValue::BulkString(Some(s.into()))
    }

    /// Create a null bulk string value
    pub fn null_bulk_string() -> Self {
        RespValue::BulkString(None)
    }

    /// Create a bulk error value
    pub fn bulk_error(s: impl Into<String>) -> Self {
        RespValue::BulkError(s.into())
    }

    /// Create a verbatim string value
    pub fn verbatim_string(format: impl Into<String>, data: impl Into<Bytes>) -> Self {
        RespValue::VerbatimString {
            format: format.into(),
            data: data.into(),
        }
    }

    /// Create an array value
    pub fn array(arr: Vec<RespValue>) -> Self {
        RespValue::Array(Some(arr))
    }

    /// Create a null array value
    pub fn null_array() -> Self {
        RespValue::Array(None)
    }

    /// Create a map value
    pub fn map(pairs: Vec<(RespValue, RespValue)>) -> Self {
        RespValue::Map(pairs)
    }

    /// Create a set value
    pub fn set(members: Vec<RespValue>) -> Self {
        RespValue::Set(members)
    }

    /// Create a push value
    pub fn push(items: Vec<RespValue>) -> Self {
        RespValue::Push(items)
    }

    /// Create OK
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// The decorated value with any attribute wrappers stripped.
    pub fn payload(&self) -> &RespValue {
        let mut v = self;
        while let RespValue::Attribute { data, .. } = v {
            v = data;
        }
        v
    }

    /// Consuming form of [`payload`](Self::payload).
    pub fn into_payload(self) -> RespValue {
        let mut v = self;
        while let RespValue::Attribute { data, .. } = v {
            v = *data;
        }
        v
    }

    /// Attribute pairs of the outermost wrapper, if any.
    pub fn attributes(&self) -> Option<&[(RespValue, RespValue)]> {
        match self {
            RespValue::Attribute { attributes, .. } => Some(attributes),
            _ => None,
        }
    }

    /// The error text if this value (behind attributes) is an error reply.
    pub fn as_error(&self) -> Option<&str> {
        match self.payload() {
            RespValue::Error(e) => Some(e),
            RespValue::BulkError(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_push(&self) -> bool {
        matches!(self.payload(), RespValue::Push(_))
    }

    /// Integer content, looking through attributes.
    pub fn as_integer(&self) -> Option<i64> {
        match self.payload() {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Raw bytes of a bulk or simple string, looking through attributes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.payload() {
            RespValue::BulkString(Some(b)) => Some(b),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            RespValue::VerbatimString { data, .. } => Some(data),
            _ => None,
        }
    }

    /// UTF-8 view of a bulk or simple string, looking through attributes.
    pub fn as_str(&self) -> Option<&str> {
        match self.payload() {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(Some(b)) => std::str::from_utf8(b).ok(),
            RespValue::VerbatimString { data, .. } => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Array elements, looking through attributes.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self.payload() {
            RespValue::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Serialize to RESP wire bytes.
    ///
    /// Aggregates and blobs always print in fixed-size form; the streamed
    /// encodings are accepted on input only.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Append the wire encoding of this value to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            RespValue::Null => buf.put_slice(b"_\r\n"),
            RespValue::Boolean(true) => buf.put_slice(b"#t\r\n"),
            RespValue::Boolean(false) => buf.put_slice(b"#f\r\n"),
            RespValue::Integer(i) => {
                buf.put_slice(format!(":{}\r\n", i).as_bytes());
            }
            RespValue::Double(d) => {
                buf.put_slice(format!(",{}\r\n", format_double(*d)).as_bytes());
            }
            RespValue::BigNumber(n) => {
                buf.put_slice(format!("({}\r\n", n).as_bytes());
            }
            RespValue::SimpleString(s) => {
                buf.put_slice(format!("+{}\r\n", s).as_bytes());
            }
            RespValue::Error(e) => {
                buf.put_slice(format!("-{}\r\n", e).as_bytes());
            }
            RespValue::BulkString(None) => buf.put_slice(b"$-1\r\n"),
            RespValue::BulkString(Some(s)) => {
                buf.put_slice(format!("${}\r\n", s.len()).as_bytes());
                buf.put_slice(s);
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkError(e) => {
                buf.put_slice(format!("!{}\r\n", e.len()).as_bytes());
                buf.put_slice(e.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::VerbatimString { format, data } => {
                buf.put_slice(format!("={}\r\n", format.len() + 1 + data.len()).as_bytes());
                buf.put_slice(format.as_bytes());
                buf.put_u8(b':');
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::Array(None) => buf.put_slice(b"*-1\r\n"),
            RespValue::Array(Some(items)) => {
                buf.put_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
            RespValue::Map(pairs) => {
                buf.put_slice(format!("%{}\r\n", pairs.len()).as_bytes());
                for (k, v) in pairs {
                    k.encode(buf);
                    v.encode(buf);
                }
            }
            RespValue::Set(members) => {
                buf.put_slice(format!("~{}\r\n", members.len()).as_bytes());
                for member in members {
                    member.encode(buf);
                }
            }
            RespValue::Push(items) => {
                buf.put_slice(format!(">{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
            RespValue::Attribute { attributes, data } => {
                buf.put_slice(format!("|{}\r\n", attributes.len()).as_bytes());
                for (k, v) in attributes {
                    k.encode(buf);
                    v.encode(buf);
                }
                data.encode(buf);
            }
        }
    }
}

/// Wire spelling of a double: literal tokens for the non-finite values,
/// Rust's shortest decimal form otherwise.
fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d == f64::INFINITY {
        "inf".to_string()
    } else if d == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        format!("{}", d)
    }
}
