//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands, parse server responses, and convert
//! replies into typed receivers without external dependencies.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Responses are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.
//! 5. **Lost Is Not Malformed**: A stream that ends inside or before a line is an
//!    IO error, so callers can tell a dropped socket from a bad reply.

use std::io::{self, BufRead};

use crate::error::{ClientError, ClientResult};

/// Largest bulk string the server may send (RESP2 `proto-max-bulk-len`).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest element count accepted for one array reply.
const MAX_ARRAY_LEN: i64 = 1 << 32;

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead + ?Sized>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn parse_bulk_len<R: BufRead + ?Sized>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    if len > MAX_BULK_LEN {
        return Err(ClientError::Protocol);
    }
    let len = len as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn parse_array_len<R: BufRead + ?Sized>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<RespValue> {
    // *-1 is the RESP2 null array.
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    if len > MAX_ARRAY_LEN {
        return Err(ClientError::Protocol);
    }

    // Grown as elements arrive; the count alone is not trusted.
    let mut items = Vec::new();
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

fn read_line<R: BufRead + ?Sized>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    reader.read_until(b'\n', buf)?;
    if buf.last() != Some(&b'\n') {
        // Stream ended before the line did.
        return Err(ClientError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by server",
        )));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol);
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
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

/// Converts a non-error reply into a typed receiver.
///
/// Error replies never reach `from_resp`; they are turned into
/// `ClientError::Server` by the command that reads them.
pub trait FromResp: Sized {
    fn from_resp(value: RespValue) -> ClientResult<Self>;
}

impl FromResp for RespValue {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        Ok(value)
    }
}

/// Discards the reply.
impl FromResp for () {
    fn from_resp(_value: RespValue) -> ClientResult<Self> {
        Ok(())
    }
}

impl FromResp for i64 {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        match value {
            RespValue::Integer(n) => Ok(n),
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => {
                parse_i64(&data).map_err(|_| ClientError::UnexpectedResponse)
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

impl FromResp for u64 {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        let n = i64::from_resp(value)?;
        u64::try_from(n).map_err(|_| ClientError::UnexpectedResponse)
    }
}

impl FromResp for bool {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        Ok(i64::from_resp(value)? != 0)
    }
}

impl FromResp for Vec<u8> {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        match value {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => Ok(data),
            RespValue::Integer(n) => Ok(n.to_string().into_bytes()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}

impl FromResp for String {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        let data = Vec::<u8>::from_resp(value)?;
        String::from_utf8(data).map_err(|_| ClientError::UnexpectedResponse)
    }
}

impl<T: FromResp> FromResp for Option<T> {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        match value {
            RespValue::Bulk(None) => Ok(None),
            other => T::from_resp(other).map(Some),
        }
    }
}

impl FromResp for Vec<String> {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        from_array(value)
    }
}

impl FromResp for Vec<i64> {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        from_array(value)
    }
}

impl FromResp for Vec<Option<String>> {
    fn from_resp(value: RespValue) -> ClientResult<Self> {
        from_array(value)
    }
}

fn from_array<T: FromResp>(value: RespValue) -> ClientResult<Vec<T>> {
    match value {
        RespValue::Array(items) => items.into_iter().map(T::from_resp).collect(),
        RespValue::Bulk(None) => Ok(Vec::new()),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

/// Argument of a flat command.
///
/// Lists and maps are flattened into consecutive arguments, so
/// `HSET key {f1: v1, f2: v2}` goes on the wire as `HSET key f1 v1 f2 v2`.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatArg {
    Str(String),
    Bytes(Vec<u8>),
    Int(i64),
    Uint(u64),
    Float(f64),
    /// Written as `1` or `0`.
    Bool(bool),
    List(Vec<FlatArg>),
    Map(Vec<(FlatArg, FlatArg)>),
}

impl FlatArg {
    /// Appends the wire form of this argument to `out`.
    pub fn flatten_into(&self, out: &mut Vec<Vec<u8>>) {
        match self {
            FlatArg::Str(s) => out.push(s.as_bytes().to_vec()),
            FlatArg::Bytes(b) => out.push(b.clone()),
            FlatArg::Int(n) => out.push(n.to_string().into_bytes()),
            FlatArg::Uint(n) => out.push(n.to_string().into_bytes()),
            FlatArg::Float(f) => out.push(f.to_string().into_bytes()),
            FlatArg::Bool(b) => out.push(if *b { b"1".to_vec() } else { b"0".to_vec() }),
            FlatArg::List(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
            FlatArg::Map(pairs) => {
                for (k, v) in pairs {
                    k.flatten_into(out);
                    v.flatten_into(out);
                }
            }
        }
    }
}

impl From<&str> for FlatArg {
    fn from(value: &str) -> Self {
        FlatArg::Str(value.to_string())
    }
}

impl From<String> for FlatArg {
    fn from(value: String) -> Self {
        FlatArg::Str(value)
    }
}

impl From<&[u8]> for FlatArg {
    fn from(value: &[u8]) -> Self {
        FlatArg::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for FlatArg {
    fn from(value: Vec<u8>) -> Self {
        FlatArg::Bytes(value)
    }
}

impl From<i64> for FlatArg {
    fn from(value: i64) -> Self {
        FlatArg::Int(value)
    }
}

impl From<i32> for FlatArg {
    fn from(value: i32) -> Self {
        FlatArg::Int(value as i64)
    }
}

impl From<u32> for FlatArg {
    fn from(value: u32) -> Self {
        FlatArg::Uint(value as u64)
    }
}

impl From<u64> for FlatArg {
    fn from(value: u64) -> Self {
        FlatArg::Uint(value)
    }
}

impl From<usize> for FlatArg {
    fn from(value: usize) -> Self {
        FlatArg::Uint(value as u64)
    }
}

impl From<f64> for FlatArg {
    fn from(value: f64) -> Self {
        FlatArg::Float(value)
    }
}

impl From<bool> for FlatArg {
    fn from(value: bool) -> Self {
        FlatArg::Bool(value)
    }
}

impl From<Vec<FlatArg>> for FlatArg {
    fn from(value: Vec<FlatArg>) -> Self {
        FlatArg::List(value)
    }
}

impl From<Vec<(FlatArg, FlatArg)>> for FlatArg {
    fn from(value: Vec<(FlatArg, FlatArg)>) -> Self {
        FlatArg::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encodes_command() {
        let mut buf = Vec::new();
        encode_command(&[b"GET", b"key"], &mut buf);
        assert_eq!(&buf, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn parses_simple_string() {
        let mut reader = Cursor::new(b"+OK\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, RespValue::Simple(b"OK".to_vec()));
    }

    #[test]
    fn parses_null_bulk_string() {
        let mut reader = Cursor::new(b"$-1\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, RespValue::Bulk(None));
    }

    #[test]
    fn parses_error() {
        let mut reader = Cursor::new(b"-LOADING Redis is loading\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(resp, RespValue::Error(b"LOADING Redis is loading".to_vec()));
    }

    #[test]
    fn parses_nested_array() {
        let mut reader = Cursor::new(b"*2\r\n:1\r\n$3\r\nwew\r\n".to_vec());
        let mut line = Vec::new();
        let resp = read_response(&mut reader, &mut line).unwrap();
        assert_eq!(
            resp,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Bulk(Some(b"wew".to_vec()))
            ])
        );
    }

    #[test]
    fn eof_before_frame_is_io_error() {
        let mut reader = Cursor::new(Vec::new());
        let mut line = Vec::new();
        let err = read_response(&mut reader, &mut line).unwrap_err();
        assert!(matches!(err, ClientError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn truncated_bulk_is_io_error() {
        let mut reader = Cursor::new(b"$5\r\nhe".to_vec());
        let mut line = Vec::new();
        let err = read_response(&mut reader, &mut line).unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[test]
    fn eof_inside_line_is_io_error() {
        let mut reader = Cursor::new(b":4".to_vec());
        let mut line = Vec::new();
        let err = read_response(&mut reader, &mut line).unwrap_err();
        assert!(matches!(err, ClientError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert_eq!(err.class(), crate::error::ErrorClass::Network);
    }

    #[test]
    fn oversized_lengths_are_protocol_errors() {
        let mut line = Vec::new();
        let mut reader = Cursor::new(b"*9223372036854775807\r\n".to_vec());
        assert!(matches!(
            read_response(&mut reader, &mut line),
            Err(ClientError::Protocol)
        ));
        let mut reader = Cursor::new(format!("${}\r\n", MAX_BULK_LEN + 1).into_bytes());
        assert!(matches!(
            read_response(&mut reader, &mut line),
            Err(ClientError::Protocol)
        ));
    }

    #[test]
    fn large_array_count_with_short_body_fails_cleanly() {
        let mut reader = Cursor::new(b"*1000000\r\n:1\r\n".to_vec());
        let mut line = Vec::new();
        let err = read_response(&mut reader, &mut line).unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
    }

    #[test]
    fn missing_crlf_is_protocol_error() {
        let mut reader = Cursor::new(b":42\n".to_vec());
        let mut line = Vec::new();
        let err = read_response(&mut reader, &mut line).unwrap_err();
        assert!(matches!(err, ClientError::Protocol));
    }

    #[test]
    fn converts_receivers() {
        assert_eq!(i64::from_resp(RespValue::Integer(7)).unwrap(), 7);
        assert_eq!(i64::from_resp(RespValue::Bulk(Some(b"-12".to_vec()))).unwrap(), -12);
        assert_eq!(
            String::from_resp(RespValue::Simple(b"OK".to_vec())).unwrap(),
            "OK"
        );
        assert_eq!(Option::<String>::from_resp(RespValue::Bulk(None)).unwrap(), None);
        assert!(bool::from_resp(RespValue::Integer(1)).unwrap());
        assert!(matches!(
            i64::from_resp(RespValue::Simple(b"OK".to_vec())),
            Err(ClientError::UnexpectedResponse)
        ));
        let list = Vec::<String>::from_resp(RespValue::Array(vec![
            RespValue::Bulk(Some(b"a".to_vec())),
            RespValue::Simple(b"b".to_vec()),
        ]))
        .unwrap();
        assert_eq!(list, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn converts_unsigned_and_typed_arrays() {
        assert_eq!(u64::from_resp(RespValue::Integer(9)).unwrap(), 9);
        assert!(matches!(
            u64::from_resp(RespValue::Integer(-1)),
            Err(ClientError::UnexpectedResponse)
        ));

        let counts = Vec::<i64>::from_resp(RespValue::Array(vec![
            RespValue::Integer(1),
            RespValue::Bulk(Some(b"2".to_vec())),
        ]))
        .unwrap();
        assert_eq!(counts, vec![1, 2]);
        assert!(Vec::<i64>::from_resp(RespValue::Bulk(None)).unwrap().is_empty());
        assert!(matches!(
            Vec::<i64>::from_resp(RespValue::Integer(1)),
            Err(ClientError::UnexpectedResponse)
        ));

        let fields = Vec::<Option<String>>::from_resp(RespValue::Array(vec![
            RespValue::Bulk(Some(b"wew".to_vec())),
            RespValue::Bulk(None),
        ]))
        .unwrap();
        assert_eq!(fields, vec![Some("wew".to_string()), None]);
    }

    #[test]
    fn flattens_mixed_args() {
        let args: Vec<FlatArg> = vec![
            5.into(),
            "wew".into(),
            vec![FlatArg::from("a"), FlatArg::from(true)].into(),
            vec![(FlatArg::from("f"), FlatArg::from(1.5))].into(),
        ];
        let mut out = Vec::new();
        for arg in &args {
            arg.flatten_into(&mut out);
        }
        let expected: Vec<Vec<u8>> = vec![
            b"5".to_vec(),
            b"wew".to_vec(),
            b"a".to_vec(),
            b"1".to_vec(),
            b"f".to_vec(),
            b"1.5".to_vec(),
        ];
        assert_eq!(out, expected);
    }
}
