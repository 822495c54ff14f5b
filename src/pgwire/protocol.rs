//! PostgreSQL v3 frontend encoders and backend message decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

pub const PROTOCOL_VERSION: i32 = 196_608;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
/// Upper bound on a single backend message, length prefix included.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

const AUTH_OK: i32 = 0;
const AUTH_GSS: i32 = 7;
const AUTH_GSS_CONTINUE: i32 = 8;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated {0} message")]
    Truncated(&'static str),
    #[error("invalid UTF-8 in {0} message")]
    Utf8(&'static str),
    #[error("message length {0} out of bounds")]
    Length(usize),
}

/// Fields of an `ErrorResponse` or `NoticeResponse`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: u32,
    pub format: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationGss,
    AuthenticationGssContinue(Bytes),
    /// Any other authentication request, by its code.
    AuthenticationOther(i32),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(u8),
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    ParseComplete,
    BindComplete,
    NoData,
    EmptyQueryResponse,
    Other(u8),
}

fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        Err(ProtocolError::Truncated(what))
    } else {
        Ok(())
    }
}

fn cstring(buf: &mut Bytes, what: &'static str) -> Result<String, ProtocolError> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(ProtocolError::Truncated(what))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::Utf8(what))
}

fn server_error(mut body: Bytes) -> Result<ServerError, ProtocolError> {
    let mut error = ServerError::default();
    while body.has_remaining() {
        let field = body.get_u8();
        if field == 0 {
            break;
        }
        let value = cstring(&mut body, "ErrorResponse")?;
        match field {
            b'V' => error.severity = value,
            b'S' if error.severity.is_empty() => error.severity = value,
            b'C' => error.code = value,
            b'M' => error.message = value,
            _ => {}
        }
    }
    Ok(error)
}

impl BackendMessage {
    /// Decode the body of a message whose tag and length were already read.
    ///
    /// # Errors
    /// Returns an error on truncated or non UTF-8 bodies.
    pub fn parse(tag: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        let message = match tag {
            b'R' => {
                need(&body, 4, "Authentication")?;
                match body.get_i32() {
                    AUTH_OK => Self::AuthenticationOk,
                    AUTH_GSS => Self::AuthenticationGss,
                    AUTH_GSS_CONTINUE => Self::AuthenticationGssContinue(body),
                    other => Self::AuthenticationOther(other),
                }
            }
            b'S' => Self::ParameterStatus {
                name: cstring(&mut body, "ParameterStatus")?,
                value: cstring(&mut body, "ParameterStatus")?,
            },
            b'K' => {
                need(&body, 8, "BackendKeyData")?;
                Self::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                }
            }
            b'Z' => {
                need(&body, 1, "ReadyForQuery")?;
                Self::ReadyForQuery(body.get_u8())
            }
            b'E' => Self::ErrorResponse(server_error(body)?),
            b'N' => Self::NoticeResponse(server_error(body)?),
            b'T' => {
                need(&body, 2, "RowDescription")?;
                let count = body.get_i16();
                let mut fields = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
                for _ in 0..count {
                    let name = cstring(&mut body, "RowDescription")?;
                    need(&body, 18, "RowDescription")?;
                    let _table_oid = body.get_u32();
                    let _column = body.get_i16();
                    let type_oid = body.get_u32();
                    let _type_len = body.get_i16();
                    let _type_mod = body.get_i32();
                    let format = body.get_i16();
                    fields.push(FieldDescription {
                        name,
                        type_oid,
                        format,
                    });
                }
                Self::RowDescription(fields)
            }
            b'D' => {
                need(&body, 2, "DataRow")?;
                let count = body.get_i16();
                let mut values = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
                for _ in 0..count {
                    need(&body, 4, "DataRow")?;
                    let len = body.get_i32();
                    if len < 0 {
                        values.push(None);
                    } else {
                        let len = usize::try_from(len).map_err(|_| ProtocolError::Truncated("DataRow"))?;
                        need(&body, len, "DataRow")?;
                        values.push(Some(body.split_to(len)));
                    }
                }
                Self::DataRow(values)
            }
            b'C' => Self::CommandComplete(cstring(&mut body, "CommandComplete")?),
            b'1' => Self::ParseComplete,
            b'2' => Self::BindComplete,
            b'n' => Self::NoData,
            b'I' => Self::EmptyQueryResponse,
            other => Self::Other(other),
        };
        Ok(message)
    }
}

/// Frontend message encoders. Each appends one complete message to `buf`.
pub mod frontend {
    use super::{PROTOCOL_VERSION, SSL_REQUEST_CODE};
    use bytes::{BufMut, BytesMut};

    fn len_prefix(len: usize) -> i32 {
        i32::try_from(len).unwrap_or(i32::MAX)
    }

    fn message(buf: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
        if let Some(tag) = tag {
            buf.put_u8(tag);
        }
        let start = buf.len();
        buf.put_i32(0);
        body(buf);
        let len = len_prefix(buf.len() - start);
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    fn put_cstr(buf: &mut BytesMut, value: &str) {
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }

    pub fn startup(buf: &mut BytesMut, params: &[(&str, &str)]) {
        message(buf, None, |buf| {
            buf.put_i32(PROTOCOL_VERSION);
            for (name, value) in params {
                put_cstr(buf, name);
                put_cstr(buf, value);
            }
            buf.put_u8(0);
        });
    }

    pub fn ssl_request(buf: &mut BytesMut) {
        message(buf, None, |buf| buf.put_i32(SSL_REQUEST_CODE));
    }

    pub fn gss_response(buf: &mut BytesMut, token: &[u8]) {
        message(buf, Some(b'p'), |buf| buf.put_slice(token));
    }

    pub fn parse(buf: &mut BytesMut, statement: &str, query: &str) {
        message(buf, Some(b'P'), |buf| {
            put_cstr(buf, statement);
            put_cstr(buf, query);
            buf.put_i16(0);
        });
    }

    /// Bind text-format parameters; results are requested in text format.
    pub fn bind(buf: &mut BytesMut, portal: &str, statement: &str, params: &[Option<&str>]) {
        message(buf, Some(b'B'), |buf| {
            put_cstr(buf, portal);
            put_cstr(buf, statement);
            buf.put_i16(0);
            buf.put_i16(i16::try_from(params.len()).unwrap_or(i16::MAX));
            for param in params {
                match param {
                    Some(value) => {
                        buf.put_i32(len_prefix(value.len()));
                        buf.put_slice(value.as_bytes());
                    }
                    None => buf.put_i32(-1),
                }
            }
            buf.put_i16(0);
        });
    }

    pub fn describe_portal(buf: &mut BytesMut, portal: &str) {
        message(buf, Some(b'D'), |buf| {
            buf.put_u8(b'P');
            put_cstr(buf, portal);
        });
    }

    pub fn execute(buf: &mut BytesMut, portal: &str) {
        message(buf, Some(b'E'), |buf| {
            put_cstr(buf, portal);
            buf.put_i32(0);
        });
    }

    pub fn sync(buf: &mut BytesMut) {
        message(buf, Some(b'S'), |_| {});
    }

    pub fn terminate(buf: &mut BytesMut) {
        message(buf, Some(b'X'), |_| {});
    }
}

/// Backend encoders for the in-process test server.
#[cfg(test)]
pub(crate) mod backend {
    use super::*;

    fn message(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
        buf.put_u8(tag);
        let start = buf.len();
        buf.put_i32(0);
        body(buf);
        let len = i32::try_from(buf.len() - start).unwrap_or(i32::MAX);
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    pub(crate) fn auth(buf: &mut BytesMut, code: i32, data: &[u8]) {
        message(buf, b'R', |buf| {
            buf.put_i32(code);
            buf.put_slice(data);
        });
    }

    pub(crate) fn parameter_status(buf: &mut BytesMut, name: &str, value: &str) {
        message(buf, b'S', |buf| {
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        });
    }

    pub(crate) fn ready(buf: &mut BytesMut) {
        message(buf, b'Z', |buf| buf.put_u8(b'I'));
    }

    pub(crate) fn error(buf: &mut BytesMut, code: &str, text: &str) {
        message(buf, b'E', |buf| {
            for (field, value) in [(b'S', "FATAL"), (b'V', "FATAL"), (b'C', code), (b'M', text)] {
                buf.put_u8(field);
                buf.put_slice(value.as_bytes());
                buf.put_u8(0);
            }
            buf.put_u8(0);
        });
    }

    pub(crate) fn row_description(buf: &mut BytesMut, columns: &[(&str, u32)]) {
        message(buf, b'T', |buf| {
            buf.put_i16(i16::try_from(columns.len()).unwrap_or(0));
            for (name, oid) in columns {
                buf.put_slice(name.as_bytes());
                buf.put_u8(0);
                buf.put_u32(0);
                buf.put_i16(0);
                buf.put_u32(*oid);
                buf.put_i16(-1);
                buf.put_i32(-1);
                buf.put_i16(0);
            }
        });
    }

    pub(crate) fn data_row(buf: &mut BytesMut, values: &[Option<&str>]) {
        message(buf, b'D', |buf| {
            buf.put_i16(i16::try_from(values.len()).unwrap_or(0));
            for value in values {
                match value {
                    Some(v) => {
                        buf.put_i32(i32::try_from(v.len()).unwrap_or(0));
                        buf.put_slice(v.as_bytes());
                    }
                    None => buf.put_i32(-1),
                }
            }
        });
    }

    pub(crate) fn simple(buf: &mut BytesMut, tag: u8) {
        message(buf, tag, |_| {});
    }

    pub(crate) fn command_complete(buf: &mut BytesMut, tag: &str) {
        message(buf, b'C', |buf| {
            buf.put_slice(tag.as_bytes());
            buf.put_u8(0);
        });
    }
}
