use super::messages::*;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Protocol version for 3.0, the only version this proxy speaks.
pub const PROTOCOL_VERSION_3: i32 = 196608;
/// Special startup codes (1234 in the high 16 bits).
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const GSS_ENC_REQUEST_CODE: i32 = 80877104;

/// Upper bound on a single frontend message. Anything larger is treated as
/// a framing error rather than buffered.
const MAX_MESSAGE_LEN: usize = 1 << 30;
/// Startup packets are small; a huge length here means the peer is not
/// speaking the PostgreSQL protocol at all.
const MAX_STARTUP_LEN: usize = 1 << 20;

#[derive(Debug, Clone)]
enum CodecState {
    /// Waiting for a startup packet. SSL/GSSENC refusals keep the codec in
    /// this state so the client can retry plaintext startup on the same
    /// socket.
    Startup,
    Normal,
}

#[derive(Clone)]
pub struct PostgresCodec {
    state: CodecState,
}

impl PostgresCodec {
    pub fn new() -> Self {
        PostgresCodec {
            state: CodecState::Startup,
        }
    }
}

impl Default for PostgresCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PostgresCodec {
    type Item = FrontendMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<FrontendMessage>> {
        match self.state {
            CodecState::Startup => {
                let msg = decode_startup(src)?;
                if let Some(FrontendMessage::StartupMessage(_)) = msg {
                    self.state = CodecState::Normal;
                }
                Ok(msg)
            }
            CodecState::Normal => decode_message(src),
        }
    }
}

impl Encoder<BackendMessage> for PostgresCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: BackendMessage, dst: &mut BytesMut) -> io::Result<()> {
        trace!("encoding {:?}", msg);
        match msg {
            BackendMessage::Authentication(auth) => encode_authentication(auth, dst),
            BackendMessage::ParameterStatus { name, value } => {
                encode_parameter_status(&name, &value, dst)
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => encode_backend_key_data(process_id, secret_key, dst),
            BackendMessage::ReadyForQuery { status } => encode_ready_for_query(status, dst),
            BackendMessage::RowDescription(fields) => encode_row_description(&fields, dst),
            BackendMessage::DataRow(values) => encode_data_row(&values, dst),
            BackendMessage::CommandComplete { tag } => encode_command_complete(&tag, dst),
            BackendMessage::EmptyQueryResponse => encode_empty(b'I', dst),
            BackendMessage::ErrorResponse(err) => encode_error_fields(b'E', &err, dst),
            BackendMessage::NoticeResponse(notice) => encode_error_fields(b'N', &notice, dst),
            BackendMessage::ParseComplete => encode_empty(b'1', dst),
            BackendMessage::BindComplete => encode_empty(b'2', dst),
            BackendMessage::CloseComplete => encode_empty(b'3', dst),
            BackendMessage::PortalSuspended => encode_empty(b's', dst),
            BackendMessage::NoData => encode_empty(b'n', dst),
            BackendMessage::ParameterDescription(oids) => encode_parameter_description(&oids, dst),
        }
        Ok(())
    }
}

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn decode_startup(src: &mut BytesMut) -> io::Result<Option<FrontendMessage>> {
    if src.len() < 8 {
        return Ok(None);
    }

    let len = (&src[0..4]).get_i32();
    if len < 8 || len as usize > MAX_STARTUP_LEN {
        return Err(protocol_error(format!("invalid startup packet length {len}")));
    }
    if src.len() < len as usize {
        return Ok(None);
    }

    let frame = src.split_to(len as usize);
    let mut buf = &frame[4..];
    let code = buf.get_i32();

    match code {
        SSL_REQUEST_CODE => Ok(Some(FrontendMessage::SslRequest)),
        GSS_ENC_REQUEST_CODE => Ok(Some(FrontendMessage::GssEncRequest)),
        CANCEL_REQUEST_CODE => {
            if buf.remaining() < 8 {
                return Err(protocol_error("truncated cancel request"));
            }
            let process_id = buf.get_i32();
            let secret_key = buf.get_i32();
            Ok(Some(FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            }))
        }
        version => {
            // Only 3.x startup payloads carry the key/value parameter list;
            // the handler rejects other versions with a FATAL 08P01.
            let mut parameters = HashMap::new();
            if version >> 16 == 3 {
                while buf.has_remaining() && buf[0] != 0 {
                    let key = read_cstring(&mut buf)?;
                    let value = read_cstring(&mut buf)?;
                    parameters.insert(key, value);
                }
            }
            Ok(Some(FrontendMessage::StartupMessage(StartupMessage {
                protocol_version: version,
                parameters,
            })))
        }
    }
}

fn decode_message(src: &mut BytesMut) -> io::Result<Option<FrontendMessage>> {
    if src.len() < 5 {
        return Ok(None);
    }

    let tag = src[0];
    let len = (&src[1..5]).get_i32();
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(protocol_error(format!(
            "invalid message length {len} for tag '{}'",
            tag as char
        )));
    }
    if src.len() < len as usize + 1 {
        return Ok(None);
    }

    let frame = src.split_to(len as usize + 1);
    let mut buf = &frame[5..];

    match tag {
        b'Q' => Ok(Some(FrontendMessage::Query(read_cstring(&mut buf)?))),
        b'p' => Ok(Some(FrontendMessage::Password(read_cstring(&mut buf)?))),
        b'P' => {
            let name = read_cstring(&mut buf)?;
            let query = read_cstring(&mut buf)?;
            let count = read_i16(&mut buf)?;
            let mut param_types = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                param_types.push(read_i32(&mut buf)?);
            }
            Ok(Some(FrontendMessage::Parse {
                name,
                query,
                param_types,
            }))
        }
        b'B' => decode_bind(&mut buf),
        b'E' => {
            let portal = read_cstring(&mut buf)?;
            let max_rows = read_i32(&mut buf)?;
            Ok(Some(FrontendMessage::Execute { portal, max_rows }))
        }
        b'D' => {
            let typ = read_u8(&mut buf)?;
            let name = read_cstring(&mut buf)?;
            Ok(Some(FrontendMessage::Describe { typ, name }))
        }
        b'C' => {
            let typ = read_u8(&mut buf)?;
            let name = read_cstring(&mut buf)?;
            Ok(Some(FrontendMessage::Close { typ, name }))
        }
        b'S' => Ok(Some(FrontendMessage::Sync)),
        b'H' => Ok(Some(FrontendMessage::Flush)),
        b'X' => Ok(Some(FrontendMessage::Terminate)),
        b'F' | b'd' | b'c' | b'f' => Ok(Some(FrontendMessage::Unsupported { tag })),
        _ => Err(protocol_error(format!(
            "unknown message type '{}'",
            tag as char
        ))),
    }
}

fn decode_bind(buf: &mut &[u8]) -> io::Result<Option<FrontendMessage>> {
    let portal = read_cstring(buf)?;
    let statement = read_cstring(buf)?;

    let format_count = read_i16(buf)?;
    let mut formats = Vec::with_capacity(format_count.max(0) as usize);
    for _ in 0..format_count {
        formats.push(read_i16(buf)?);
    }

    let value_count = read_i16(buf)?;
    let mut values = Vec::with_capacity(value_count.max(0) as usize);
    for _ in 0..value_count {
        let len = read_i32(buf)?;
        if len == -1 {
            values.push(None);
        } else {
            if len < 0 || buf.remaining() < len as usize {
                return Err(protocol_error("truncated bind parameter"));
            }
            let mut value = vec![0u8; len as usize];
            buf.copy_to_slice(&mut value);
            values.push(Some(value));
        }
    }

    let result_format_count = read_i16(buf)?;
    let mut result_formats = Vec::with_capacity(result_format_count.max(0) as usize);
    for _ in 0..result_format_count {
        result_formats.push(read_i16(buf)?);
    }

    Ok(Some(FrontendMessage::Bind {
        portal,
        statement,
        formats,
        values,
        result_formats,
    }))
}

fn encode_authentication(auth: AuthenticationMessage, dst: &mut BytesMut) {
    dst.put_u8(b'R');
    dst.put_i32(8);
    match auth {
        AuthenticationMessage::Ok => dst.put_i32(0),
        AuthenticationMessage::CleartextPassword => dst.put_i32(3),
    }
}

fn encode_parameter_status(name: &str, value: &str, dst: &mut BytesMut) {
    dst.put_u8(b'S');
    let len_pos = dst.len();
    dst.put_i32(0);
    put_cstring(dst, name);
    put_cstring(dst, value);
    update_length(dst, len_pos);
}

fn encode_backend_key_data(process_id: i32, secret_key: i32, dst: &mut BytesMut) {
    dst.put_u8(b'K');
    dst.put_i32(12);
    dst.put_i32(process_id);
    dst.put_i32(secret_key);
}

fn encode_ready_for_query(status: TransactionStatus, dst: &mut BytesMut) {
    dst.put_u8(b'Z');
    dst.put_i32(5);
    dst.put_u8(status.as_byte());
}

fn encode_row_description(fields: &[FieldDescription], dst: &mut BytesMut) {
    dst.put_u8(b'T');
    let len_pos = dst.len();
    dst.put_i32(0);
    dst.put_i16(fields.len() as i16);
    for field in fields {
        put_cstring(dst, &field.name);
        dst.put_i32(field.table_oid);
        dst.put_i16(field.column_id);
        dst.put_i32(field.type_oid);
        dst.put_i16(field.type_size);
        dst.put_i32(field.type_modifier);
        dst.put_i16(field.format);
    }
    update_length(dst, len_pos);
}

fn encode_data_row(values: &[Option<Vec<u8>>], dst: &mut BytesMut) {
    dst.put_u8(b'D');
    let len_pos = dst.len();
    dst.put_i32(0);
    dst.put_i16(values.len() as i16);
    for value in values {
        match value {
            // NULL is length -1 on the wire, never an empty body.
            None => dst.put_i32(-1),
            Some(data) => {
                dst.put_i32(data.len() as i32);
                dst.put_slice(data);
            }
        }
    }
    update_length(dst, len_pos);
}

fn encode_command_complete(tag: &str, dst: &mut BytesMut) {
    dst.put_u8(b'C');
    let len_pos = dst.len();
    dst.put_i32(0);
    put_cstring(dst, tag);
    update_length(dst, len_pos);
}

fn encode_empty(tag: u8, dst: &mut BytesMut) {
    dst.put_u8(tag);
    dst.put_i32(4);
}

fn encode_error_fields(tag: u8, err: &ErrorResponse, dst: &mut BytesMut) {
    dst.put_u8(tag);
    let len_pos = dst.len();
    dst.put_i32(0);

    dst.put_u8(b'S');
    put_cstring(dst, &err.severity);
    dst.put_u8(b'V');
    put_cstring(dst, &err.severity);
    dst.put_u8(b'C');
    put_cstring(dst, &err.code);
    dst.put_u8(b'M');
    put_cstring(dst, &err.message);

    if let Some(ref detail) = err.detail {
        dst.put_u8(b'D');
        put_cstring(dst, detail);
    }
    if let Some(ref hint) = err.hint {
        dst.put_u8(b'H');
        put_cstring(dst, hint);
    }
    if let Some(position) = err.position {
        dst.put_u8(b'P');
        put_cstring(dst, &position.to_string());
    }
    if let Some(ref where_) = err.where_ {
        dst.put_u8(b'W');
        put_cstring(dst, where_);
    }

    dst.put_u8(0);
    update_length(dst, len_pos);
}

fn encode_parameter_description(oids: &[i32], dst: &mut BytesMut) {
    dst.put_u8(b't');
    let len_pos = dst.len();
    dst.put_i32(0);
    dst.put_i16(oids.len() as i16);
    for oid in oids {
        dst.put_i32(*oid);
    }
    update_length(dst, len_pos);
}

fn read_u8(buf: &mut &[u8]) -> io::Result<u8> {
    if !buf.has_remaining() {
        return Err(protocol_error("unexpected end of message"));
    }
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut &[u8]) -> io::Result<i16> {
    if buf.remaining() < 2 {
        return Err(protocol_error("unexpected end of message"));
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut &[u8]) -> io::Result<i32> {
    if buf.remaining() < 4 {
        return Err(protocol_error("unexpected end of message"));
    }
    Ok(buf.get_i32())
}

fn read_cstring(buf: &mut &[u8]) -> io::Result<String> {
    let null_pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| protocol_error("missing null terminator"))?;
    let string = String::from_utf8(buf[..null_pos].to_vec())
        .map_err(|_| protocol_error("invalid UTF-8 in message"))?;
    *buf = &buf[null_pos + 1..];
    Ok(string)
}

fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

fn update_length(dst: &mut BytesMut, len_pos: usize) {
    let len = (dst.len() - len_pos) as i32;
    dst[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}
