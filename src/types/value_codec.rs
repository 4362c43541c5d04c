//! Per-OID value codec: four paths per type (text/binary × encode/decode).
//! Encoding turns a backend value into wire bytes for a result column;
//! decoding turns a bound parameter into a backend value.

use super::datetime;
use super::numeric;
use super::PgType;
use crate::backend::BackendValue;
use crate::config::TextFormat;
use crate::PgBridgeError;
use byteorder::{BigEndian, ByteOrder};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Binary,
}

impl Format {
    pub fn from_code(code: i16) -> Result<Format, PgBridgeError> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(PgBridgeError::Protocol(format!(
                "invalid format code {other}"
            ))),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }
}

fn text_err(message: impl Into<String>) -> PgBridgeError {
    PgBridgeError::TextCodec(message.into())
}

fn binary_err(message: impl Into<String>) -> PgBridgeError {
    PgBridgeError::BinaryCodec(message.into())
}

/// Encode one result value for the wire. `None` is the SQL NULL marker
/// (written as length -1 by the codec).
pub fn encode_value(
    value: &BackendValue,
    ty: PgType,
    format: Format,
    text_format: TextFormat,
) -> Result<Option<Vec<u8>>, PgBridgeError> {
    if value.is_null() {
        return Ok(None);
    }
    let bytes = match format {
        Format::Text => encode_text(value, ty, text_format)?,
        Format::Binary => encode_binary(value, ty)?,
    };
    Ok(Some(bytes))
}

fn encode_text(
    value: &BackendValue,
    ty: PgType,
    text_format: TextFormat,
) -> Result<Vec<u8>, PgBridgeError> {
    let out = match ty {
        PgType::Bool => {
            let b = coerce_bool(value).map_err(text_err)?;
            match (text_format, b) {
                (TextFormat::Postgresql, true) => "t".to_string(),
                (TextFormat::Postgresql, false) => "f".to_string(),
                (TextFormat::Spanner, true) => "true".to_string(),
                (TextFormat::Spanner, false) => "false".to_string(),
            }
        }
        PgType::Int2 => coerce_int(value, i16::MIN as i64, i16::MAX as i64, "smallint")
            .map_err(text_err)?
            .to_string(),
        PgType::Int4 => coerce_int(value, i32::MIN as i64, i32::MAX as i64, "integer")
            .map_err(text_err)?
            .to_string(),
        PgType::Int8 => coerce_int(value, i64::MIN, i64::MAX, "bigint")
            .map_err(text_err)?
            .to_string(),
        PgType::Float4 | PgType::Float8 => coerce_float(value).map_err(text_err)?.to_string(),
        PgType::Numeric => numeric::numeric_to_text(&coerce_numeric(value).map_err(text_err)?),
        PgType::Bytea => bytea_to_hex(&coerce_bytes(value).map_err(text_err)?),
        PgType::Date => datetime::date_to_text(coerce_date(value).map_err(text_err)?),
        PgType::Timestamp => {
            let ts = coerce_timestamp(value).map_err(text_err)?;
            match text_format {
                TextFormat::Postgresql => format!("{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
                TextFormat::Spanner => datetime::timestamp_to_backend_text(ts),
            }
        }
        PgType::Timestamptz => {
            let ts = coerce_timestamp(value).map_err(text_err)?;
            match text_format {
                TextFormat::Postgresql => datetime::timestamp_to_pg_text(ts),
                TextFormat::Spanner => datetime::timestamp_to_backend_text(ts),
            }
        }
        PgType::Text | PgType::Varchar | PgType::Unknown => value_to_text(value, text_format),
    };
    Ok(out.into_bytes())
}

fn encode_binary(value: &BackendValue, ty: PgType) -> Result<Vec<u8>, PgBridgeError> {
    let out = match ty {
        PgType::Bool => vec![coerce_bool(value).map_err(binary_err)? as u8],
        PgType::Int2 => coerce_int(value, i16::MIN as i64, i16::MAX as i64, "smallint")
            .map_err(binary_err)?
            .to_be_bytes()[6..]
            .to_vec(),
        PgType::Int4 => coerce_int(value, i32::MIN as i64, i32::MAX as i64, "integer")
            .map_err(binary_err)?
            .to_be_bytes()[4..]
            .to_vec(),
        PgType::Int8 => coerce_int(value, i64::MIN, i64::MAX, "bigint")
            .map_err(binary_err)?
            .to_be_bytes()
            .to_vec(),
        PgType::Float4 => (coerce_float(value).map_err(binary_err)? as f32)
            .to_be_bytes()
            .to_vec(),
        PgType::Float8 => coerce_float(value)
            .map_err(binary_err)?
            .to_be_bytes()
            .to_vec(),
        PgType::Numeric => numeric::encode_numeric(&coerce_numeric(value).map_err(binary_err)?),
        PgType::Bytea => coerce_bytes(value).map_err(binary_err)?,
        PgType::Date => datetime::date_to_pg_days(coerce_date(value).map_err(binary_err)?)
            .to_be_bytes()
            .to_vec(),
        PgType::Timestamp | PgType::Timestamptz => {
            let ts = coerce_timestamp(value).map_err(binary_err)?;
            datetime::timestamp_to_pg_micros(ts)
                .map_err(binary_err)?
                .to_be_bytes()
                .to_vec()
        }
        // Binary and text are the same representation for character types.
        PgType::Text | PgType::Varchar | PgType::Unknown => {
            value_to_text(value, TextFormat::Postgresql).into_bytes()
        }
    };
    Ok(out)
}

/// Decode one bound parameter. OID 0 (or an OID outside the supported set)
/// falls back to text semantics, letting the backend decide.
pub fn decode_parameter(
    bytes: Option<&[u8]>,
    oid: i32,
    format: Format,
) -> Result<BackendValue, PgBridgeError> {
    let bytes = match bytes {
        None => return Ok(BackendValue::Null),
        Some(b) => b,
    };
    let ty = PgType::from_oid(oid).unwrap_or(PgType::Unknown);
    match format {
        Format::Text => decode_text_parameter(bytes, ty),
        Format::Binary => decode_binary_parameter(bytes, ty),
    }
}

fn decode_text_parameter(bytes: &[u8], ty: PgType) -> Result<BackendValue, PgBridgeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| PgBridgeError::InvalidUtf8)?;
    let value = match ty {
        PgType::Bool => match text.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "1" | "on" | "yes" => BackendValue::Bool(true),
            "f" | "false" | "0" | "off" | "no" => BackendValue::Bool(false),
            _ => {
                return Err(text_err(format!(
                    "invalid input syntax for type boolean: \"{text}\""
                )))
            }
        },
        PgType::Int2 | PgType::Int4 | PgType::Int8 => BackendValue::Int64(
            text.trim()
                .parse::<i64>()
                .map_err(|_| text_err(format!("invalid input syntax for type {}: \"{text}\"", ty.name())))?,
        ),
        PgType::Float4 | PgType::Float8 => BackendValue::Float64(
            text.trim()
                .parse::<f64>()
                .map_err(|_| text_err(format!("invalid input syntax for type {}: \"{text}\"", ty.name())))?,
        ),
        PgType::Numeric => {
            BackendValue::Numeric(numeric::numeric_from_text(text.trim()).map_err(text_err)?)
        }
        PgType::Bytea => BackendValue::Bytes(bytea_from_hex(text.trim()).map_err(text_err)?),
        PgType::Date => {
            BackendValue::Date(datetime::date_from_text(text.trim()).map_err(text_err)?)
        }
        PgType::Timestamp | PgType::Timestamptz => {
            BackendValue::Timestamp(datetime::timestamp_from_text(text.trim()).map_err(text_err)?)
        }
        PgType::Text | PgType::Varchar | PgType::Unknown => BackendValue::Text(text.to_string()),
    };
    Ok(value)
}

fn decode_binary_parameter(bytes: &[u8], ty: PgType) -> Result<BackendValue, PgBridgeError> {
    fn expect_len(bytes: &[u8], len: usize, ty: PgType) -> Result<(), PgBridgeError> {
        if bytes.len() != len {
            return Err(binary_err(format!(
                "incorrect binary data size for type {} ({} bytes)",
                ty.name(),
                bytes.len()
            )));
        }
        Ok(())
    }

    let value = match ty {
        PgType::Bool => {
            expect_len(bytes, 1, ty)?;
            BackendValue::Bool(bytes[0] != 0)
        }
        PgType::Int2 => {
            expect_len(bytes, 2, ty)?;
            BackendValue::Int64(BigEndian::read_i16(bytes) as i64)
        }
        PgType::Int4 => {
            expect_len(bytes, 4, ty)?;
            BackendValue::Int64(BigEndian::read_i32(bytes) as i64)
        }
        PgType::Int8 => {
            expect_len(bytes, 8, ty)?;
            BackendValue::Int64(BigEndian::read_i64(bytes))
        }
        PgType::Float4 => {
            expect_len(bytes, 4, ty)?;
            BackendValue::Float64(BigEndian::read_f32(bytes) as f64)
        }
        PgType::Float8 => {
            expect_len(bytes, 8, ty)?;
            BackendValue::Float64(BigEndian::read_f64(bytes))
        }
        PgType::Numeric => {
            BackendValue::Numeric(numeric::decode_numeric(bytes).map_err(binary_err)?)
        }
        PgType::Bytea => BackendValue::Bytes(bytes.to_vec()),
        PgType::Date => {
            expect_len(bytes, 4, ty)?;
            BackendValue::Date(
                datetime::date_from_pg_days(BigEndian::read_i32(bytes)).map_err(binary_err)?,
            )
        }
        PgType::Timestamp | PgType::Timestamptz => {
            expect_len(bytes, 8, ty)?;
            BackendValue::Timestamp(
                datetime::timestamp_from_pg_micros(BigEndian::read_i64(bytes))
                    .map_err(binary_err)?,
            )
        }
        PgType::Text | PgType::Varchar | PgType::Unknown => BackendValue::Text(
            String::from_utf8(bytes.to_vec()).map_err(|_| PgBridgeError::InvalidUtf8)?,
        ),
    };
    Ok(value)
}

/// Render any value as text, used for text/unknown target columns.
pub fn value_to_text(value: &BackendValue, text_format: TextFormat) -> String {
    match value {
        BackendValue::Null => String::new(),
        BackendValue::Bool(b) => match (text_format, b) {
            (TextFormat::Postgresql, true) => "t".to_string(),
            (TextFormat::Postgresql, false) => "f".to_string(),
            (TextFormat::Spanner, true) => "true".to_string(),
            (TextFormat::Spanner, false) => "false".to_string(),
        },
        BackendValue::Int64(i) => i.to_string(),
        BackendValue::Float64(f) => f.to_string(),
        BackendValue::Numeric(d) => numeric::numeric_to_text(d),
        BackendValue::Text(s) => s.clone(),
        BackendValue::Bytes(b) => bytea_to_hex(b),
        BackendValue::Date(d) => datetime::date_to_text(*d),
        BackendValue::Timestamp(ts) => match text_format {
            TextFormat::Postgresql => datetime::timestamp_to_pg_text(*ts),
            TextFormat::Spanner => datetime::timestamp_to_backend_text(*ts),
        },
    }
}

fn coerce_bool(value: &BackendValue) -> Result<bool, String> {
    match value {
        BackendValue::Bool(b) => Ok(*b),
        BackendValue::Int64(i) => Ok(*i != 0),
        other => Err(format!("cannot encode {other:?} as boolean")),
    }
}

fn coerce_int(value: &BackendValue, min: i64, max: i64, name: &str) -> Result<i64, String> {
    let i = match value {
        BackendValue::Int64(i) => *i,
        BackendValue::Bool(b) => *b as i64,
        BackendValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("cannot encode \"{s}\" as {name}"))?,
        other => return Err(format!("cannot encode {other:?} as {name}")),
    };
    if i < min || i > max {
        return Err(format!("value {i} out of range for type {name}"));
    }
    Ok(i)
}

fn coerce_float(value: &BackendValue) -> Result<f64, String> {
    match value {
        BackendValue::Float64(f) => Ok(*f),
        BackendValue::Int64(i) => Ok(*i as f64),
        other => Err(format!("cannot encode {other:?} as double precision")),
    }
}

fn coerce_numeric(value: &BackendValue) -> Result<Decimal, String> {
    match value {
        BackendValue::Numeric(d) => Ok(*d),
        BackendValue::Int64(i) => Ok(Decimal::from(*i)),
        BackendValue::Float64(f) => {
            Decimal::from_f64(*f).ok_or_else(|| format!("cannot encode {f} as numeric"))
        }
        BackendValue::Text(s) => numeric::numeric_from_text(s.trim()),
        other => Err(format!("cannot encode {other:?} as numeric")),
    }
}

fn coerce_bytes(value: &BackendValue) -> Result<Vec<u8>, String> {
    match value {
        BackendValue::Bytes(b) => Ok(b.clone()),
        BackendValue::Text(s) if s.starts_with("\\x") => bytea_from_hex(s),
        BackendValue::Text(s) => Ok(s.as_bytes().to_vec()),
        other => Err(format!("cannot encode {other:?} as bytea")),
    }
}

fn coerce_date(value: &BackendValue) -> Result<chrono::NaiveDate, String> {
    match value {
        BackendValue::Date(d) => Ok(*d),
        BackendValue::Timestamp(ts) => Ok(ts.date_naive()),
        BackendValue::Text(s) => datetime::date_from_text(s.trim()),
        other => Err(format!("cannot encode {other:?} as date")),
    }
}

fn coerce_timestamp(value: &BackendValue) -> Result<chrono::DateTime<chrono::Utc>, String> {
    match value {
        BackendValue::Timestamp(ts) => Ok(*ts),
        BackendValue::Date(d) => Ok(d.and_time(chrono::NaiveTime::MIN).and_utc()),
        BackendValue::Text(s) => datetime::timestamp_from_text(s.trim()),
        other => Err(format!("cannot encode {other:?} as timestamp")),
    }
}

fn bytea_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn bytea_from_hex(text: &str) -> Result<Vec<u8>, String> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| format!("invalid input syntax for type bytea: \"{text}\""))?;
    if hex.len() % 2 != 0 {
        return Err("invalid hexadecimal data: odd number of digits".to_string());
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let high = (chunk[0] as char)
            .to_digit(16)
            .ok_or_else(|| format!("invalid hexadecimal digit: \"{}\"", chunk[0] as char))?;
        let low = (chunk[1] as char)
            .to_digit(16)
            .ok_or_else(|| format!("invalid hexadecimal digit: \"{}\"", chunk[1] as char))?;
        out.push((high * 16 + low) as u8);
    }
    Ok(out)
}
