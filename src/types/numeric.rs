//! PostgreSQL `numeric` binary format: a header of ndigits, weight, sign
//! and dscale followed by base-10000 digit groups, most significant first.
//! Weight counts base-10000 positions of the first group relative to the
//! decimal point.

use rust_decimal::Decimal;
use std::str::FromStr;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// Encode a decimal into the PostgreSQL numeric wire layout.
pub fn encode_numeric(value: &Decimal) -> Vec<u8> {
    let dscale = value.scale() as i16;
    let sign = if value.is_sign_negative() && !value.is_zero() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };

    let text = value.abs().to_string();
    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i, f),
        None => (text.as_str(), ""),
    };
    let int_part = int_part.trim_start_matches('0');

    // Align both halves to 4-decimal-digit groups around the decimal point.
    let mut aligned = String::new();
    let lead = (4 - int_part.len() % 4) % 4;
    for _ in 0..lead {
        aligned.push('0');
    }
    aligned.push_str(int_part);
    let int_groups = aligned.len() / 4;
    aligned.push_str(frac_part);
    while aligned.len() % 4 != 0 {
        aligned.push('0');
    }

    let mut digits: Vec<i16> = aligned
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            chunk
                .iter()
                .fold(0i16, |acc, b| acc * 10 + (*b - b'0') as i16)
        })
        .collect();

    let mut weight = int_groups as i16 - 1;
    while digits.first() == Some(&0) {
        digits.remove(0);
        weight -= 1;
    }
    while digits.last() == Some(&0) {
        digits.pop();
    }
    if digits.is_empty() {
        weight = 0;
    }

    let mut out = Vec::with_capacity(8 + digits.len() * 2);
    out.extend_from_slice(&(digits.len() as i16).to_be_bytes());
    out.extend_from_slice(&weight.to_be_bytes());
    out.extend_from_slice(&sign.to_be_bytes());
    out.extend_from_slice(&dscale.to_be_bytes());
    for digit in digits {
        out.extend_from_slice(&digit.to_be_bytes());
    }
    out
}

/// Decode the PostgreSQL numeric wire layout into a decimal.
pub fn decode_numeric(bytes: &[u8]) -> Result<Decimal, String> {
    if bytes.len() < 8 {
        return Err("numeric value too short".to_string());
    }
    let ndigits = i16::from_be_bytes([bytes[0], bytes[1]]);
    let weight = i16::from_be_bytes([bytes[2], bytes[3]]);
    let sign = u16::from_be_bytes([bytes[4], bytes[5]]);
    let dscale = i16::from_be_bytes([bytes[6], bytes[7]]);

    if sign == NUMERIC_NAN {
        return Err("NaN is not a supported numeric value".to_string());
    }
    if sign != NUMERIC_POS && sign != NUMERIC_NEG {
        return Err(format!("invalid numeric sign {sign:#06x}"));
    }
    if ndigits < 0 || dscale < 0 {
        return Err("invalid numeric header".to_string());
    }
    if bytes.len() < 8 + ndigits as usize * 2 {
        return Err("numeric digit groups truncated".to_string());
    }

    let mut mantissa: i128 = 0;
    for i in 0..ndigits as usize {
        let group = i16::from_be_bytes([bytes[8 + i * 2], bytes[9 + i * 2]]);
        if !(0..10000).contains(&group) {
            return Err(format!("numeric digit group {group} out of range"));
        }
        mantissa = mantissa
            .checked_mul(10000)
            .and_then(|m| m.checked_add(group as i128))
            .ok_or_else(|| "numeric value out of range".to_string())?;
    }

    // The last stored group sits at base-10000 position weight-(ndigits-1).
    let exp4 = if ndigits == 0 {
        0
    } else {
        weight as i32 - (ndigits as i32 - 1)
    };

    let mut value = if exp4 >= 0 {
        for _ in 0..exp4 {
            mantissa = mantissa
                .checked_mul(10000)
                .ok_or_else(|| "numeric value out of range".to_string())?;
        }
        Decimal::try_from_i128_with_scale(mantissa, 0)
            .map_err(|e| format!("numeric value out of range: {e}"))?
    } else {
        Decimal::try_from_i128_with_scale(mantissa, (-exp4 * 4) as u32)
            .map_err(|e| format!("numeric value out of range: {e}"))?
    };

    if sign == NUMERIC_NEG {
        value.set_sign_negative(true);
    }
    value.rescale(dscale as u32);
    Ok(value)
}

/// Canonical text form; PostgreSQL prints numerics without an exponent.
pub fn numeric_to_text(value: &Decimal) -> String {
    value.to_string()
}

pub fn numeric_from_text(text: &str) -> Result<Decimal, String> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| format!("invalid input syntax for type numeric: \"{text}\""))
}
