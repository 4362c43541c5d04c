//! Statement and portal objects for the extended query protocol, plus the
//! textual type-resolution helpers shared with the simple path: `$n::type`
//! casts resolve undeclared parameter types, select-list casts type
//! expression columns the backend reports as untyped, and command tags are
//! derived from the statement verb.

use crate::backend::{BackendColumn, BackendValue, ExecutionResult, StatementInfo};
use crate::protocol::messages::FieldDescription;
use crate::types::value_codec::Format;
use crate::types::PgType;
use crate::PgBridgeError;
use once_cell::sync::Lazy;
use regex::Regex;

/// A parsed statement: original and translated SQL, resolved parameter
/// OIDs, and the backend's view of the statement shape.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub sql: String,
    pub translated_sql: String,
    pub param_types: Vec<i32>,
    pub info: StatementInfo,
    pub result_hints: Vec<Option<PgType>>,
}

impl PreparedStatement {
    /// OIDs for ParameterDescription. Unresolved parameters are reported
    /// as text, letting the server decide at execution.
    pub fn describe_param_oids(&self) -> Vec<i32> {
        self.param_types
            .iter()
            .map(|&oid| if oid == 0 { PgType::Text.to_oid() } else { oid })
            .collect()
    }

    /// The wire type of each result column: backend metadata first, cast
    /// hints for what the backend could not type, text as the last resort.
    pub fn column_pg_types(&self) -> Vec<PgType> {
        self.info
            .columns
            .iter()
            .enumerate()
            .map(|(i, column)| self.column_pg_type(i, column))
            .collect()
    }

    fn column_pg_type(&self, index: usize, column: &BackendColumn) -> PgType {
        if let Some(ty) = column.ty {
            return ty.pg_type();
        }
        if let Some(Some(hint)) = self.result_hints.get(index) {
            return *hint;
        }
        PgType::Text
    }
}

/// A bound portal. The cursor keeps the materialised backend result so a
/// row-limited Execute can suspend and a later Execute resume.
#[derive(Debug)]
pub struct Portal {
    pub statement_name: String,
    pub params: Vec<BackendValue>,
    pub result_formats: Vec<i16>,
    pub state: PortalState,
}

#[derive(Debug)]
pub enum PortalState {
    Pending,
    Suspended { result: ExecutionResult, offset: usize },
    Drained,
}

static PARAMETER_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+)").unwrap());
static PARAMETER_CAST_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(\d+)::([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Number of parameters a statement expects: the highest `$n` reference.
pub fn count_parameters(sql: &str) -> usize {
    PARAMETER_PATTERN
        .captures_iter(sql)
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .max()
        .unwrap_or(0)
}

/// Resolve parameter OIDs: client declarations win, `$n::type` casts fill
/// the undeclared rest, 0 marks what stays unknown.
pub fn resolve_parameter_types(sql: &str, declared: &[i32]) -> Vec<i32> {
    let count = count_parameters(sql).max(declared.len());
    let mut resolved = vec![0i32; count];
    resolved[..declared.len()].copy_from_slice(declared);

    for caps in PARAMETER_CAST_PATTERN.captures_iter(sql) {
        if let (Ok(index), Some(ty)) = (
            caps[1].parse::<usize>(),
            PgType::from_type_name(&caps[2]),
        ) {
            if index >= 1 && index <= count && resolved[index - 1] == 0 {
                resolved[index - 1] = ty.to_oid();
            }
        }
    }
    resolved
}

/// Cast hints for the select list: when every top-level select item is
/// visible, items of the form `expr::type [AS alias]` contribute a column
/// type. Used only where the backend reports no column type.
pub fn select_item_cast_hints(sql: &str) -> Vec<Option<PgType>> {
    let trimmed = sql.trim_start();
    if !trimmed
        .get(..6)
        .map(|head| head.eq_ignore_ascii_case("select"))
        .unwrap_or(false)
    {
        return Vec::new();
    }
    let list = &trimmed[6..];
    let end = top_level_keyword_position(list, "from").unwrap_or(list.len());
    split_top_level(&list[..end], ',')
        .into_iter()
        .map(|item| item_cast_type(item.trim()))
        .collect()
}

fn item_cast_type(item: &str) -> Option<PgType> {
    // Strip a trailing alias before looking at the cast.
    let expr = {
        let lower = item.to_ascii_lowercase();
        match lower.rfind(" as ") {
            Some(pos) if !item[..pos].trim_end().is_empty() => item[..pos].trim_end(),
            _ => item,
        }
    };
    let (_, ty) = expr.rsplit_once("::")?;
    PgType::from_type_name(ty.trim())
}

fn top_level_keyword_position(sql: &str, keyword: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '(' if !in_single && !in_double => depth += 1,
            ')' if !in_single && !in_double => depth = depth.saturating_sub(1),
            _ => {}
        }
        if depth == 0
            && !in_single
            && !in_double
            && bytes.len() - i >= keyword.len()
            && sql.is_char_boundary(i)
            && sql.is_char_boundary(i + keyword.len())
        {
            let candidate = &sql[i..i + keyword.len()];
            let before_ok = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
            let after_ok = i + keyword.len() == bytes.len()
                || !bytes[i + keyword.len()].is_ascii_alphanumeric();
            if before_ok && after_ok && candidate.eq_ignore_ascii_case(keyword) {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn split_top_level(sql: &str, separator: char) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_single = false;
    let mut in_double = false;
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        let c = b as char;
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '(' if !in_single && !in_double => depth += 1,
            ')' if !in_single && !in_double => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 && !in_single && !in_double => {
                parts.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&sql[start..]);
    parts
}

/// CommandComplete tag for a finished statement.
pub fn command_tag(sql: &str, result: &ExecutionResult, rows_sent: u64) -> String {
    let verb = first_keyword(sql);
    match verb.as_str() {
        "SELECT" | "VALUES" | "WITH" => format!("SELECT {rows_sent}"),
        "INSERT" => format!("INSERT 0 {}", result.rows_affected),
        "UPDATE" => format!("UPDATE {}", result.rows_affected),
        "DELETE" => format!("DELETE {}", result.rows_affected),
        "CREATE" | "DROP" | "ALTER" => {
            let mut words = sql.split_whitespace();
            let first = words.next().unwrap_or_default().to_ascii_uppercase();
            match words.next() {
                Some(second) => format!("{first} {}", second.to_ascii_uppercase()),
                None => first,
            }
        }
        "BEGIN" | "START" => "BEGIN".to_string(),
        "COMMIT" | "END" => "COMMIT".to_string(),
        "ROLLBACK" => "ROLLBACK".to_string(),
        other if !other.is_empty() => other.to_string(),
        _ => "OK".to_string(),
    }
}

fn first_keyword(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// Per-column result format per the Bind rules: no codes means the session
/// default, one code applies to all columns, otherwise one code per column.
pub fn resolve_result_format(
    result_formats: &[i16],
    column_index: usize,
    default: Format,
) -> Result<Format, PgBridgeError> {
    match result_formats.len() {
        0 => Ok(default),
        1 => Format::from_code(result_formats[0]),
        n if column_index < n => Format::from_code(result_formats[column_index]),
        n => Err(PgBridgeError::Protocol(format!(
            "bind message has {n} result formats but row has more columns"
        ))),
    }
}

/// Build the RowDescription fields for a statement's columns.
pub fn field_descriptions(
    columns: &[BackendColumn],
    pg_types: &[PgType],
    result_formats: &[i16],
    default_format: Format,
) -> Result<Vec<FieldDescription>, PgBridgeError> {
    columns
        .iter()
        .zip(pg_types.iter())
        .enumerate()
        .map(|(i, (column, ty))| {
            let format = resolve_result_format(result_formats, i, default_format)?;
            Ok(FieldDescription::new(
                column.name.clone(),
                ty.to_oid(),
                ty.type_size(),
                format.code(),
            ))
        })
        .collect()
}
