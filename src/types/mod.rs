// Type codec matrix: one PostgreSQL OID per supported backend type, with
// text and binary encode/decode on each.
pub mod datetime;
pub mod numeric;
pub mod value_codec;

pub use value_codec::{decode_parameter, encode_value, Format};

/// PostgreSQL type OIDs supported by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PgType {
    Bool = 16,
    Bytea = 17,
    Int8 = 20,
    Int2 = 21,
    Int4 = 23,
    Text = 25,
    Float4 = 700,
    Float8 = 701,
    Unknown = 705,
    Varchar = 1043,
    Date = 1082,
    Timestamp = 1114,
    Timestamptz = 1184,
    Numeric = 1700,
}

impl PgType {
    pub fn to_oid(self) -> i32 {
        self as i32
    }

    pub fn from_oid(oid: i32) -> Option<Self> {
        match oid {
            16 => Some(PgType::Bool),
            17 => Some(PgType::Bytea),
            20 => Some(PgType::Int8),
            21 => Some(PgType::Int2),
            23 => Some(PgType::Int4),
            25 => Some(PgType::Text),
            700 => Some(PgType::Float4),
            701 => Some(PgType::Float8),
            705 => Some(PgType::Unknown),
            1043 => Some(PgType::Varchar),
            1082 => Some(PgType::Date),
            1114 => Some(PgType::Timestamp),
            1184 => Some(PgType::Timestamptz),
            1700 => Some(PgType::Numeric),
            _ => None,
        }
    }

    /// Wire size for RowDescription: fixed-width types report their width,
    /// variable-width types report -1.
    pub fn type_size(self) -> i16 {
        match self {
            PgType::Bool => 1,
            PgType::Int2 => 2,
            PgType::Int4 | PgType::Float4 | PgType::Date => 4,
            PgType::Int8 | PgType::Float8 | PgType::Timestamp | PgType::Timestamptz => 8,
            PgType::Bytea
            | PgType::Text
            | PgType::Varchar
            | PgType::Unknown
            | PgType::Numeric => -1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PgType::Bool => "bool",
            PgType::Bytea => "bytea",
            PgType::Int8 => "int8",
            PgType::Int2 => "int2",
            PgType::Int4 => "int4",
            PgType::Text => "text",
            PgType::Float4 => "float4",
            PgType::Float8 => "float8",
            PgType::Unknown => "unknown",
            PgType::Varchar => "varchar",
            PgType::Date => "date",
            PgType::Timestamp => "timestamp",
            PgType::Timestamptz => "timestamptz",
            PgType::Numeric => "numeric",
        }
    }

    /// Resolve a type name as it appears in a `::cast` or parameter
    /// declaration to an OID.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Some(PgType::Bool),
            "bytea" => Some(PgType::Bytea),
            "int8" | "bigint" => Some(PgType::Int8),
            "int2" | "smallint" => Some(PgType::Int2),
            "int4" | "int" | "integer" => Some(PgType::Int4),
            "text" => Some(PgType::Text),
            "float4" | "real" => Some(PgType::Float4),
            "float8" | "double" | "float" => Some(PgType::Float8),
            "varchar" | "string" => Some(PgType::Varchar),
            "date" => Some(PgType::Date),
            "timestamp" => Some(PgType::Timestamp),
            "timestamptz" => Some(PgType::Timestamptz),
            "numeric" | "decimal" => Some(PgType::Numeric),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_round_trip() {
        for ty in [
            PgType::Bool,
            PgType::Bytea,
            PgType::Int8,
            PgType::Int2,
            PgType::Int4,
            PgType::Text,
            PgType::Float4,
            PgType::Float8,
            PgType::Unknown,
            PgType::Varchar,
            PgType::Date,
            PgType::Timestamp,
            PgType::Timestamptz,
            PgType::Numeric,
        ] {
            assert_eq!(PgType::from_oid(ty.to_oid()), Some(ty));
        }
    }

    #[test]
    fn cast_names_resolve() {
        assert_eq!(PgType::from_type_name("INT8"), Some(PgType::Int8));
        assert_eq!(PgType::from_type_name("bigint"), Some(PgType::Int8));
        assert_eq!(PgType::from_type_name("decimal"), Some(PgType::Numeric));
        assert_eq!(PgType::from_type_name("no_such_type"), None);
    }
}
