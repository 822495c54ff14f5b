use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;

const BOOL: u32 = 16;
const INT8: u32 = 20;
const INT2: u32 = 21;
const INT4: u32 = 23;
const OID: u32 = 26;
const TIMESTAMP: u32 = 1114;
const TIMESTAMPTZ: u32 = 1184;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
}

/// A text-format column value decoded by its type OID. Types without a
/// dedicated variant stay text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int(i64),
    Timestamp(DateTime<FixedOffset>),
    LocalTimestamp(NaiveDateTime),
    Text(String),
}

impl PgValue {
    #[must_use]
    pub fn decode(type_oid: u32, raw: Option<&[u8]>) -> Self {
        let Some(raw) = raw else {
            return Self::Null;
        };
        let text = String::from_utf8_lossy(raw);
        let parsed = match type_oid {
            BOOL => match text.as_ref() {
                "t" => Some(Self::Bool(true)),
                "f" => Some(Self::Bool(false)),
                _ => None,
            },
            INT2 | INT4 | INT8 | OID => text.parse().ok().map(Self::Int),
            TIMESTAMPTZ => DateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .ok()
                .map(Self::Timestamp),
            TIMESTAMP => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(Self::LocalTimestamp),
            _ => None,
        };
        parsed.unwrap_or_else(|| Self::Text(text.into_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            Self::Timestamp(at) => Some(*at),
            Self::LocalTimestamp(at) => Some(at.and_utc().fixed_offset()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<PgValue>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[Column]>, values: Vec<PgValue>) -> Self {
        Self { columns, values }
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PgValue> {
        self.columns
            .iter()
            .position(|column| column.name == name)
            .and_then(|index| self.values.get(index))
    }
}
