//! Shared data types for the quarry ingest pipeline.
//!
//! These types cross crate boundaries: the catalog stores them, the transform supervisor produces
//! them, and the workflow engine persists them between steps.

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

mod ingest;

pub use ingest::{IngestRequest, TransformRequest, WorkflowId};

/// Error returned when a column type tag is outside of the known range.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("unknown column type tag: {0}")]
pub struct UnknownColumnType(pub i64);

/// The type of a column, as stored in the catalog.
///
/// The numeric tags match the `ColumnType` enumeration of the catalog gRPC API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnType {
    #[default]
    Unspecified = 0,
    Int64 = 1,
    Utf8 = 2,
    Timestamp = 3,
}

impl ColumnType {
    /// The short, human readable name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "Unspecified",
            Self::Int64 => "Int64",
            Self::Utf8 => "Utf8",
            Self::Timestamp => "Timestamp",
        }
    }

    /// The numeric tag used on the wire and in the database.
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    /// Lenient conversion used for output produced by external tools: anything that is not a
    /// recognised name or tag maps to [`ColumnType::Unspecified`].
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i64> for ColumnType {
    type Error = UnknownColumnType;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unspecified),
            1 => Ok(Self::Int64),
            2 => Ok(Self::Utf8),
            3 => Ok(Self::Timestamp),
            other => Err(UnknownColumnType(other)),
        }
    }
}

impl TryFrom<i32> for ColumnType {
    type Error = UnknownColumnType;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        i64::from(value).try_into()
    }
}

impl TryFrom<i16> for ColumnType {
    type Error = UnknownColumnType;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        i64::from(value).try_into()
    }
}

/// Error returned when parsing a [`ColumnType`] from a string fails.
#[derive(Debug, thiserror::Error)]
#[error("unknown column type: {0}")]
pub struct ParseColumnTypeError(String);

impl FromStr for ColumnType {
    type Err = ParseColumnTypeError;

    /// Accepts `Int64`, `INT64` and `COLUMN_TYPE_INT64` spellings (case-insensitive) as well as
    /// the numeric tag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(tag) = trimmed.parse::<i64>() {
            return Self::try_from(tag).map_err(|_| ParseColumnTypeError(s.to_owned()));
        }

        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix("COLUMN_TYPE_").unwrap_or(&upper);
        match name {
            "UNSPECIFIED" => Ok(Self::Unspecified),
            "INT64" => Ok(Self::Int64),
            "UTF8" => Ok(Self::Utf8),
            "TIMESTAMP" => Ok(Self::Timestamp),
            _ => Err(ParseColumnTypeError(s.to_owned())),
        }
    }
}

impl Serialize for ColumnType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ColumnTypeVisitor;

        impl de::Visitor<'_> for ColumnTypeVisitor {
            type Value = ColumnType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a column type name or numeric tag")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(ColumnType::parse_lenient(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(ColumnType::try_from(v).unwrap_or_default())
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(i64::try_from(v)
                    .ok()
                    .and_then(|v| ColumnType::try_from(v).ok())
                    .unwrap_or_default())
            }
        }

        deserializer.deserialize_any(ColumnTypeVisitor)
    }
}

/// A named, typed column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// An inclusive range of epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// A range is valid when it does not end before it starts.
    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Whether the two inclusive ranges share at least one instant.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// The columns of a table as currently known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub tenant_id: String,
    pub table_name: String,
    /// Ordered by column name.
    pub columns: Vec<Column>,
}

/// An immutable, named slice of a table's data produced by one transformation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub tenant_id: String,
    pub table_name: String,
    pub name: String,
    pub size_bytes: i64,
    pub time_range: TimeRange,
    /// The columns of the partition at creation time.
    pub columns: Vec<Column>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_type_parses_all_spellings() {
        for s in ["Int64", "INT64", "int64", "COLUMN_TYPE_INT64", "column_type_int64", "1"] {
            assert_eq!(s.parse::<ColumnType>().unwrap(), ColumnType::Int64, "{s}");
        }
        assert_eq!("Utf8".parse::<ColumnType>().unwrap(), ColumnType::Utf8);
        assert_eq!(
            "COLUMN_TYPE_TIMESTAMP".parse::<ColumnType>().unwrap(),
            ColumnType::Timestamp
        );
        assert!("Float64".parse::<ColumnType>().is_err());
        assert!("7".parse::<ColumnType>().is_err());
    }

    #[test]
    fn column_type_deserialize_is_lenient() {
        let types: Vec<ColumnType> =
            serde_json::from_str(r#"["Int64", "COLUMN_TYPE_UTF8", 3, "Float64", 42, -1]"#)
                .unwrap();
        assert_eq!(
            types,
            vec![
                ColumnType::Int64,
                ColumnType::Utf8,
                ColumnType::Timestamp,
                ColumnType::Unspecified,
                ColumnType::Unspecified,
                ColumnType::Unspecified,
            ]
        );
    }

    #[test]
    fn column_type_tags() {
        assert_eq!(ColumnType::Unspecified.as_i16(), 0);
        assert_eq!(ColumnType::Int64.as_i16(), 1);
        assert_eq!(ColumnType::Utf8.as_i16(), 2);
        assert_eq!(ColumnType::Timestamp.as_i16(), 3);
        assert!(ColumnType::try_from(4_i16).is_err());
    }

    #[test]
    fn time_range_overlap_is_inclusive() {
        let r = TimeRange::new(1000, 2000);

        assert!(r.overlaps(&TimeRange::new(1500, 2500)));
        assert!(r.overlaps(&TimeRange::new(0, 1000)));
        assert!(r.overlaps(&TimeRange::new(2000, 3000)));
        assert!(r.overlaps(&TimeRange::new(1200, 1300)));
        assert!(r.overlaps(&TimeRange::new(0, 5000)));

        assert!(!r.overlaps(&TimeRange::new(0, 999)));
        assert!(!r.overlaps(&TimeRange::new(2001, 3000)));
        assert!(!r.overlaps(&TimeRange::new(3000, 4000)));
    }

    #[test]
    fn time_range_validity() {
        assert!(TimeRange::new(5, 5).is_valid());
        assert!(!TimeRange::new(6, 5).is_valid());
    }
}
