//! The partition descriptor printed by the transformation binary on success.

use quarry_types::{Column, ColumnType, Partition, TimeRange, TransformRequest};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct PartitionDescriptor {
    name: String,
    #[serde(alias = "size_bytes")]
    size: i64,
    #[serde(alias = "min_ts")]
    min_timestamp: i64,
    #[serde(alias = "max_ts")]
    max_timestamp: i64,
    #[serde(default)]
    columns: Vec<ColumnDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ColumnDescriptor {
    name: String,
    #[serde(alias = "type", alias = "column_type", default)]
    data_type: ColumnType,
}

/// Why the output of the binary is not a valid partition.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("not a partition descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error("partition name is empty")]
    EmptyName,

    #[error("negative partition size {0}")]
    NegativeSize(i64),

    #[error("min timestamp {min} is after max timestamp {max}")]
    InvertedTimeRange { min: i64, max: i64 },

    #[error("column {0} has an empty name")]
    EmptyColumnName(usize),
}

impl PartitionDescriptor {
    pub(crate) fn parse(stdout: &[u8]) -> Result<Self, OutputError> {
        let descriptor: Self = serde_json::from_slice(stdout)?;

        if descriptor.name.trim().is_empty() {
            return Err(OutputError::EmptyName);
        }
        if descriptor.size < 0 {
            return Err(OutputError::NegativeSize(descriptor.size));
        }
        if descriptor.min_timestamp > descriptor.max_timestamp {
            return Err(OutputError::InvertedTimeRange {
                min: descriptor.min_timestamp,
                max: descriptor.max_timestamp,
            });
        }
        if let Some(idx) = descriptor.columns.iter().position(|c| c.name.is_empty()) {
            return Err(OutputError::EmptyColumnName(idx));
        }

        Ok(descriptor)
    }

    /// The partition described, belonging to the request's tenant and table.
    pub(crate) fn into_partition(self, request: &TransformRequest) -> Partition {
        Partition {
            tenant_id: request.tenant_id.clone(),
            table_name: request.table.clone(),
            name: self.name,
            size_bytes: self.size,
            time_range: TimeRange::new(self.min_timestamp, self.max_timestamp),
            columns: self
                .columns
                .into_iter()
                .map(|c| Column::new(c.name, c.data_type))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn request() -> TransformRequest {
        TransformRequest {
            tenant_id: "acme".into(),
            table: "web_requests".into(),
            source: "raw".into(),
            destination: "lake".into(),
            location: "tenant_id=acme/table=web_requests/part-001.json".into(),
        }
    }

    #[test]
    fn parses_short_field_names() {
        let out = br#"{"name":"p1","size":1024,"min_ts":1000,"max_ts":2000,"columns":[{"name":"id","data_type":"Int64"}]}"#;
        let partition = PartitionDescriptor::parse(out)
            .unwrap()
            .into_partition(&request());

        assert_eq!(
            partition,
            Partition {
                tenant_id: "acme".into(),
                table_name: "web_requests".into(),
                name: "p1".into(),
                size_bytes: 1024,
                time_range: TimeRange::new(1000, 2000),
                columns: vec![Column::new("id", ColumnType::Int64)],
            }
        );
    }

    #[test]
    fn parses_long_field_names_and_proto_types() {
        let out = br#"
            {
                "name": "p2",
                "size": 1,
                "min_timestamp": 5,
                "max_timestamp": 5,
                "columns": [
                    {"name": "ts", "type": "COLUMN_TYPE_TIMESTAMP"},
                    {"name": "msg", "type": 2},
                    {"name": "blob", "type": "Binary"},
                    {"name": "untyped"}
                ]
            }
        "#;
        let partition = PartitionDescriptor::parse(out)
            .unwrap()
            .into_partition(&request());

        assert_eq!(
            partition.columns,
            vec![
                Column::new("ts", ColumnType::Timestamp),
                Column::new("msg", ColumnType::Utf8),
                Column::new("blob", ColumnType::Unspecified),
                Column::new("untyped", ColumnType::Unspecified),
            ]
        );
    }

    #[test]
    fn rejects_malformed_output() {
        assert_matches!(
            PartitionDescriptor::parse(b"done!"),
            Err(OutputError::Json(_))
        );
        assert_matches!(PartitionDescriptor::parse(b""), Err(OutputError::Json(_)));
        assert_matches!(
            PartitionDescriptor::parse(br#"{"name":"p1","size":1}"#),
            Err(OutputError::Json(_))
        );
        assert_matches!(
            PartitionDescriptor::parse(br#"{"name":" ","size":1,"min_ts":0,"max_ts":1}"#),
            Err(OutputError::EmptyName)
        );
        assert_matches!(
            PartitionDescriptor::parse(br#"{"name":"p","size":-1,"min_ts":0,"max_ts":1}"#),
            Err(OutputError::NegativeSize(-1))
        );
        assert_matches!(
            PartitionDescriptor::parse(br#"{"name":"p","size":1,"min_ts":2,"max_ts":1}"#),
            Err(OutputError::InvertedTimeRange { min: 2, max: 1 })
        );
        assert_matches!(
            PartitionDescriptor::parse(
                br#"{"name":"p","size":1,"min_ts":1,"max_ts":1,"columns":[{"name":""}]}"#
            ),
            Err(OutputError::EmptyColumnName(0))
        );
    }
}
