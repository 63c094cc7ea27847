use generated_types::quarry::catalog::v1 as proto;
use quarry_catalog::interface::Error as CatalogError;
use quarry_types::{Column, ColumnType, Partition, TimeRange};

#[derive(Debug)]
pub(crate) struct Error {
    msg: String,
    path: Vec<&'static str>,
}

impl Error {
    fn new<E>(e: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self {
            msg: e.to_string(),
            path: vec![],
        }
    }

    fn ctx(self, arg: &'static str) -> Self {
        let Self { msg, mut path } = self;
        path.insert(0, arg);
        Self { msg, path }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.path.is_empty() {
            write!(f, "{}", self.path[0])?;
            for p in self.path.iter().skip(1) {
                write!(f, ".{}", p)?;
            }
            write!(f, ": ")?;
        }

        write!(f, "{}", self.msg)?;

        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<Error> for CatalogError {
    fn from(e: Error) -> Self {
        Self::External { source: e.into() }
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

pub(crate) trait RequiredExt<T> {
    fn required(self) -> Result<T, Error>;
}

impl<T> RequiredExt<T> for Option<T> {
    fn required(self) -> Result<T, Error> {
        self.ok_or_else(|| Error::new("required"))
    }
}

pub(crate) trait ContextExt<T> {
    fn ctx(self, path: &'static str) -> Result<T, Error>;
}

impl<T> ContextExt<T> for Result<T, Error> {
    fn ctx(self, path: &'static str) -> Self {
        self.map_err(|e| e.ctx(path))
    }
}

pub(crate) fn catalog_error_to_status(e: CatalogError) -> tonic::Status {
    match e {
        CatalogError::External { source } => tonic::Status::internal(source.to_string()),
        CatalogError::AlreadyExists { descr } => tonic::Status::already_exists(descr),
        CatalogError::InvalidArgument { descr } => tonic::Status::invalid_argument(descr),
        CatalogError::NotFound { descr } => tonic::Status::not_found(descr),
    }
}

pub(crate) fn convert_status(status: tonic::Status) -> CatalogError {
    match status.code() {
        tonic::Code::Internal => CatalogError::External {
            source: status.message().to_owned().into(),
        },
        tonic::Code::AlreadyExists => CatalogError::AlreadyExists {
            descr: status.message().to_owned(),
        },
        tonic::Code::InvalidArgument => CatalogError::InvalidArgument {
            descr: status.message().to_owned(),
        },
        tonic::Code::NotFound => CatalogError::NotFound {
            descr: status.message().to_owned(),
        },
        _ => CatalogError::External {
            source: Box::new(status),
        },
    }
}

pub(crate) fn serialize_column_type(t: ColumnType) -> i32 {
    let t = match t {
        ColumnType::Unspecified => proto::ColumnType::Unspecified,
        ColumnType::Int64 => proto::ColumnType::Int64,
        ColumnType::Utf8 => proto::ColumnType::Utf8,
        ColumnType::Timestamp => proto::ColumnType::Timestamp,
    };
    t.into()
}

pub(crate) fn deserialize_column_type(t: i32) -> Result<ColumnType, Error> {
    ColumnType::try_from(t).map_err(Error::new)
}

pub(crate) fn serialize_column(column: Column) -> proto::TableColumn {
    proto::TableColumn {
        name: column.name,
        r#type: serialize_column_type(column.column_type),
    }
}

pub(crate) fn deserialize_column(column: proto::TableColumn) -> Result<Column, Error> {
    Ok(Column {
        column_type: deserialize_column_type(column.r#type).ctx("type")?,
        name: column.name,
    })
}

pub(crate) fn deserialize_columns(columns: Vec<proto::TableColumn>) -> Result<Vec<Column>, Error> {
    columns.into_iter().map(deserialize_column).collect()
}

pub(crate) fn serialize_time_range(r: TimeRange) -> proto::TimeRange {
    proto::TimeRange {
        start_time: r.start,
        end_time: r.end,
    }
}

pub(crate) fn deserialize_time_range(r: proto::TimeRange) -> TimeRange {
    TimeRange::new(r.start_time, r.end_time)
}

pub(crate) fn serialize_partition(p: Partition) -> proto::Partition {
    proto::Partition {
        tenant_id: p.tenant_id,
        name: p.name,
        size: p.size_bytes,
        time_range: Some(serialize_time_range(p.time_range)),
        columns: p.columns.into_iter().map(serialize_column).collect(),
    }
}

/// The table of a partition is a field of the enclosing message, and so is its tenant unless the
/// partition names one itself.
pub(crate) fn deserialize_partition(
    tenant_id: &str,
    table_name: &str,
    p: proto::Partition,
) -> Result<Partition, Error> {
    let tenant_id = if p.tenant_id.is_empty() {
        tenant_id.to_owned()
    } else {
        p.tenant_id
    };
    Ok(Partition {
        tenant_id,
        table_name: table_name.to_owned(),
        time_range: deserialize_time_range(p.time_range.required().ctx("time_range")?),
        columns: deserialize_columns(p.columns).ctx("columns")?,
        name: p.name,
        size_bytes: p.size,
    })
}
