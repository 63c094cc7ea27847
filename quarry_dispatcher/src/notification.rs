//! Object storage event notifications.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

/// Prefix of the event names of object creation (`ObjectCreated:Put`, `ObjectCreated:Copy`, ...).
pub const OBJECT_CREATED_PREFIX: &str = "ObjectCreated:";

// `(?s)`: decoded keys may contain line breaks (`%0A`), which belong to the object path.
static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^tenant_id=(?P<tenant>[^/]+)/table=(?P<table>[^/]+)/(?P<rest>.+)$")
        .expect("valid key pattern")
});

/// An S3 style event notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    #[serde(rename = "Records", default)]
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub event_name: String,
    #[serde(default)]
    pub aws_region: String,
    pub s3: S3Entity,
}

impl Record {
    pub fn is_object_created(&self) -> bool {
        self.event_name.starts_with(OBJECT_CREATED_PREFIX)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: Bucket,
    pub object: Object,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Object {
    /// URL encoded object key, see [`decoded_key`](Self::decoded_key).
    pub key: String,
    #[serde(default)]
    pub size: Option<i64>,
}

impl Object {
    /// The object key with the notification's form encoding (`%XX` escapes, `+` for space)
    /// removed.
    pub fn decoded_key(&self) -> Result<String, String> {
        urlencoding::decode(&self.key.replace('+', " "))
            .map(|decoded| decoded.to_string())
            .map_err(|e| format!("{e:?}"))
    }
}

/// The parts of an object key laid out as `tenant_id=<tenant>/table=<table>/<rest>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub tenant_id: String,
    pub table: String,
    /// Everything after the table segment.
    pub object_path: String,
}

impl ObjectKey {
    pub fn parse(key: &str) -> Option<Self> {
        let captures = KEY_PATTERN.captures(key)?;
        Some(Self {
            tenant_id: captures["tenant"].to_owned(),
            table: captures["table"].to_owned(),
            object_path: captures["rest"].to_owned(),
        })
    }
}
