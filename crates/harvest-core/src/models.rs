//! The wrapped record that flows from connectors into index stores.
//!
//! A connector produces raw JSON payloads; [`Record`] adds the ingestion
//! metadata (identity, origin, backend, fetch/update times) around them.
//! The sync engine later attaches the ISO projections of both timestamps so
//! that stores can filter and sort on a plain string field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::time::{epoch_seconds, to_iso};

/// Field every store upserts by.
pub const FIELD_UUID: &str = "uuid";
/// Field the origin filter applies to.
pub const FIELD_ORIGIN: &str = "origin";
/// ISO projection of `updated_on`; the incremental boundary is its maximum.
pub const FIELD_UPDATED_ON: &str = "metadata__updated_on";
/// ISO projection of `timestamp`.
pub const FIELD_TIMESTAMP: &str = "metadata__timestamp";
/// Position of a record in an offset-addressed source.
pub const FIELD_OFFSET: &str = "offset";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub backend_name: String,
    pub backend_version: String,
    pub harvester_version: String,
    /// When the record was fetched.
    #[serde(with = "epoch_seconds")]
    pub timestamp: DateTime<Utc>,
    pub origin: String,
    pub uuid: String,
    /// When the source last updated the record.
    #[serde(with = "epoch_seconds")]
    pub updated_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(
        rename = "metadata__updated_on",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stored_updated_on: Option<String>,
    #[serde(
        rename = "metadata__timestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stored_timestamp: Option<String>,
    pub data: Value,
}

impl Record {
    /// Attach the ISO projections of `updated_on` and `timestamp`.
    pub fn tag_stored_dates(&mut self) {
        self.stored_updated_on = Some(to_iso(&self.updated_on));
        self.stored_timestamp = Some(to_iso(&self.timestamp));
    }

    /// The JSON document written to an index store.
    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_document(doc: Value) -> Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample() -> Record {
        Record {
            backend_name: "bugzilla".into(),
            backend_version: "0.8.0".into(),
            harvester_version: "0.1.0".into(),
            timestamp: Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap(),
            origin: "http://example.com".into(),
            uuid: "6a7ba2a01aee56603b9d8a5f6b40c843fc089b2f".into(),
            updated_on: Utc.with_ymd_and_hms(2015, 8, 12, 18, 32, 10).unwrap(),
            offset: None,
            project: None,
            stored_updated_on: None,
            stored_timestamp: None,
            data: json!({ "bug_id": [{ "__text__": "1" }] }),
        }
    }

    #[test]
    fn document_uses_store_field_names() {
        let mut record = sample();
        record.tag_stored_dates();
        let doc = record.to_document().unwrap();

        assert_eq!(doc[FIELD_UPDATED_ON], "2015-08-12T18:32:10.000000Z");
        assert_eq!(doc[FIELD_TIMESTAMP], "2016-01-01T00:00:00.000000Z");
        assert_eq!(doc[FIELD_ORIGIN], "http://example.com");
        assert_eq!(doc["updated_on"], json!(1439404330.0));
        assert!(doc.get(FIELD_OFFSET).is_none());
        assert!(doc.get("project").is_none());
    }

    #[test]
    fn document_reads_back() {
        let mut record = sample();
        record.offset = Some(7);
        record.project = Some("mozilla".into());
        record.tag_stored_dates();

        let back = Record::from_document(record.to_document().unwrap()).unwrap();
        assert_eq!(back, record);
    }
}
