use std::io::Write;

use lonlat::{ClassificationRecord, RecordStore, StoreError, WriteOutcome};
use serde::Serialize;

/// Table item layout: the key plus a nested `data` map.
#[derive(Serialize)]
pub struct StoredItem<'a> {
    pub lonlat: &'a str,
    pub data: StoredData<'a>,
}

#[derive(Serialize)]
pub struct StoredData<'a> {
    pub water: &'a str,
    pub country: &'a str,
    pub state: &'a str,
    pub city: &'a str,
}

impl<'a> From<&'a ClassificationRecord> for StoredItem<'a> {
    fn from(r: &'a ClassificationRecord) -> Self {
        Self {
            lonlat: r.lonlat.as_str(),
            data: StoredData {
                water: &r.water,
                country: &r.country,
                state: &r.state,
                city: &r.city,
            },
        }
    }
}

/// Writes one JSON object per record, for dry runs and local inspection.
pub struct JsonLinesStore<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesStore<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RecordStore for JsonLinesStore<W> {
    fn write_batch(&mut self, records: &[ClassificationRecord]) -> Result<Vec<WriteOutcome>, StoreError> {
        for record in records {
            serde_json::to_writer(&mut self.out, &StoredItem::from(record))
                .map_err(|e| StoreError::with_source("failed to encode record", e))?;
            self.out
                .write_all(b"\n")
                .map_err(|e| StoreError::with_source("failed to write record", e))?;
        }
        self.out
            .flush()
            .map_err(|e| StoreError::with_source("failed to flush records", e))?;

        Ok(vec![WriteOutcome::Success; records.len()])
    }
}
