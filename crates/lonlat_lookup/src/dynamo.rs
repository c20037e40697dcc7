use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest};
use aws_sdk_dynamodb::Client;
use lonlat::{ClassificationRecord, RecordStore, StoreError, WriteOutcome};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// DynamoDB's hard limit on the size of one item.
pub const MAX_ITEM_BYTES: usize = 400 * 1024;

const KEY_ATTR: &str = "lonlat";
const DATA_ATTR: &str = "data";

type Item = HashMap<String, AttributeValue>;

/// A failed table call, split by whether the service judged the request invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    Validation(String),
    Other(String),
}

impl CallError {
    fn from_sdk<E, R>(err: &SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + Error + 'static,
        R: Debug,
    {
        let text = DisplayErrorContext(err).to_string();
        if err.as_service_error().and_then(|e| e.code()) == Some("ValidationException") {
            Self::Validation(text)
        } else {
            Self::Other(text)
        }
    }
}

/// The two table operations the store needs.
pub trait TableClient {
    /// Bulk put; returns the items the service left unprocessed.
    async fn batch_put(&self, table: &str, items: Vec<Item>) -> Result<Vec<Item>, CallError>;

    async fn put(&self, table: &str, item: Item) -> Result<(), CallError>;
}

impl TableClient for Client {
    async fn batch_put(&self, table: &str, items: Vec<Item>) -> Result<Vec<Item>, CallError> {
        let requests = items
            .into_iter()
            .map(write_request)
            .collect::<Result<Vec<_>, _>>()?;

        let resp = self
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|e| CallError::from_sdk(&e))?;

        Ok(resp
            .unprocessed_items()
            .and_then(|items| items.get(table))
            .into_iter()
            .flatten()
            .filter_map(|wr| wr.put_request())
            .map(|put| put.item().clone())
            .collect())
    }

    async fn put(&self, table: &str, item: Item) -> Result<(), CallError> {
        self.put_item()
            .table_name(table)
            .set_item(Some(item))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| CallError::from_sdk(&e))
    }
}

/// How long unprocessed items keep being resent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before resend number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Writes classification records to a DynamoDB table with `BatchWriteItem`.
pub struct DynamoStore<C = Client> {
    rt: Arc<Runtime>,
    client: C,
    table: String,
    retry: RetryPolicy,
}

impl<C: TableClient> DynamoStore<C> {
    pub fn new(rt: Arc<Runtime>, client: C, table: impl Into<String>) -> Self {
        Self {
            rt,
            client,
            table: table.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send_batch(
        &self,
        records: &[ClassificationRecord],
        mut remaining: Vec<usize>,
        outcomes: &mut [WriteOutcome],
    ) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            let items = remaining.iter().map(|&i| item(&records[i])).collect();

            let unprocessed = match self.client.batch_put(&self.table, items).await {
                Ok(unprocessed) => unprocessed,
                Err(CallError::Validation(reason)) => {
                    warn!(
                        error = %reason,
                        records = remaining.len(),
                        "Batch rejected as invalid; retrying records one by one"
                    );
                    return self.isolate(records, &remaining, outcomes).await;
                }
                Err(CallError::Other(reason)) => {
                    return Err(StoreError::new(format!(
                        "BatchWriteItem on {} failed: {reason}",
                        self.table
                    )))
                }
            };

            let keys: HashSet<&str> = unprocessed
                .iter()
                .filter_map(|item| item.get(KEY_ATTR))
                .filter_map(|key| key.as_s().ok())
                .map(String::as_str)
                .collect();
            remaining.retain(|&i| keys.contains(records[i].lonlat.as_str()));
            if remaining.is_empty() {
                return Ok(());
            }

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                break;
            }
            let delay = self.retry.delay(attempt);
            debug!(
                attempt,
                unprocessed = remaining.len(),
                delay_ms = delay.as_millis() as u64,
                "Resending unprocessed items"
            );
            tokio::time::sleep(delay).await;
        }

        for &i in &remaining {
            outcomes[i] = WriteOutcome::Fatal(format!(
                "still unprocessed after {} attempts",
                self.retry.max_attempts
            ));
        }
        Ok(())
    }

    /// Puts each record on its own after the service rejected the whole batch.
    ///
    /// A table that rejects a blank record, or every record of a batch, is
    /// misconfigured rather than fed bad data, so the run is aborted.
    async fn isolate(
        &self,
        records: &[ClassificationRecord],
        indices: &[usize],
        outcomes: &mut [WriteOutcome],
    ) -> Result<(), StoreError> {
        let mut rejected = 0;

        for &i in indices {
            let record = &records[i];
            outcomes[i] = match self.client.put(&self.table, item(record)).await {
                Ok(()) => WriteOutcome::Success,
                Err(CallError::Validation(reason)) if record.is_blank() => {
                    return Err(StoreError::new(format!(
                        "table {} rejected blank record {}: {reason}",
                        self.table, record.lonlat
                    )))
                }
                Err(CallError::Validation(reason)) => {
                    rejected += 1;
                    WriteOutcome::ValidationFailed(reason)
                }
                Err(CallError::Other(reason)) => WriteOutcome::Fatal(reason),
            };
        }

        if indices.len() > 1 && rejected == indices.len() {
            return Err(StoreError::new(format!(
                "table {} rejected all {rejected} records of a batch; check its key schema",
                self.table
            )));
        }
        Ok(())
    }
}

impl<C: TableClient> RecordStore for DynamoStore<C> {
    fn write_batch(&mut self, records: &[ClassificationRecord]) -> Result<Vec<WriteOutcome>, StoreError> {
        let mut outcomes = vec![WriteOutcome::Success; records.len()];
        let mut pending = Vec::with_capacity(records.len());

        for (i, record) in records.iter().enumerate() {
            match validate(record) {
                Ok(()) => pending.push(i),
                Err(reason) => outcomes[i] = WriteOutcome::ValidationFailed(reason),
            }
        }

        if !pending.is_empty() {
            let rt = Arc::clone(&self.rt);
            rt.block_on(self.send_batch(records, pending, &mut outcomes))?;
        }

        Ok(outcomes)
    }
}

/// Checks a record against what the table accepts before it is sent.
///
/// Replacement characters and control characters indicate a label that
/// was not decoded cleanly from the source dataset.
pub fn validate(record: &ClassificationRecord) -> Result<(), String> {
    if record.lonlat.as_str().trim().is_empty() {
        return Err("empty key".to_owned());
    }

    for (name, value) in record.fields() {
        if value.contains('\u{FFFD}') {
            return Err(format!("{name} contains undecodable text: {value:?}"));
        }
        if value.chars().any(char::is_control) {
            return Err(format!("{name} contains control characters: {value:?}"));
        }
    }

    let size = item_size(record);
    if size > MAX_ITEM_BYTES {
        return Err(format!("item is {size} bytes, limit is {MAX_ITEM_BYTES}"));
    }

    Ok(())
}

/// Approximate stored size: attribute names plus UTF-8 values.
fn item_size(record: &ClassificationRecord) -> usize {
    let data: usize = record
        .fields()
        .iter()
        .map(|(name, value)| name.len() + value.len() + 1)
        .sum();
    KEY_ATTR.len() + record.lonlat.as_str().len() + DATA_ATTR.len() + 3 + data
}

fn item(record: &ClassificationRecord) -> Item {
    let data = record
        .fields()
        .iter()
        .map(|(name, value)| (name.to_string(), AttributeValue::S(value.to_string())))
        .collect();

    HashMap::from([
        (KEY_ATTR.to_owned(), AttributeValue::S(record.lonlat.to_string())),
        (DATA_ATTR.to_owned(), AttributeValue::M(data)),
    ])
}

fn write_request(item: Item) -> Result<WriteRequest, CallError> {
    let put = PutRequest::builder()
        .set_item(Some(item))
        .build()
        .map_err(|e| CallError::Other(format!("invalid put request: {e}")))?;

    Ok(WriteRequest::builder().put_request(put).build())
}
