use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest};
use aws_sdk_dynamodb::Client;
use tracing::debug;
use vrp_core::{Item, ItemValue, TableDefinition};

use crate::{KeyValueTable, TableStore};

/// `BatchWriteItem` accepts at most 25 requests per call.
const BATCH_WRITE_LIMIT: usize = 25;

/// Rounds of resubmitting items the service reports back as unprocessed.
const MAX_UNPROCESSED_ROUNDS: usize = 5;

pub async fn connect_dynamodb(endpoint: Option<&str>) -> Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(endpoint) = endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    Client::new(&loader.load().await)
}

#[derive(Debug, Clone)]
pub struct DynamoTableStore {
    client: Client,
}

impl DynamoTableStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TableStore for DynamoTableStore {
    async fn table(&self, name: &str) -> Result<Arc<dyn KeyValueTable>> {
        Ok(Arc::new(DynamoTable::new(self.client.clone(), name)))
    }
}

#[derive(Debug, Clone)]
pub struct DynamoTable {
    client: Client,
    name: String,
}

impl DynamoTable {
    pub fn new(client: Client, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }

    async fn submit(&self, chunk: Vec<WriteRequest>) -> Result<()> {
        let mut pending = HashMap::from([(self.name.clone(), chunk)]);
        for round in 0..MAX_UNPROCESSED_ROUNDS {
            let out = self
                .client
                .batch_write_item()
                .set_request_items(Some(pending))
                .send()
                .await
                .with_context(|| format!("batch writing to {}", self.name))?;

            let unprocessed = out.unprocessed_items().cloned().unwrap_or_default();
            let remaining: usize = unprocessed.values().map(Vec::len).sum();
            if remaining == 0 {
                return Ok(());
            }
            debug!(table = %self.name, round, remaining, "resubmitting unprocessed items");
            pending = unprocessed;
        }
        bail!(
            "{} still reported unprocessed items after {MAX_UNPROCESSED_ROUNDS} rounds",
            self.name
        )
    }
}

pub(crate) fn to_attribute_map(item: Item) -> HashMap<String, AttributeValue> {
    item.into_iter()
        .map(|(name, value)| {
            let value = match value {
                ItemValue::Text(s) => AttributeValue::S(s),
                ItemValue::Number(n) => AttributeValue::N(n),
            };
            (name, value)
        })
        .collect()
}

#[async_trait]
impl KeyValueTable for DynamoTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> TableDefinition {
        TableDefinition::post_snapshot()
    }

    async fn item_count(&self) -> Result<u64> {
        let out = self
            .client
            .describe_table()
            .table_name(&self.name)
            .send()
            .await
            .with_context(|| format!("describing table {}", self.name))?;
        let count = out.table().and_then(|t| t.item_count()).unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    async fn put_items(&self, items: Vec<Item>) -> Result<()> {
        let mut requests = items
            .into_iter()
            .map(|item| {
                PutRequest::builder()
                    .set_item(Some(to_attribute_map(item)))
                    .build()
                    .map(|put| WriteRequest::builder().put_request(put).build())
            })
            .collect::<Result<Vec<_>, _>>()
            .context("building put requests")?;

        while !requests.is_empty() {
            let chunk: Vec<_> = requests
                .drain(..requests.len().min(BATCH_WRITE_LIMIT))
                .collect();
            self.submit(chunk).await?;
        }
        Ok(())
    }
}
