//! Destination tables (sink side) and credential loading for the collector.

mod credentials;
mod dynamo;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use vrp_core::{Item, ItemKey, Schema, SchemaError, TableDefinition};

pub use credentials::{
    load_credentials, parse_credentials, CredentialFormat, CredentialLocation, RedditCredentials,
};
pub use dynamo::{connect_dynamodb, DynamoTable, DynamoTableStore};

pub const CRATE_NAME: &str = "vrp-storage";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("duplicate key {key} in batch for table {table}")]
    DuplicateKey { table: String, key: ItemKey },
    #[error("item in batch for table {table} lacks its key attributes")]
    MissingKey { table: String },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A flat key-value table in the destination.
#[async_trait]
pub trait KeyValueTable: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> TableDefinition;

    /// Item count as reported by the backend. Managed services only refresh
    /// this periodically, so treat it as informational.
    async fn item_count(&self) -> anyhow::Result<u64>;

    /// Persist items as independent puts. Callers go through [`write_rows`],
    /// which has already rejected batches with duplicate keys.
    async fn put_items(&self, items: Vec<Item>) -> anyhow::Result<()>;
}

/// Resolves destination tables by name.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn table(&self, name: &str) -> anyhow::Result<Arc<dyn KeyValueTable>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub table: String,
    pub written: usize,
}

/// Encode records through `schema` and write them to `table` in bulk.
///
/// A batch in which two records share the table key is rejected as a whole
/// before anything is written.
pub async fn write_rows<T: Serialize>(
    table: &dyn KeyValueTable,
    schema: &Schema,
    rows: &[T],
) -> Result<WriteReport, SinkError> {
    let definition = table.definition();
    let mut seen = HashSet::with_capacity(rows.len());
    let mut items = Vec::with_capacity(rows.len());

    for row in rows {
        let item = schema.encode(row)?;
        let key = definition.key_of(&item).ok_or_else(|| SinkError::MissingKey {
            table: table.name().to_string(),
        })?;
        if !seen.insert(key.clone()) {
            return Err(SinkError::DuplicateKey {
                table: table.name().to_string(),
                key,
            });
        }
        items.push(item);
    }

    let written = items.len();
    if written > 0 {
        table.put_items(items).await?;
    }
    info!(table = table.name(), written, "batch written");

    Ok(WriteReport {
        table: table.name().to_string(),
        written,
    })
}

/// Resolve a table and log its current item count.
pub async fn open_table(store: &dyn TableStore, name: &str) -> anyhow::Result<Arc<dyn KeyValueTable>> {
    let table = store.table(name).await?;
    let item_count = table
        .item_count()
        .await
        .with_context(|| format!("reading item count of {name}"))?;
    info!(table = name, item_count, "resolved destination table");
    Ok(table)
}

/// In-process table keyed like the managed one; later puts replace earlier ones.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    name: String,
    definition: TableDefinition,
    items: Arc<Mutex<BTreeMap<ItemKey, Item>>>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: TableDefinition::post_snapshot(),
            items: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub async fn items(&self) -> Vec<Item> {
        self.items.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, key: &ItemKey) -> Option<Item> {
        self.items.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl KeyValueTable for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> TableDefinition {
        self.definition
    }

    async fn item_count(&self) -> anyhow::Result<u64> {
        Ok(self.items.lock().await.len() as u64)
    }

    async fn put_items(&self, items: Vec<Item>) -> anyhow::Result<()> {
        let mut map = self.items.lock().await;
        for item in items {
            let key = self
                .definition
                .key_of(&item)
                .with_context(|| format!("item without key attributes for {}", self.name))?;
            map.insert(key, item);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<HashMap<String, MemoryTable>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on a table created by an earlier [`TableStore::table`] call.
    pub async fn existing(&self, name: &str) -> Option<MemoryTable> {
        self.tables.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn table(&self, name: &str) -> anyhow::Result<Arc<dyn KeyValueTable>> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .entry(name.to_string())
            .or_insert_with(|| MemoryTable::new(name))
            .clone();
        Ok(Arc::new(table))
    }
}

/// Local table: each batch lands as a JSON-lines file under `<root>/<table>/`,
/// written through a temp file and an atomic rename.
///
/// Files are named `<sequence>-<sha256>.jsonl`. The sequence is a zero-padded
/// nanosecond stamp that strictly increases within a table, so replaying
/// files in name order replays puts in write order.
#[derive(Debug, Clone)]
pub struct FileTable {
    dir: PathBuf,
    name: String,
    definition: TableDefinition,
}

impl FileTable {
    pub fn new(root: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            dir: root.as_ref().join(&name),
            name,
            definition: TableDefinition::post_snapshot(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Batch files in write order.
    async fn batch_files(&self) -> anyhow::Result<Vec<BatchFile>> {
        if !fs::try_exists(&self.dir)
            .await
            .with_context(|| format!("checking table directory {}", self.dir.display()))?
        {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(file) = BatchFile::parse(entry.path()) {
                files.push(file);
            }
        }
        files.sort_by_key(|file| file.sequence);
        Ok(files)
    }

    /// All items currently stored, later batches replacing earlier ones by key.
    pub async fn items(&self) -> anyhow::Result<Vec<Item>> {
        let mut by_key = BTreeMap::new();
        for file in self.batch_files().await? {
            let path = &file.path;
            let text = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                let item: Item = serde_json::from_str(line)
                    .with_context(|| format!("parsing item in {}", path.display()))?;
                if let Some(key) = self.definition.key_of(&item) {
                    by_key.insert(key, item);
                }
            }
        }
        Ok(by_key.into_values().collect())
    }
}

#[derive(Debug, Clone)]
struct BatchFile {
    path: PathBuf,
    sequence: u128,
    content_hash: String,
}

impl BatchFile {
    fn parse(path: PathBuf) -> Option<Self> {
        if path.extension()? != "jsonl" {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let (sequence, content_hash) = stem.split_once('-')?;
        let sequence = sequence.parse().ok()?;
        let content_hash = content_hash.to_string();
        Some(Self {
            path,
            sequence,
            content_hash,
        })
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

#[async_trait]
impl KeyValueTable for FileTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn definition(&self) -> TableDefinition {
        self.definition
    }

    async fn item_count(&self) -> anyhow::Result<u64> {
        Ok(self.items().await?.len() as u64)
    }

    async fn put_items(&self, items: Vec<Item>) -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        for item in &items {
            serde_json::to_writer(&mut bytes, item).context("serializing item")?;
            bytes.push(b'\n');
        }

        let content_hash = Self::sha256_hex(&bytes);
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating table directory {}", self.dir.display()))?;

        let latest = self.batch_files().await?.pop();
        if latest
            .as_ref()
            .is_some_and(|file| file.content_hash == content_hash)
        {
            debug!(table = %self.name, %content_hash, "batch identical to the latest one, skipping");
            return Ok(());
        }
        let sequence = latest
            .map(|file| file.sequence + 1)
            .unwrap_or_default()
            .max(unix_nanos());
        let path = self.dir.join(format!("{sequence:020}-{content_hash}.jsonl"));

        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp batch file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp batch file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp batch file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp batch {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FileTableStore {
    root: PathBuf,
}

impl FileTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl TableStore for FileTableStore {
    async fn table(&self, name: &str) -> anyhow::Result<Arc<dyn KeyValueTable>> {
        Ok(Arc::new(FileTable::new(&self.root, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vrp_core::{ItemValue, Row};

    fn row(post_id: &str, load_ts: &str) -> Row {
        Row {
            post_id: post_id.to_string(),
            subreddit: "pics".into(),
            subscribers: 10_000_000,
            active_users: 10_000,
            title: "Magnolia tree blooming in my friends yard".into(),
            created_ts_utc: "2023-04-30 04:19:43".into(),
            time_elapsed_min: 44,
            score: 3,
            num_comments: 0,
            upvote_ratio: 1.0,
            num_gildings: 0,
            load_ts_utc: load_ts.to_string(),
            load_date_utc: "2023-04-30".into(),
            load_time_utc: "05:03:44".into(),
        }
    }

    #[tokio::test]
    async fn distinct_post_ids_become_distinct_items() {
        let table = MemoryTable::new("rising-test");
        let rows = vec![
            row("133fkqz", "2023-04-30 05:03:44"),
            row("133fkqy", "2023-04-30 05:03:44"),
        ];

        let report = write_rows(&table, &Schema::post_snapshot(), &rows)
            .await
            .expect("write");

        assert_eq!(report.written, 2);
        assert_eq!(table.item_count().await.unwrap(), 2);
        let stored = table
            .get(&ItemKey {
                hash: "133fkqy".into(),
                range: Some("2023-04-30 05:03:44".into()),
            })
            .await
            .expect("stored item");
        assert_eq!(stored["upvoteRatio"], ItemValue::Number("1.0".into()));
    }

    #[tokio::test]
    async fn duplicate_keys_fail_the_whole_batch() {
        let table = MemoryTable::new("rising-test");
        let rows = vec![
            row("133fkqz", "2023-04-30 05:03:44"),
            row("133fqj7", "2023-04-30 05:03:44"),
            row("133fkqz", "2023-04-30 05:03:44"),
        ];

        let err = write_rows(&table, &Schema::post_snapshot(), &rows)
            .await
            .unwrap_err();

        match err {
            SinkError::DuplicateKey { table, key } => {
                assert_eq!(table, "rising-test");
                assert_eq!(key.hash, "133fkqz");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(table.item_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn same_post_at_different_load_times_is_not_a_duplicate() {
        let table = MemoryTable::new("hot-test");
        let rows = vec![
            row("133fkqz", "2023-04-30 05:03:44"),
            row("133fkqz", "2023-04-30 05:06:44"),
        ];
        write_rows(&table, &Schema::post_snapshot(), &rows)
            .await
            .expect("write");
        assert_eq!(table.items().await.len(), 2);
    }

    #[tokio::test]
    async fn memory_store_hands_out_shared_tables() {
        let store = MemoryTableStore::new();
        let table = open_table(&store, "hot-dev").await.expect("open");
        write_rows(
            table.as_ref(),
            &Schema::post_snapshot(),
            &[row("133fkqz", "2023-04-30 05:03:44")],
        )
        .await
        .expect("write");

        let existing = store.existing("hot-dev").await.expect("table exists");
        assert_eq!(existing.item_count().await.unwrap(), 1);
        assert!(store.existing("rising-dev").await.is_none());
    }

    fn batch_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn file_table_skips_a_repeat_of_the_latest_batch() {
        let dir = tempdir().expect("tempdir");
        let store = FileTableStore::new(dir.path());
        let table = store.table("rising-dev").await.expect("table");
        let rows = vec![
            row("133fkqz", "2023-04-30 05:03:44"),
            row("133fqj7", "2023-04-30 05:03:44"),
        ];

        write_rows(table.as_ref(), &Schema::post_snapshot(), &rows)
            .await
            .expect("first write");
        write_rows(table.as_ref(), &Schema::post_snapshot(), &rows)
            .await
            .expect("second write");

        let names = batch_names(&dir.path().join("rising-dev"));
        assert_eq!(names.len(), 1, "identical batches share one file");
        assert!(names[0].ends_with(".jsonl"));
        assert_eq!(names[0].split_once('-').unwrap().0.len(), 20);
        assert_eq!(table.item_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn file_table_keeps_the_last_put_like_memory_table() {
        let dir = tempdir().expect("tempdir");
        let file_table = FileTable::new(dir.path(), "hot-dev");
        let memory_table = MemoryTable::new("hot-dev");
        let key = ItemKey {
            hash: "133fkqz".into(),
            range: Some("2023-04-30 05:03:44".into()),
        };

        for round in 0..20 {
            let mut first = row("133fkqz", "2023-04-30 05:03:44");
            first.score = round;
            let mut second = first.clone();
            second.score = round + 100;

            for update in [&first, &second] {
                let rows = std::slice::from_ref(update);
                write_rows(&file_table, &Schema::post_snapshot(), rows)
                    .await
                    .expect("file write");
                write_rows(&memory_table, &Schema::post_snapshot(), rows)
                    .await
                    .expect("memory write");
            }

            let from_file = file_table.items().await.unwrap();
            let from_memory = memory_table.get(&key).await.expect("memory item");
            assert_eq!(from_file.len(), 1);
            assert_eq!(from_file[0]["score"], from_memory["score"]);
            assert_eq!(
                from_file[0]["score"],
                ItemValue::Number((round + 100).to_string())
            );
        }
    }

    #[tokio::test]
    async fn file_table_reapplies_an_older_batch_written_again() {
        let dir = tempdir().expect("tempdir");
        let table = FileTable::new(dir.path(), "hot-dev");
        let original = row("133fkqz", "2023-04-30 05:03:44");
        let mut revised = original.clone();
        revised.score = 99;

        for update in [&original, &revised, &original] {
            write_rows(&table, &Schema::post_snapshot(), std::slice::from_ref(update))
                .await
                .expect("write");
        }

        assert_eq!(batch_names(table.dir()).len(), 3);
        let items = table.items().await.unwrap();
        assert_eq!(items[0]["score"], ItemValue::Number("3".into()));
    }

    #[tokio::test]
    async fn file_table_missing_directory_counts_zero() {
        let dir = tempdir().expect("tempdir");
        let table = FileTable::new(dir.path(), "hot-dev");
        assert_eq!(table.item_count().await.unwrap(), 0);
    }
}
