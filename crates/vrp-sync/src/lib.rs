//! Collection job orchestration: community passes, deduplication, sink writes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;
use vrp_adapters::{
    fetch_and_shape, CommunitySource, FixtureSource, RedditClient, RedditClientConfig,
};
use vrp_core::{ListingKind, ListingRequest, Row, Schema};
use vrp_storage::{
    connect_dynamodb, load_credentials, open_table, write_rows, CredentialLocation,
    DynamoTableStore, FileTableStore, MemoryTableStore, TableStore,
};

pub const CRATE_NAME: &str = "vrp-sync";

pub const STATUS_OK: u16 = 200;

pub const DEFAULT_COMMUNITIES: [&str; 8] = [
    "pics",
    "gaming",
    "worldnews",
    "news",
    "aww",
    "funny",
    "todayilearned",
    "movies",
];

/// Which communities to visit and how many entries to ask for per listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub communities: Vec<String>,
    pub rising_count: u32,
    pub hot_count: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            communities: DEFAULT_COMMUNITIES.iter().map(|s| s.to_string()).collect(),
            rising_count: 25,
            hot_count: 3,
        }
    }
}

impl JobConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing job config")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// The listing passes run for every community, in order.
    pub fn passes(&self) -> Result<Vec<ListingRequest>> {
        Ok(vec![
            ListingRequest::new(ListingKind::Rising, self.rising_count, None)?,
            ListingRequest::new(ListingKind::Hot, self.hot_count, None)?,
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationKind {
    DynamoDb { endpoint: Option<String> },
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Reddit,
    Fixtures(PathBuf),
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Deployment environment from `ENV`; suffixes every table name.
    pub environment: Option<String>,
    pub bucket: Option<String>,
    pub credentials: CredentialLocation,
    pub job_config_path: Option<PathBuf>,
    pub source: SourceKind,
    pub destination: DestinationKind,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bucket = lookup("AWS_BUCKET").filter(|b| !b.is_empty());
        let credentials = match lookup("VRP_CREDENTIALS") {
            Some(location) => location.parse()?,
            None => match &bucket {
                Some(bucket) => CredentialLocation::s3(bucket.clone(), "reddit.cfg"),
                None => CredentialLocation::Local(PathBuf::from("./reddit.cfg")),
            },
        };

        let source = match lookup("VRP_SOURCE").as_deref() {
            None | Some("reddit") => SourceKind::Reddit,
            Some(other) => match other.strip_prefix("fixtures:") {
                Some(dir) => SourceKind::Fixtures(PathBuf::from(dir)),
                None => bail!("VRP_SOURCE must be `reddit` or `fixtures:<dir>`, got {other}"),
            },
        };

        let destination = match lookup("VRP_DESTINATION").as_deref() {
            None | Some("dynamodb") => DestinationKind::DynamoDb {
                endpoint: lookup("DYNAMODB_ENDPOINT"),
            },
            Some("memory") => DestinationKind::Memory,
            Some(other) => match other.strip_prefix("file:") {
                Some(dir) => DestinationKind::File(PathBuf::from(dir)),
                None => bail!(
                    "VRP_DESTINATION must be `dynamodb`, `memory` or `file:<dir>`, got {other}"
                ),
            },
        };

        Ok(Self {
            environment: lookup("ENV").filter(|e| !e.is_empty()),
            bucket,
            credentials,
            job_config_path: lookup("VRP_JOB_CONFIG").map(PathBuf::from),
            source,
            destination,
            user_agent: lookup("VRP_USER_AGENT"),
            http_timeout_secs: lookup("VRP_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        })
    }

    /// The environment a collection run writes to. Unset `ENV` is an error.
    pub fn environment(&self) -> Result<&str> {
        self.environment
            .as_deref()
            .context("ENV must be set to name the destination environment")
    }
}

pub fn table_name(kind: ListingKind, environment: &str) -> String {
    format!("{kind}-{environment}")
}

pub trait DedupHook: Send + Sync {
    fn apply(&self, rows: Vec<Row>) -> Result<Vec<Row>>;
}

/// Keeps the most recently loaded row per post id.
#[derive(Debug, Default)]
pub struct LatestLoadDedup;

impl DedupHook for LatestLoadDedup {
    fn apply(&self, rows: Vec<Row>) -> Result<Vec<Row>> {
        Ok(deduplicate_latest(rows))
    }
}

/// One row per post id, preferring the latest load timestamp. Output is
/// ordered by load timestamp, newest first.
pub fn deduplicate_latest(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| b.load_ts_utc.cmp(&a.load_ts_utc));
    let mut seen = HashSet::with_capacity(rows.len());
    rows.retain(|row| seen.insert(row.post_id.clone()));
    rows
}

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub community: String,
    pub kind: ListingKind,
    pub table: String,
    pub shaped_rows: usize,
    pub written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub run_id: Uuid,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passes: Vec<PassReport>,
}

impl CollectionSummary {
    pub fn total_written(&self) -> usize {
        self.passes.iter().map(|p| p.written).sum()
    }

    pub fn written_by_table(&self) -> HashMap<&str, usize> {
        let mut out = HashMap::new();
        for pass in &self.passes {
            *out.entry(pass.table.as_str()).or_default() += pass.written;
        }
        out
    }
}

/// Runs the listing passes for every configured community, strictly in order.
/// The first failure aborts the remaining work.
pub struct CollectionJob {
    environment: String,
    config: JobConfig,
    schema: Schema,
    source: Box<dyn CommunitySource>,
    tables: Arc<dyn TableStore>,
    dedup: Box<dyn DedupHook>,
}

impl CollectionJob {
    pub fn new(
        environment: impl Into<String>,
        config: JobConfig,
        source: Box<dyn CommunitySource>,
        tables: Arc<dyn TableStore>,
    ) -> Self {
        Self {
            environment: environment.into(),
            config,
            schema: Schema::post_snapshot(),
            source,
            tables,
            dedup: Box::<LatestLoadDedup>::default(),
        }
    }

    pub fn with_dedup(mut self, dedup: Box<dyn DedupHook>) -> Self {
        self.dedup = dedup;
        self
    }

    pub async fn run_once(&self) -> Result<CollectionSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let passes = self.config.passes()?;
        let span = info_span!(
            "collection_run",
            %run_id,
            environment = %self.environment,
            source = self.source.source_id()
        );

        let reports = async {
            let mut reports = Vec::new();
            for community in &self.config.communities {
                info!(community = %community, "gathering data");
                for request in &passes {
                    reports.push(self.run_pass(community, request).await?);
                }
            }
            Ok::<_, anyhow::Error>(reports)
        }
        .instrument(span)
        .await?;

        Ok(CollectionSummary {
            run_id,
            environment: self.environment.clone(),
            started_at,
            finished_at: Utc::now(),
            passes: reports,
        })
    }

    pub async fn run_pass(&self, community: &str, request: &ListingRequest) -> Result<PassReport> {
        let kind = request.kind();
        let rows = fetch_and_shape(self.source.as_ref(), community, request)
            .await
            .with_context(|| format!("fetching {kind} listing for {community}"))?;
        let shaped_rows = rows.len();
        let rows = self.dedup.apply(rows)?;

        let table_name = table_name(kind, &self.environment);
        let table = open_table(self.tables.as_ref(), &table_name).await?;
        let report = write_rows(table.as_ref(), &self.schema, &rows)
            .await
            .with_context(|| format!("writing {kind} rows for {community} to {table_name}"))?;
        info!(community, %kind, shaped_rows, written = report.written, "pass complete");

        Ok(PassReport {
            community: community.to_string(),
            kind,
            table: table_name,
            shaped_rows,
            written: report.written,
        })
    }
}

pub async fn build_source(config: &CollectorConfig) -> Result<Box<dyn CommunitySource>> {
    match &config.source {
        SourceKind::Reddit => {
            let credentials = load_credentials(&config.credentials).await?;
            let mut client_config = RedditClientConfig::for_username(&credentials.username);
            client_config.timeout = Duration::from_secs(config.http_timeout_secs);
            if let Some(user_agent) = &config.user_agent {
                client_config.user_agent = user_agent.clone();
            }
            Ok(Box::new(RedditClient::new(credentials, client_config)?))
        }
        SourceKind::Fixtures(dir) => Ok(Box::new(FixtureSource::new(dir.clone()))),
    }
}

pub async fn build_table_store(config: &CollectorConfig) -> Arc<dyn TableStore> {
    match &config.destination {
        DestinationKind::DynamoDb { endpoint } => Arc::new(DynamoTableStore::new(
            connect_dynamodb(endpoint.as_deref()).await,
        )),
        DestinationKind::Memory => Arc::new(MemoryTableStore::new()),
        DestinationKind::File(dir) => Arc::new(FileTableStore::new(dir.clone())),
    }
}

pub async fn build_job(config: &CollectorConfig) -> Result<CollectionJob> {
    let environment = config.environment()?.to_string();
    let job_config = match &config.job_config_path {
        Some(path) => JobConfig::load(path).await?,
        None => JobConfig::default(),
    };
    let source = build_source(config).await?;
    let tables = build_table_store(config).await;
    Ok(CollectionJob::new(environment, job_config, source, tables))
}

pub async fn run_collection_from_env() -> Result<CollectionSummary> {
    let config = CollectorConfig::from_env()?;
    build_job(&config).await?.run_once().await
}

/// Context handed over by whatever runtime triggers the job. Opaque here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationContext {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub function_name: Option<String>,
}

/// Entry point for scheduled invocations. Returns 200 once every community
/// has been collected; any failure propagates to the caller.
pub async fn handle_invocation(
    event: serde_json::Value,
    context: InvocationContext,
) -> Result<u16> {
    info!(
        request_id = context.request_id.as_deref().unwrap_or("-"),
        function = context.function_name.as_deref().unwrap_or("-"),
        event = %event,
        "invocation received"
    );
    let summary = run_collection_from_env().await?;
    info!(
        run_id = %summary.run_id,
        passes = summary.passes.len(),
        written = summary.total_written(),
        "collection complete"
    );
    Ok(STATUS_OK)
}
