//! Core record model, schema, and listing request types for the collector.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "vrp-core";

/// Upstream listings cap out at 25 entries per request.
pub const MAX_REQUESTED_COUNT: u32 = 25;

/// Extra entries requested upstream to make up for stickied posts.
pub const STICKY_ALLOWANCE: u32 = 2;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("requested count {requested} exceeds the listing cap of {max}")]
    CountTooLarge { requested: u32, max: u32 },
    #[error("invalid listing kind `{0}` (expected rising, hot or top)")]
    InvalidListingKind(String),
    #[error("invalid time filter `{0}` (expected all, day, hour, month, week or year)")]
    InvalidTimeFilter(String),
    #[error("listing kind `top` requires a time filter")]
    MissingTimeFilter,
}

/// Traversal mode offered by the upstream API for a community's posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingKind {
    Rising,
    Hot,
    Top,
}

impl ListingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rising => "rising",
            Self::Hot => "hot",
            Self::Top => "top",
        }
    }
}

impl fmt::Display for ListingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingKind {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rising" => Ok(Self::Rising),
            "hot" => Ok(Self::Hot),
            "top" => Ok(Self::Top),
            other => Err(RequestError::InvalidListingKind(other.to_string())),
        }
    }
}

/// Time window for `top` listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    All,
    Day,
    Hour,
    Month,
    Week,
    Year,
}

impl TimeFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Month => "month",
            Self::Week => "week",
            Self::Year => "year",
        }
    }
}

impl fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeFilter {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "day" => Ok(Self::Day),
            "hour" => Ok(Self::Hour),
            "month" => Ok(Self::Month),
            "week" => Ok(Self::Week),
            "year" => Ok(Self::Year),
            other => Err(RequestError::InvalidTimeFilter(other.to_string())),
        }
    }
}

/// A validated request for one listing of one community.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListingRequest {
    kind: ListingKind,
    requested_count: u32,
    time_filter: Option<TimeFilter>,
}

impl ListingRequest {
    pub fn new(
        kind: ListingKind,
        requested_count: u32,
        time_filter: Option<TimeFilter>,
    ) -> Result<Self, RequestError> {
        if requested_count > MAX_REQUESTED_COUNT {
            return Err(RequestError::CountTooLarge {
                requested: requested_count,
                max: MAX_REQUESTED_COUNT,
            });
        }
        if kind == ListingKind::Top && time_filter.is_none() {
            return Err(RequestError::MissingTimeFilter);
        }
        // Only top listings are windowed.
        let time_filter = if kind == ListingKind::Top {
            time_filter
        } else {
            None
        };
        Ok(Self {
            kind,
            requested_count,
            time_filter,
        })
    }

    /// Validate a request given in its string form, as the CLI receives it.
    pub fn parse(
        kind: &str,
        requested_count: u32,
        time_filter: Option<&str>,
    ) -> Result<Self, RequestError> {
        let kind = kind.parse::<ListingKind>()?;
        let time_filter = time_filter.map(str::parse::<TimeFilter>).transpose()?;
        Self::new(kind, requested_count, time_filter)
    }

    pub fn kind(&self) -> ListingKind {
        self.kind
    }

    pub fn requested_count(&self) -> u32 {
        self.requested_count
    }

    pub fn time_filter(&self) -> Option<TimeFilter> {
        self.time_filter
    }

    /// Number of entries to ask the upstream API for.
    pub fn upstream_limit(&self) -> u32 {
        self.requested_count + STICKY_ALLOWANCE
    }
}

/// One observed post snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(rename = "postId")]
    pub post_id: String,
    pub subreddit: String,
    pub subscribers: i64,
    #[serde(rename = "activeUsers")]
    pub active_users: i64,
    pub title: String,
    #[serde(rename = "createdTSUTC")]
    pub created_ts_utc: String,
    #[serde(rename = "timeElapsedMin")]
    pub time_elapsed_min: i64,
    pub score: i64,
    #[serde(rename = "numComments")]
    pub num_comments: i64,
    #[serde(rename = "upvoteRatio")]
    pub upvote_ratio: f64,
    #[serde(rename = "numGildings")]
    pub num_gildings: i64,
    #[serde(rename = "loadTSUTC")]
    pub load_ts_utc: String,
    #[serde(rename = "loadDateUTC")]
    pub load_date_utc: String,
    #[serde(rename = "loadTimeUTC")]
    pub load_time_utc: String,
}

/// The three load-time columns shared by every row of one collection batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStamp {
    pub ts: String,
    pub date: String,
    pub time: String,
}

impl LoadStamp {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            ts: format_utc(now),
            date: now.format(DATE_FORMAT).to_string(),
            time: now.format(TIME_FORMAT).to_string(),
        }
    }
}

pub fn format_utc(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaField {
    pub name: &'static str,
    pub field_type: FieldType,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("record did not serialize to a flat object")]
    NotAnObject,
    #[error("record is missing schema field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` expected {expected:?}, found {found}")]
    TypeMismatch {
        field: &'static str,
        expected: FieldType,
        found: &'static str,
    },
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Attribute value of a table item. Numbers are carried as decimal text so
/// floats never pass through a binary encoding on their way to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemValue {
    #[serde(rename = "S")]
    Text(String),
    #[serde(rename = "N")]
    Number(String),
}

impl ItemValue {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(s) | Self::Number(s) => s,
        }
    }
}

pub type Item = BTreeMap<String, ItemValue>;

/// Ordered mapping from field name to primitive type describing one output record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schema {
    fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    /// Schema of [`Row`], in column order.
    pub fn post_snapshot() -> Self {
        let fields = [
            ("postId", FieldType::String),
            ("subreddit", FieldType::String),
            ("subscribers", FieldType::Integer),
            ("activeUsers", FieldType::Integer),
            ("title", FieldType::String),
            ("createdTSUTC", FieldType::String),
            ("timeElapsedMin", FieldType::Integer),
            ("score", FieldType::Integer),
            ("numComments", FieldType::Integer),
            ("upvoteRatio", FieldType::Float),
            ("numGildings", FieldType::Integer),
            ("loadTSUTC", FieldType::String),
            ("loadDateUTC", FieldType::String),
            ("loadTimeUTC", FieldType::String),
        ];
        Self::new(
            fields
                .into_iter()
                .map(|(name, field_type)| SchemaField { name, field_type })
                .collect(),
        )
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    /// Shape a record into a table item, keeping only schema columns and
    /// checking each against its declared type.
    pub fn encode<T: Serialize>(&self, record: &T) -> Result<Item, SchemaError> {
        let JsonValue::Object(map) = serde_json::to_value(record)? else {
            return Err(SchemaError::NotAnObject);
        };

        let mut item = Item::new();
        for field in &self.fields {
            let value = map
                .get(field.name)
                .ok_or(SchemaError::MissingField(field.name))?;
            let encoded = match (field.field_type, value) {
                (FieldType::String, JsonValue::String(s)) => ItemValue::Text(s.clone()),
                (FieldType::Integer, JsonValue::Number(n)) if n.is_i64() || n.is_u64() => {
                    ItemValue::Number(n.to_string())
                }
                (FieldType::Float, JsonValue::Number(n)) => ItemValue::Number(n.to_string()),
                (expected, found) => {
                    return Err(SchemaError::TypeMismatch {
                        field: field.name,
                        expected,
                        found: json_type_name(found),
                    })
                }
            };
            item.insert(field.name.to_string(), encoded);
        }
        Ok(item)
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(n) if n.is_f64() => "float",
        JsonValue::Number(_) => "integer",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Identity of an item in the destination table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    pub hash: String,
    pub range: Option<String>,
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            Some(range) => write!(f, "{}/{}", self.hash, range),
            None => f.write_str(&self.hash),
        }
    }
}

/// Key attributes of the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableDefinition {
    pub hash_key: &'static str,
    pub range_key: Option<&'static str>,
}

impl TableDefinition {
    pub fn post_snapshot() -> Self {
        Self {
            hash_key: "postId",
            range_key: Some("loadTSUTC"),
        }
    }

    pub fn key_of(&self, item: &Item) -> Option<ItemKey> {
        let hash = item.get(self.hash_key)?.as_str().to_string();
        let range = match self.range_key {
            Some(name) => Some(item.get(name)?.as_str().to_string()),
            None => None,
        };
        Some(ItemKey { hash, range })
    }
}
