use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use aws_config::BehaviorVersion;
use ini::Ini;
use serde::Deserialize;
use tokio::fs;
use tracing::info;

/// Script-app credentials for the Reddit API.
#[derive(Clone, Deserialize)]
pub struct RedditCredentials {
    #[serde(alias = "CLIENTID")]
    pub client_id: String,
    #[serde(alias = "CLIENTSECRET")]
    pub client_secret: String,
    #[serde(alias = "USERNAME")]
    pub username: String,
    #[serde(alias = "PASSWORD")]
    pub password: String,
}

impl fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

const SECTION: &str = "reddit_api";

/// On-disk layout of a credential bundle, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFormat {
    /// `[reddit_api]` section with `CLIENTID`, `CLIENTSECRET`, `USERNAME`, `PASSWORD`.
    Ini,
    /// `reddit_api:` mapping with the same fields.
    Yaml,
}

impl CredentialFormat {
    pub fn for_name(name: &str) -> Self {
        if name.ends_with(".yaml") || name.ends_with(".yml") {
            Self::Yaml
        } else {
            Self::Ini
        }
    }
}

#[derive(Debug, Deserialize)]
struct CredentialFile {
    reddit_api: RedditCredentials,
}

/// Where the credential bundle lives: `s3://bucket/key` or a local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialLocation {
    S3 { bucket: String, key: String },
    Local(PathBuf),
}

impl CredentialLocation {
    pub fn s3(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::S3 {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn format(&self) -> CredentialFormat {
        match self {
            Self::S3 { key, .. } => CredentialFormat::for_name(key),
            Self::Local(path) => CredentialFormat::for_name(&path.to_string_lossy()),
        }
    }
}

impl FromStr for CredentialLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some(rest) = s.strip_prefix("s3://") else {
            return Ok(Self::Local(PathBuf::from(s)));
        };
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::s3(bucket, key))
            }
            _ => bail!("expected s3://<bucket>/<key>, got {s}"),
        }
    }
}

impl fmt::Display for CredentialLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3 { bucket, key } => write!(f, "s3://{bucket}/{key}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Parse a credential bundle in the given layout.
pub fn parse_credentials(text: &str, format: CredentialFormat) -> Result<RedditCredentials> {
    match format {
        CredentialFormat::Ini => parse_ini(text),
        CredentialFormat::Yaml => {
            let file: CredentialFile =
                serde_yaml::from_str(text).context("parsing credential bundle")?;
            Ok(file.reddit_api)
        }
    }
}

// Keys are matched case-insensitively, like configparser does.
fn parse_ini(text: &str) -> Result<RedditCredentials> {
    let ini = Ini::load_from_str(text).context("parsing credential bundle")?;
    let section = ini
        .section(Some(SECTION))
        .with_context(|| format!("credential bundle has no [{SECTION}] section"))?;
    let field = |name: &str| {
        section
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.to_string())
            .with_context(|| format!("[{SECTION}] is missing {name}"))
    };
    Ok(RedditCredentials {
        client_id: field("CLIENTID")?,
        client_secret: field("CLIENTSECRET")?,
        username: field("USERNAME")?,
        password: field("PASSWORD")?,
    })
}

pub async fn load_credentials(location: &CredentialLocation) -> Result<RedditCredentials> {
    info!(%location, "loading credentials");
    let text = match location {
        CredentialLocation::S3 { bucket, key } => fetch_s3_object(bucket, key).await?,
        CredentialLocation::Local(path) => fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
    };
    parse_credentials(&text, location.format())
        .with_context(|| format!("loading credentials from {location}"))
}

async fn fetch_s3_object(bucket: &str, key: &str) -> Result<String> {
    let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let client = aws_sdk_s3::Client::new(&config);
    let object = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| format!("fetching s3://{bucket}/{key}"))?;
    let bytes = object
        .body
        .collect()
        .await
        .with_context(|| format!("reading body of s3://{bucket}/{key}"))?
        .into_bytes();
    String::from_utf8(bytes.to_vec()).context("credential bundle is not UTF-8")
}
