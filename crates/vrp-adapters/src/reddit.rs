//! Reddit API client (script-app password grant).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use vrp_core::{ListingKind, TimeFilter};
use vrp_storage::RedditCredentials;

use crate::{CommunitySource, CommunityStats, UpstreamError, UpstreamPost};

pub const DEFAULT_TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const DEFAULT_API_BASE: &str = "https://oauth.reddit.com";

/// Refresh the bearer token this long before the server says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RedditClientConfig {
    pub token_url: String,
    /// Base URL for authenticated API calls, without a trailing slash.
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub requests_per_minute: u32,
}

impl RedditClientConfig {
    pub fn for_username(username: &str) -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: format!("Post Extraction (by u/{username})"),
            requests_per_minute: 60,
        }
    }
}

/// Spaces requests so the client stays under the API's per-minute budget.
///
/// Holds up to `capacity` requests and earns one back every `interval`.
#[derive(Debug)]
struct RequestPacer {
    capacity: u32,
    interval: Duration,
    budget: Mutex<Budget>,
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    available: u32,
    /// Instant the most recent earned request is accounted up to.
    earned_until: Instant,
}

impl Budget {
    /// Credit whole intervals elapsed since `earned_until`, keeping any partial
    /// interval for the next call. A full budget does not bank time.
    fn earn(&mut self, capacity: u32, interval: Duration, now: Instant) {
        let elapsed = now.saturating_duration_since(self.earned_until);
        let intervals = elapsed.as_nanos() / interval.as_nanos().max(1);
        if intervals == 0 {
            return;
        }
        let missing = capacity.saturating_sub(self.available);
        if intervals >= u128::from(missing) {
            self.available = capacity;
            self.earned_until = now;
        } else {
            let earned = intervals as u32;
            self.available += earned;
            self.earned_until += interval * earned;
        }
    }
}

impl RequestPacer {
    fn per_minute(requests: u32) -> Self {
        let capacity = requests.max(1);
        Self {
            capacity,
            interval: Duration::from_secs(60) / capacity,
            budget: Mutex::new(Budget {
                available: capacity,
                earned_until: Instant::now(),
            }),
        }
    }

    async fn take(&self) {
        loop {
            let wait = {
                let mut budget = self.budget.lock().await;
                budget.earn(self.capacity, self.interval, Instant::now());
                if budget.available > 0 {
                    budget.available -= 1;
                    return;
                }
                self.interval
                    .saturating_sub(budget.earned_until.elapsed())
                    .max(Duration::from_millis(1))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Thing<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    children: Vec<Thing<UpstreamPost>>,
}

#[derive(Debug, Deserialize)]
struct AboutData {
    subscribers: Option<i64>,
    active_user_count: Option<i64>,
    accounts_active: Option<i64>,
}

impl From<Thing<ListingData>> for Vec<UpstreamPost> {
    fn from(listing: Thing<ListingData>) -> Self {
        listing.data.children.into_iter().map(|c| c.data).collect()
    }
}

impl From<Thing<AboutData>> for CommunityStats {
    fn from(about: Thing<AboutData>) -> Self {
        let about = about.data;
        Self {
            subscribers: about.subscribers.unwrap_or(0),
            active_users: about
                .active_user_count
                .or(about.accounts_active)
                .unwrap_or(0),
        }
    }
}

pub struct RedditClient {
    http: reqwest::Client,
    token_url: String,
    api_base: String,
    credentials: RedditCredentials,
    token: Mutex<Option<AccessToken>>,
    pacer: RequestPacer,
}

impl RedditClient {
    pub fn new(credentials: RedditCredentials, config: RedditClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self {
            http,
            token_url: config.token_url,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            credentials,
            token: Mutex::new(None),
            pacer: RequestPacer::per_minute(config.requests_per_minute),
        })
    }

    async fn access_token(&self) -> Result<String, UpstreamError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let creds = &self.credentials;
        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
            ])
            .send()
            .await?;
        let body: TokenResponse = check_status(resp).await?.json().await?;

        // Bad credentials come back as 200 with an `error` field.
        if let Some(err) = body.error {
            return Err(UpstreamError::Auth(err));
        }
        let value = body
            .access_token
            .ok_or_else(|| UpstreamError::Auth("token response without access_token".into()))?;
        let lifetime = Duration::from_secs(body.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        debug!(username = %creds.username, "obtained reddit access token");
        Ok(value)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        self.pacer.take().await;
        let token = self.access_token().await?;
        let url = format!("{}{path}", self.api_base);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .instrument(info_span!("reddit_get", url = %url))
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(UpstreamError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl CommunitySource for RedditClient {
    fn source_id(&self) -> &'static str {
        "reddit"
    }

    async fn community(&self, name: &str) -> Result<CommunityStats, UpstreamError> {
        let about: Thing<AboutData> = self
            .get_json(&format!("/r/{name}/about"), &[("raw_json", "1".to_string())])
            .await?;
        Ok(about.into())
    }

    async fn listing(
        &self,
        name: &str,
        kind: ListingKind,
        limit: u32,
        time_filter: Option<TimeFilter>,
    ) -> Result<Vec<UpstreamPost>, UpstreamError> {
        let mut query = vec![
            ("limit", limit.to_string()),
            ("raw_json", "1".to_string()),
        ];
        if let Some(filter) = time_filter {
            query.push(("t", filter.to_string()));
        }
        let listing: Thing<ListingData> = self
            .get_json(&format!("/r/{name}/{kind}"), &query)
            .await?;
        Ok(listing.into())
    }
}
