//! Access to the remote analytics and metadata API.

use std::time::Duration;

use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::ExponentialBackoffBuilder;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Credentials;
use crate::error::ClientError;
use crate::hierarchy::OrgUnit;
use crate::period::Period;

const USER_AGENT: &str = concat!("extractor/", env!("CARGO_PKG_VERSION"));

/// Statuses worth another attempt; anything else fails immediately.
const RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Whether a response with `status` is retried.
pub fn is_retryable(status: StatusCode) -> bool {
    RETRY_STATUSES.contains(&status.as_u16())
}

/// Exponential backoff for transient failures: the interval starts at
/// `initial_interval` and doubles up to `max_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(120),
        }
    }
}

/// Raw analytics payload. Each row is `[indicator, period, org unit, value, ...]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsResponse {
    #[serde(default)]
    pub rows: Option<Vec<Vec<serde_json::Value>>>,
}

#[derive(Debug, Deserialize)]
struct OrgUnitsResponse {
    #[serde(default, rename = "organisationUnits")]
    organisation_units: Vec<OrgUnit>,
}

/// The remote source queried by a run.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    /// Long-format observations for `indicators` in `period`, for units selected by `scope`.
    async fn analytics(
        &self,
        indicators: &[String],
        period: Period,
        scope: &str,
    ) -> Result<AnalyticsResponse, ClientError>;

    /// Every organisation unit at `level`, unpaged.
    async fn org_units_at_level(&self, level: u32) -> Result<Vec<OrgUnit>, ClientError>;
}

/// HTTP implementation backed by `reqwest`, retrying transient failures
/// with exponential backoff.
#[derive(Clone, Debug)]
pub struct Dhis2Client {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    retry: RetryPolicy,
}

impl Dhis2Client {
    pub fn new(credentials: &Credentials, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            http,
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ClientError>
    where
        T: DeserializeOwned + Send,
    {
        let url = self.url(path);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_interval)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(self.retry.max_interval)
            .with_max_elapsed_time(None)
            .build();

        let max_retries = self.retry.max_retries;
        let mut attempt = 0u32;
        retry_notify(
            policy,
            || {
                attempt += 1;
                let retries_left = attempt <= max_retries;
                let request = self
                    .http
                    .get(&url)
                    .basic_auth(&self.username, Some(&self.password))
                    .header(ACCEPT, "application/json")
                    .query(query);
                let url = url.clone();

                async move {
                    debug!(%url, attempt, "GET");
                    let response = request
                        .send()
                        .await
                        .map_err(|err| classify_transport(err, retries_left))?;

                    let status = response.status();
                    if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        let err = ClientError::Status { status, url, body };
                        return Err(if retries_left && is_retryable(status) {
                            backoff::Error::transient(err)
                        } else {
                            backoff::Error::permanent(err)
                        });
                    }

                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|err| classify_transport(err, retries_left))?;
                    serde_json::from_slice(&bytes)
                        .map_err(|source| backoff::Error::permanent(ClientError::Decode { url, source }))
                }
            },
            |err: ClientError, wait: Duration| {
                warn!(error = %err, wait_secs = wait.as_secs(), "request failed, retrying");
            },
        )
        .await
    }
}

fn classify_transport(err: reqwest::Error, retries_left: bool) -> backoff::Error<ClientError> {
    if retries_left && (err.is_connect() || err.is_timeout()) {
        backoff::Error::transient(ClientError::Request(err))
    } else {
        backoff::Error::permanent(ClientError::Request(err))
    }
}

#[async_trait]
impl AnalyticsSource for Dhis2Client {
    async fn analytics(
        &self,
        indicators: &[String],
        period: Period,
        scope: &str,
    ) -> Result<AnalyticsResponse, ClientError> {
        let query = [
            ("dimension", format!("dx:{}", indicators.join(";"))),
            ("dimension", format!("pe:{period}")),
            ("dimension", format!("ou:{scope}")),
            ("skipMeta", "true".to_string()),
            ("paging", "false".to_string()),
        ];
        self.get_json("api/analytics.json", &query).await
    }

    async fn org_units_at_level(&self, level: u32) -> Result<Vec<OrgUnit>, ClientError> {
        let query = [
            ("filter", format!("level:eq:{level}")),
            ("paging", "false".to_string()),
            ("fields", "id,name,level,path".to_string()),
        ];
        let response: OrgUnitsResponse = self.get_json("api/organisationUnits.json", &query).await?;
        Ok(response.organisation_units)
    }
}
