use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use tracing::debug;

use connector_core::config::ApiConfig;
use connector_core::retry::{retry, RetryPolicy};
use connector_core::{Error, Result};

use crate::model::{Granularity, QueryResponse, QuerySpec, TimeValue, COMPACT_DATE};

/// The remote query API as the collector, period resolver, and tables see
/// it. Implementations own their retry behavior; a terminal error means the
/// budget for that call is spent.
#[async_trait]
pub trait QueryApi: Send + Sync {
    /// Fetch one page of a query result at the given row offset.
    async fn fetch_page(&self, spec: &QuerySpec, offset: u64) -> Result<QueryResponse>;

    /// Resolve the period token containing `date` at the given granularity.
    async fn time_value(&self, date: NaiveDate, granularity: Granularity) -> Result<String>;
}

/// HTTP client for the query API. Every call goes through the forwarding
/// gateway (`proxy_url?endpoint=<remote url>`) with HTTP Basic credentials,
/// and runs under the policy for its concern.
pub struct QueryClient {
    http: reqwest::Client,
    proxy_url: String,
    base_url: String,
    account_id: String,
    username: String,
    password: String,
    query_retry: RetryPolicy,
    period_retry: RetryPolicy,
}

impl QueryClient {
    pub fn new(api: &ApiConfig, query_retry: RetryPolicy, period_retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(api.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            proxy_url: api.proxy_url.clone(),
            base_url: api.base_url.trim_end_matches('/').to_string(),
            account_id: api.account_id.clone(),
            username: api.username.clone(),
            password: api.password.clone(),
            query_retry,
            period_retry,
        })
    }

    fn query_endpoint(&self) -> String {
        format!("{}/query/{}", self.base_url, self.account_id)
    }

    fn time_endpoint(&self, granularity: Granularity, date: NaiveDate) -> String {
        format!(
            "{}/objects/time/{}/{}/{}",
            self.base_url,
            self.account_id,
            granularity,
            date.format(COMPACT_DATE)
        )
    }

    async fn expect_ok(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl QueryApi for QueryClient {
    async fn fetch_page(&self, spec: &QuerySpec, offset: u64) -> Result<QueryResponse> {
        let endpoint = self.query_endpoint();
        let body = spec.body(offset);

        retry(&self.query_retry, &endpoint, || async {
            debug!(dataset = %spec.dataset, offset, "requesting page");
            let response = self
                .http
                .post(&self.proxy_url)
                .query(&[("endpoint", endpoint.as_str())])
                .basic_auth(&self.username, Some(&self.password))
                .json(&body)
                .send()
                .await?;
            let response = Self::expect_ok(response, &endpoint).await?;
            let page = response.json::<QueryResponse>().await?;
            Ok(page)
        })
        .await
    }

    async fn time_value(&self, date: NaiveDate, granularity: Granularity) -> Result<String> {
        let endpoint = self.time_endpoint(granularity, date);

        retry(&self.period_retry, &endpoint, || async {
            let response = self
                .http
                .get(&self.proxy_url)
                .query(&[("endpoint", endpoint.as_str())])
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .await?;
            let response = Self::expect_ok(response, &endpoint).await?;
            let value = response.json::<TimeValue>().await?;
            Ok(value.time_value)
        })
        .await
    }
}
