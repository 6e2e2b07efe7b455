use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::line_protocol::{self, Point};
use crate::{Error, InfluxConfig, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(rename = "orgID")]
    pub org_id: String,
}

#[derive(Deserialize)]
struct Organizations {
    #[serde(default)]
    orgs: Vec<Organization>,
}

#[derive(Deserialize)]
struct Buckets {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

#[derive(Serialize)]
struct CreateOrganization<'a> {
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RetentionRule {
    #[serde(rename = "type")]
    kind: &'static str,
    every_seconds: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBucket<'a> {
    #[serde(rename = "orgID")]
    org_id: &'a str,
    name: &'a str,
    retention_rules: Vec<RetentionRule>,
}

/// Client for the InfluxDB v2 HTTP API. Cheap to clone.
#[derive(Clone, Debug)]
pub struct InfluxClient {
    http: Client,
    base_url: String,
    token: Option<String>,
    org: String,
    bucket: String,
}

impl InfluxClient {
    pub fn new(config: InfluxConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Client {
                url: config.url.clone(),
                error: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token,
            org: config.org,
            bucket: config.bucket,
        })
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Token {token}")),
            None => builder,
        }
    }

    /// Writes the points to the configured org and bucket with nanosecond precision.
    pub async fn write(&self, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = line_protocol::encode(points)?;

        let response = self
            .request(reqwest::Method::POST, "/api/v2/write")
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        check_status(response).await?;

        debug!(points = points.len(), "Wrote points to InfluxDB");
        Ok(())
    }

    /// `true` when the server answers `/ping` with 204.
    pub async fn ping(&self) -> Result<bool> {
        let response = self
            .request(reqwest::Method::GET, "/ping")
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(response.status() == StatusCode::NO_CONTENT)
    }

    pub async fn find_organization(&self, name: &str) -> Result<Option<Organization>> {
        let response = self
            .request(reqwest::Method::GET, "/api/v2/orgs")
            .query(&[("org", name)])
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        // filtering by name answers 404 when nothing matches
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let orgs: Organizations = decode(check_status(response).await?).await?;
        Ok(orgs.orgs.into_iter().find(|org| org.name == name))
    }

    pub async fn create_organization(&self, name: &str) -> Result<Organization> {
        let response = self
            .request(reqwest::Method::POST, "/api/v2/orgs")
            .json(&CreateOrganization { name })
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        decode(check_status(response).await?).await
    }

    pub async fn find_bucket(&self, org_id: &str, name: &str) -> Result<Option<Bucket>> {
        let response = self
            .request(reqwest::Method::GET, "/api/v2/buckets")
            .query(&[("orgID", org_id), ("name", name)])
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let buckets: Buckets = decode(check_status(response).await?).await?;
        Ok(buckets
            .buckets
            .into_iter()
            .find(|bucket| bucket.name == name && bucket.org_id == org_id))
    }

    /// Creates a bucket. A `retention_seconds` of 0 keeps data forever.
    pub async fn create_bucket(
        &self,
        org_id: &str,
        name: &str,
        retention_seconds: u64,
    ) -> Result<Bucket> {
        let request = CreateBucket {
            org_id,
            name,
            retention_rules: vec![RetentionRule {
                kind: "expire",
                every_seconds: retention_seconds,
            }],
        };
        let response = self
            .request(reqwest::Method::POST, "/api/v2/buckets")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        decode(check_status(response).await?).await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::CONFLICT {
        return Err(Error::Conflict(body));
    }
    Err(Error::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
}
