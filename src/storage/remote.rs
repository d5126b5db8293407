//! REST object-store backend.
//!
//! Speaks the Supabase storage wire shape: prefix listings are POSTed to
//! `/object/list/{bucket}` and return entries whose `metadata` is null for
//! sub-prefixes and populated for real objects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{BlobStore, ListEntry};

pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    bucket: String,
}

#[derive(Serialize)]
struct ListRequest<'a> {
    prefix: &'a str,
    limit: u32,
}

#[derive(Deserialize)]
struct ListItem {
    name: String,
    metadata: Option<ObjectMetadata>,
}

#[derive(Deserialize)]
struct ObjectMetadata {
    size: Option<u64>,
}

#[derive(Serialize)]
struct RemoveRequest<'a> {
    prefixes: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    expires_in: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl RemoteStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            bucket: bucket.into(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, key)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(Error::StorageIo(format!("{what} failed: {status} {body}")))
        }
    }
}

fn io_err(what: &str, err: reqwest::Error) -> Error {
    Error::StorageIo(format!("{what}: {err}"))
}

#[async_trait]
impl BlobStore for RemoteStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ListEntry>> {
        let url = format!("{}/storage/v1/object/list/{}", self.base_url, self.bucket);
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&ListRequest { prefix, limit: 10_000 })
            .send()
            .await
            .map_err(|e| io_err("list", e))?;
        let items: Vec<ListItem> = Self::check(resp, "list")
            .await?
            .json()
            .await
            .map_err(|e| io_err("list decode", e))?;

        Ok(items
            .into_iter()
            .map(|item| ListEntry {
                is_leaf: item.metadata.is_some(),
                size: item.metadata.and_then(|m| m.size),
                name: item.name,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .request(reqwest::Method::GET, self.object_url(key))
            .send()
            .await
            .map_err(|e| io_err("get", e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("blob {key}")));
        }
        let bytes = Self::check(resp, "get")
            .await?
            .bytes()
            .await
            .map_err(|e| io_err("get body", e))?;
        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, bytes: &[u8], upsert: bool) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, self.object_url(key))
            .header("x-upsert", if upsert { "true" } else { "false" })
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| io_err("put", e))?;
        Self::check(resp, "put").await?;
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let url = format!("{}/storage/v1/object/{}", self.base_url, self.bucket);
        let resp = self
            .request(reqwest::Method::DELETE, url)
            .json(&RemoveRequest { prefixes: keys })
            .send()
            .await
            .map_err(|e| io_err("remove", e))?;
        Self::check(resp, "remove").await?;
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl_secs: u64) -> Result<String> {
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base_url, self.bucket, key
        );
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(&SignRequest { expires_in: ttl_secs })
            .send()
            .await
            .map_err(|e| io_err("sign", e))?;
        let signed: SignResponse = Self::check(resp, "sign")
            .await?
            .json()
            .await
            .map_err(|e| io_err("sign decode", e))?;
        Ok(format!("{}/storage/v1{}", self.base_url, signed.signed_url))
    }
}
