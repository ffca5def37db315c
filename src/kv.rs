//! Client for the platform key-value record store. Migration payloads and
//! the sandbox input live here; nothing else talks to the platform API.

use anyhow::{Context, Result, bail};

use crate::config::Config;

pub(crate) struct KvClient {
    http: reqwest::Client,
    base_url: String,
    store_id: String,
    token: Option<String>,
}

impl KvClient {
    /// Build a client when the orchestrator provided a store id; local runs
    /// have none and skip the platform entirely.
    pub(crate) fn from_config(config: &Config) -> Option<Self> {
        let store_id = config.kv_store_id.clone()?;
        Some(Self {
            http: reqwest::Client::new(),
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            store_id,
            token: config.api_token.clone(),
        })
    }

    fn record_url(&self, key: &str) -> String {
        format!(
            "{}/v2/key-value-stores/{}/records/{key}",
            self.base_url, self.store_id
        )
    }

    /// Fetch a record's raw bytes. `Ok(None)` when the record does not exist.
    pub(crate) async fn get_record(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut req = self.http.get(self.record_url(key));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("fetching record '{key}'"))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!("record '{key}' fetch failed: HTTP {}", resp.status());
        }
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("reading record '{key}' body"))?;
        Ok(Some(bytes.to_vec()))
    }

    /// Store a record, replacing any previous value.
    pub(crate) async fn put_record(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let mut req = self
            .http
            .put(self.record_url(key))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("uploading record '{key}'"))?;
        if !resp.status().is_success() {
            bail!("record '{key}' upload failed: HTTP {}", resp.status());
        }
        Ok(())
    }

    /// Fetch and deserialize a JSON record.
    pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>> {
        match self.get_record(key).await? {
            None => Ok(None),
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing record '{key}' as JSON"))?;
                Ok(Some(value))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
