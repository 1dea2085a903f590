//! Multi-source trial page download with hash-gated writes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use ctr_core::HashSidecar;
use ctr_storage::{sha256_hex, ContentStore, HttpFetcher};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// New or changed content; body and sidecar written.
    Written { source: String },
    /// Hash matched the previous sidecar; only the sidecar was refreshed.
    Unchanged { source: String },
    /// Every source was exhausted without usable content.
    Missing,
}

impl FetchOutcome {
    pub fn is_stored(&self) -> bool {
        !matches!(self, FetchOutcome::Missing)
    }
}

pub fn body_key(identifier: &str) -> String {
    format!("{identifier}.html")
}

pub fn sidecar_key(identifier: &str) -> String {
    format!("{identifier}.meta")
}

pub struct Fetcher {
    http: HttpFetcher,
    store: Arc<dyn ContentStore>,
    base_url: String,
    sources: Vec<String>,
    politeness: Duration,
}

impl Fetcher {
    pub fn new(
        http: HttpFetcher,
        store: Arc<dyn ContentStore>,
        base_url: impl Into<String>,
        sources: Vec<String>,
        politeness: Duration,
    ) -> Self {
        Self {
            http,
            store,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sources,
            politeness,
        }
    }

    pub fn trial_url(&self, identifier: &str, source: &str) -> String {
        format!("{}/trial/{identifier}/{source}", self.base_url)
    }

    /// `false` only when no source had usable content.
    pub async fn fetch(&self, identifier: &str) -> Result<bool> {
        Ok(self.fetch_outcome(identifier).await?.is_stored())
    }

    pub async fn fetch_outcome(&self, identifier: &str) -> Result<FetchOutcome> {
        if identifier.is_empty() || identifier.contains(['/', '\\']) || identifier.starts_with('.') {
            warn!(identifier, "refusing identifier that is not a plain key");
            return Ok(FetchOutcome::Missing);
        }

        for source in &self.sources {
            tokio::time::sleep(self.politeness).await;
            let url = self.trial_url(identifier, source);
            debug!(identifier, source = %source, %url, "trying source");

            let body = match self.http.get_text(&url).await {
                Ok(body) => body,
                Err(err) if err.is_not_found() => {
                    debug!(identifier, source = %source, "not found at source");
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("fetching {identifier} from {source}"));
                }
            };

            if body.trim().is_empty() {
                warn!(identifier, source = %source, "source returned an empty body");
                continue;
            }

            return self.persist(identifier, source, &url, &body).await;
        }

        warn!(identifier, "no source returned usable content");
        Ok(FetchOutcome::Missing)
    }

    async fn persist(&self, identifier: &str, source: &str, url: &str, body: &str) -> Result<FetchOutcome> {
        let hash = sha256_hex(body.as_bytes());
        let body_key = body_key(identifier);
        let sidecar_key = sidecar_key(identifier);

        let previous_hash = self.previous_sidecar(&sidecar_key).await.map(|s| s.hash);
        let unchanged = previous_hash.as_deref() == Some(hash.as_str())
            && self
                .store
                .exists(&body_key)
                .await
                .with_context(|| format!("checking {body_key}"))?;

        if !unchanged {
            self.store
                .write(&body_key, body)
                .await
                .with_context(|| format!("writing {body_key} to {}", self.store.describe()))?;
        }

        let sidecar = HashSidecar {
            hash,
            source_tag: source.to_string(),
            url: url.to_string(),
            fetched_at: Utc::now(),
        };
        self.store
            .write(&sidecar_key, &sidecar.to_meta_text())
            .await
            .with_context(|| format!("writing {sidecar_key} to {}", self.store.describe()))?;

        let source = source.to_string();
        if unchanged {
            info!(identifier, source = %source, "content unchanged; sidecar refreshed");
            Ok(FetchOutcome::Unchanged { source })
        } else {
            info!(identifier, source = %source, "stored trial page");
            Ok(FetchOutcome::Written { source })
        }
    }

    async fn previous_sidecar(&self, key: &str) -> Option<HashSidecar> {
        match self.store.read(key).await {
            Ok(text) => {
                let parsed = HashSidecar::parse_meta_text(&text);
                if parsed.is_none() {
                    warn!(key, "ignoring unparsable sidecar");
                }
                parsed
            }
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                warn!(key, error = %err, "ignoring unreadable sidecar");
                None
            }
        }
    }
}
