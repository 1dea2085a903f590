//! Persistent pipeline progress markers (cursor and watermarks).

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};
use tokio::fs;
use tracing::{debug, warn};

use crate::atomic::write_atomic;

pub const CRAWL_CURSOR_KEY: &str = "crawl_last_page";
pub const HIGH_WATER_MARK_KEY: &str = "last_updated";
pub const SILVER_WATERMARK_KEY: &str = "silver_last_run";

/// Flat mapping of named progress markers. Unknown keys round-trip unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineState {
    entries: Map<String, Value>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(entries: Map<String, Value>) -> Self {
        Self { entries }
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn crawl_cursor(&self) -> Option<u32> {
        let value = self.entries.get(CRAWL_CURSOR_KEY)?;
        match value.as_u64().and_then(|v| u32::try_from(v).ok()) {
            Some(page) => Some(page),
            None => {
                warn!(key = CRAWL_CURSOR_KEY, %value, "ignoring malformed crawl cursor");
                None
            }
        }
    }

    pub fn set_crawl_cursor(&mut self, page: u32) {
        self.entries
            .insert(CRAWL_CURSOR_KEY.to_string(), Value::from(page));
    }

    pub fn high_water_mark(&self) -> Option<NaiveDate> {
        let value = self.entries.get(HIGH_WATER_MARK_KEY)?;
        match value
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        {
            Some(date) => Some(date),
            None => {
                warn!(key = HIGH_WATER_MARK_KEY, %value, "ignoring malformed high-water mark");
                None
            }
        }
    }

    pub fn set_high_water_mark(&mut self, date: NaiveDate) {
        self.entries.insert(
            HIGH_WATER_MARK_KEY.to_string(),
            Value::from(date.format("%Y-%m-%d").to_string()),
        );
    }

    /// Last committed transform run start, stored as float epoch seconds.
    pub fn silver_watermark(&self) -> Option<DateTime<Utc>> {
        let value = self.entries.get(SILVER_WATERMARK_KEY)?;
        let parsed = value
            .as_f64()
            .filter(|secs| secs.is_finite())
            .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0).round() as i64));
        if parsed.is_none() {
            warn!(key = SILVER_WATERMARK_KEY, %value, "ignoring malformed silver watermark");
        }
        parsed
    }

    pub fn set_silver_watermark(&mut self, at: DateTime<Utc>) {
        let secs = at.timestamp_millis() as f64 / 1000.0;
        self.entries
            .insert(SILVER_WATERMARK_KEY.to_string(), Value::from(secs));
    }
}

/// Single JSON document holding [`PipelineState`], replaced atomically on save.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state document. Missing, unreadable or malformed documents yield an empty state.
    pub async fn load(&self) -> PipelineState {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state document yet; starting fresh");
                return PipelineState::new();
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "state document unreadable; starting fresh");
                return PipelineState::new();
            }
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(entries)) => PipelineState::from_map(entries),
            Ok(other) => {
                warn!(
                    path = %self.path.display(),
                    kind = json_kind(&other),
                    "state document is not an object; starting fresh"
                );
                PipelineState::new()
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "state document is corrupt; starting fresh");
                PipelineState::new()
            }
        }
    }

    pub async fn save(&self, state: &PipelineState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&state.entries).context("serializing pipeline state")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("writing state document {}", self.path.display()))
    }

    async fn update(&self, apply: impl FnOnce(&mut PipelineState)) -> anyhow::Result<PipelineState> {
        let mut state = self.load().await;
        apply(&mut state);
        self.save(&state).await?;
        Ok(state)
    }

    pub async fn crawl_cursor(&self) -> Option<u32> {
        self.load().await.crawl_cursor()
    }

    pub async fn set_crawl_cursor(&self, page: u32) -> anyhow::Result<()> {
        self.update(|state| state.set_crawl_cursor(page)).await?;
        Ok(())
    }

    pub async fn high_water_mark(&self) -> Option<NaiveDate> {
        self.load().await.high_water_mark()
    }

    /// Move the high-water mark forward; an earlier date leaves it unchanged.
    pub async fn set_high_water_mark(&self, date: NaiveDate) -> anyhow::Result<()> {
        self.update(|state| {
            if state.high_water_mark().map_or(true, |current| date > current) {
                state.set_high_water_mark(date);
            }
        })
        .await?;
        Ok(())
    }

    pub async fn silver_watermark(&self) -> Option<DateTime<Utc>> {
        self.load().await.silver_watermark()
    }

    pub async fn set_silver_watermark(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.update(|state| state.set_silver_watermark(at)).await?;
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
