//! Analytics store for event metadata.
//!
//! Rows go to the ClickHouse `events` table through the HTTP interface, one
//! `JSONEachRow` line per insert. The table is append-only from this service:
//! there is no update or delete path. Reads for the query API use server-side
//! query parameters (`{name:Type}`) so request values are never spliced into SQL.

use crate::config::AnalyticsConfig;
use crate::error::StoreError;
use crate::event::{EventRecord, STORE_TIMESTAMP_FORMAT};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, instrument};

const COLUMNS: &str = "eventId, cameraID, timestamp, confidence, image_path, payload";

/// Append-only sink for event records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append one record
    async fn insert(&self, record: &EventRecord) -> Result<(), StoreError>;
}

/// Filters for reading events back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub camera_id: Option<String>,
    pub event_id: Option<String>,
    /// Start time (inclusive)
    pub start_time: Option<DateTime<Utc>>,
    /// End time (exclusive)
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// ClickHouse-backed event store
pub struct ClickHouseEventStore {
    client: reqwest::Client,
    url: String,
    username: String,
    password: Option<String>,
    table: String,
}

impl ClickHouseEventStore {
    pub fn new(config: &AnalyticsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build analytics HTTP client")?;

        info!(
            url = %config.url,
            table = %format!("{}.{}", config.database, config.table),
            "Analytics store client initialized"
        );

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            table: format!("{}.{}", config.database, config.table),
        })
    }

    /// Check the server answers queries
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.execute("SELECT 1", &[], None).await.map(|_| ())
    }

    /// Events matching `query`, newest first
    #[instrument(skip(self))]
    pub async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StoreError> {
        let (sql, params) = build_select(&self.table, query);
        let body = self.execute(&sql, &params, None).await?;
        parse_rows(&body)
    }

    /// Number of events matching the filters of `query`, ignoring paging
    #[instrument(skip(self))]
    pub async fn count_events(&self, query: &EventQuery) -> Result<u64, StoreError> {
        let (sql, params) = build_count(&self.table, query);
        let body = self.execute(&sql, &params, None).await?;

        #[derive(Deserialize)]
        struct CountRow {
            total: u64,
        }

        let row = parse_rows::<CountRow>(&body)?.into_iter().next();
        Ok(row.map(|r| r.total).unwrap_or(0))
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[(String, String)],
        body: Option<String>,
    ) -> Result<String, StoreError> {
        let mut request = self
            .client
            .post(&self.url)
            .query(&[
                ("query", sql),
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .query(params)
            .basic_auth(&self.username, self.password.as_deref());

        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body: text.trim().to_string(),
            });
        }

        Ok(text)
    }
}

#[async_trait]
impl EventSink for ClickHouseEventStore {
    #[instrument(skip(self, record), fields(camera_id = %record.camera_id, timestamp = %record.timestamp))]
    async fn insert(&self, record: &EventRecord) -> Result<(), StoreError> {
        let sql = format!("INSERT INTO {} ({COLUMNS}) FORMAT JSONEachRow", self.table);
        self.execute(&sql, &[], Some(insert_body(record)?)).await?;

        debug!(image_path = %record.image_path, "Event record inserted");
        Ok(())
    }
}

/// One `JSONEachRow` line
fn insert_body(record: &EventRecord) -> Result<String, StoreError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

fn build_filters(query: &EventQuery) -> (String, Vec<(String, String)>) {
    let mut clause = String::from(" WHERE 1 = 1");
    let mut params = Vec::new();

    if let Some(ref camera_id) = query.camera_id {
        clause.push_str(" AND cameraID = {camera_id:String}");
        params.push(("param_camera_id".to_string(), camera_id.clone()));
    }

    if let Some(ref event_id) = query.event_id {
        clause.push_str(" AND eventId = {event_id:String}");
        params.push(("param_event_id".to_string(), event_id.clone()));
    }

    if let Some(start_time) = query.start_time {
        clause.push_str(" AND timestamp >= {start_time:DateTime('UTC')}");
        params.push((
            "param_start_time".to_string(),
            start_time.format(STORE_TIMESTAMP_FORMAT).to_string(),
        ));
    }

    if let Some(end_time) = query.end_time {
        clause.push_str(" AND timestamp < {end_time:DateTime('UTC')}");
        params.push((
            "param_end_time".to_string(),
            end_time.format(STORE_TIMESTAMP_FORMAT).to_string(),
        ));
    }

    (clause, params)
}

fn build_select(table: &str, query: &EventQuery) -> (String, Vec<(String, String)>) {
    let (filters, params) = build_filters(query);
    let mut sql = format!("SELECT {COLUMNS} FROM {table}{filters} ORDER BY timestamp DESC");

    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
    }

    sql.push_str(" FORMAT JSONEachRow");
    (sql, params)
}

fn build_count(table: &str, query: &EventQuery) -> (String, Vec<(String, String)>) {
    let (filters, params) = build_filters(query);
    (
        format!("SELECT count() AS total FROM {table}{filters} FORMAT JSONEachRow"),
        params,
    )
}

fn parse_rows<T: serde::de::DeserializeOwned>(body: &str) -> Result<Vec<T>, StoreError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(StoreError::from))
        .collect()
}
