// Apache Druid adapter using the SQL HTTP API
// Druid is a real-time analytics database optimized for OLAP queries
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use url::Url;

use crate::error::ExecutionError;
use crate::models::{group_columns, ColumnSchema, RowSet, TableSchema};
use crate::services::database::adapter::SourceAdapter;
use crate::services::database::Engine;

pub struct DruidAdapter {
    source_id: String,
    base_url: String,
    client: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DruidSqlRequest<'a> {
    query: &'a str,
    result_format: &'static str,
    header: bool,
    sql_types_header: bool,
    context: Value,
}

impl DruidAdapter {
    pub fn new(source_id: &str, connection_url: &str) -> Result<Self, ExecutionError> {
        let url = Url::parse(connection_url)
            .map_err(|e| ExecutionError::connection(format!("Invalid Druid URL: {}", e)))?;

        // Convert druid:// scheme to http:// for REST API
        let base_url = match url.scheme() {
            "druid" => format!(
                "http://{}:{}",
                url.host_str().unwrap_or("localhost"),
                url.port().unwrap_or(8888)
            ),
            "http" | "https" => format!(
                "{}://{}{}",
                url.scheme(),
                url.host_str().unwrap_or("localhost"),
                url.port().map(|p| format!(":{}", p)).unwrap_or_default()
            ),
            _ => {
                return Err(ExecutionError::connection(
                    "URL must use druid://, http://, or https:// scheme for Druid",
                ))
            }
        };

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ExecutionError::connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            source_id: source_id.to_string(),
            base_url,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl SourceAdapter for DruidAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn engine(&self) -> Engine {
        Engine::Druid
    }

    async fn connect(&self) -> Result<(), ExecutionError> {
        let response = self
            .client
            .get(format!("{}/status", self.base_url))
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(map_status(status, "status check failed"));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str, timeout: Duration) -> Result<RowSet, ExecutionError> {
        let query_id = uuid::Uuid::new_v4().to_string();
        let request = DruidSqlRequest {
            query: sql,
            result_format: "array",
            header: true,
            sql_types_header: true,
            context: json!({
                "sqlQueryId": query_id,
                "sqlTimeZone": "UTC",
                "timeout": timeout.as_millis() as u64,
            }),
        };

        let cancel = CancelOnDrop::new(
            self.client.clone(),
            format!("{}/druid/v2/sql/{}", self.base_url, query_id),
        );

        let response = self
            .client
            .post(format!("{}/druid/v2/sql", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            cancel.disarm();
            return Err(map_status(status, &body));
        }

        let payload: Vec<Vec<Value>> = response.json().await.map_err(map_reqwest_error)?;
        cancel.disarm();

        parse_array_result(payload)
    }

    async fn describe_schema(&self) -> Result<Vec<TableSchema>, ExecutionError> {
        let result = self
            .execute(
                r#"SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, DATA_TYPE, IS_NULLABLE
                   FROM INFORMATION_SCHEMA.COLUMNS
                   WHERE TABLE_SCHEMA = 'druid'
                   ORDER BY TABLE_NAME, ORDINAL_POSITION"#,
                Duration::from_secs(30),
            )
            .await?;

        let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
        Ok(group_columns(result.rows.iter().filter(|row| row.len() >= 5).map(|row| {
            (
                Some(text(&row[0])),
                text(&row[1]),
                text(&row[2]),
                text(&row[3]),
                row[4].as_str() == Some("YES"),
            )
        })))
    }
}

/// Split an `array` result with name and SQL type header rows.
fn parse_array_result(payload: Vec<Vec<Value>>) -> Result<RowSet, ExecutionError> {
    let mut rows = payload.into_iter();
    let (Some(names), Some(types)) = (rows.next(), rows.next()) else {
        return Ok(RowSet::default());
    };
    if names.len() != types.len() {
        return Err(ExecutionError::connection(
            "Malformed Druid response: header rows differ in length",
        ));
    }

    let columns = names
        .iter()
        .zip(types.iter())
        .map(|(name, ty)| {
            ColumnSchema::new(
                name.as_str().unwrap_or_default(),
                ty.as_str().unwrap_or("VARCHAR").to_ascii_lowercase(),
            )
        })
        .collect();

    Ok(RowSet {
        columns,
        rows: rows.collect(),
    })
}

/// Asks the broker to cancel the query if the execute future is dropped
/// before the response arrives.
struct CancelOnDrop {
    client: Client,
    url: Option<String>,
}

impl CancelOnDrop {
    fn new(client: Client, url: String) -> Self {
        Self {
            client,
            url: Some(url),
        }
    }

    fn disarm(mut self) {
        self.url = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(url) = self.url.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.client.clone();
        handle.spawn(async move {
            if let Err(e) = client.delete(&url).send().await {
                tracing::warn!("Failed to cancel Druid query {}: {}", url, e);
            }
        });
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ExecutionError {
    if err.is_timeout() {
        ExecutionError::resource(format!("Druid request timed out: {}", err))
    } else if err.is_decode() {
        ExecutionError::connection(format!("Failed to parse Druid response: {}", err))
    } else {
        ExecutionError::connection(format!("HTTP request failed: {}", err))
    }
}

fn map_status(status: StatusCode, body: &str) -> ExecutionError {
    let detail = format!("Druid SQL query failed ({}): {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExecutionError::auth(detail),
        StatusCode::BAD_REQUEST => ExecutionError::syntax(detail),
        // Query scheduler full; the query never started
        StatusCode::TOO_MANY_REQUESTS => ExecutionError::resource(detail).transient(),
        s if s.is_server_error() => ExecutionError::resource(detail),
        _ => ExecutionError::connection(detail),
    }
}
