//! HTTP plumbing and table sinks (Google Sheets, CSV backup, in-memory) for seodaily.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use seodaily_core::{CellValue, Table};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "seodaily-storage";

pub const DEFAULT_SHEETS_ENDPOINT: &str = "https://sheets.googleapis.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// OAuth bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Blank input yields `None`.
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Read a token from a file; a missing or blank file yields `None`.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading access token file {}", path.display()))?;
        Ok(Self::new(raw))
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("undecodable response from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("invalid endpoint {endpoint}")]
    InvalidEndpoint { endpoint: String },
}

impl FetchError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 401 | 403, .. })
    }
}

/// Build `{endpoint}/{segments...}`; each segment is percent-encoded as a single path segment.
pub fn api_url(endpoint: &str, segments: &[&str]) -> Result<Url, FetchError> {
    let invalid = || FetchError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
    };
    let mut url = Url::parse(endpoint).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Truncate to `max_chars` characters, marking the cut with an ellipsis.
pub fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// JSON-over-HTTP client with bounded timeout and capped exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(
        &self,
        url: Url,
        token: Option<&AccessToken>,
    ) -> Result<JsonValue, FetchError> {
        self.send_json(Method::GET, url, token, None).await
    }

    pub async fn post_json(
        &self,
        url: Url,
        token: Option<&AccessToken>,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        self.send_json(Method::POST, url, token, Some(body)).await
    }

    pub async fn put_json(
        &self,
        url: Url,
        token: Option<&AccessToken>,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        self.send_json(Method::PUT, url, token, Some(body)).await
    }

    /// Send a request and decode the JSON response, retrying transient failures.
    /// An empty success body decodes to `null`.
    pub async fn send_json(
        &self,
        method: Method,
        url: Url,
        token: Option<&AccessToken>,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.request(method.clone(), url.clone());
            if let Some(token) = token {
                request = request.bearer_auth(token.secret());
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            debug!(%method, %url, attempt, "http request");

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();

                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        if bytes.is_empty() {
                            return Ok(JsonValue::Null);
                        }
                        return serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode {
                            url: url.to_string(),
                            reason: err.to_string(),
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        warn!(%url, status = status.as_u16(), attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body: clip(&body, 300),
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        warn!(%url, attempt, error = %err, "retryable transport error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::HttpStatus {
                status: 0,
                url: url.to_string(),
                body: "retries exhausted".to_string(),
            }),
        }
    }

    /// Single-attempt `application/x-www-form-urlencoded` POST; the body is ignored.
    pub async fn post_form(&self, url: Url, form: &[(&str, &str)]) -> Result<(), FetchError> {
        let resp = self.client.post(url.clone()).form(form).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body: clip(&body, 300),
        })
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("reading table {table}: {reason}")]
    Read { table: String, reason: String },
    #[error("creating table {table}: {reason}")]
    Create { table: String, reason: String },
    #[error("writing table {table} failed: {reason}")]
    WriteFailure { table: String, reason: String },
}

/// Destination store for merged tables.
#[async_trait]
pub trait Sink: Send + Sync {
    fn sink_id(&self) -> &'static str;

    async fn read_table(&self, name: &str) -> Result<Option<Table>, SinkError>;

    async fn create_table(&self, name: &str, schema: &[String]) -> Result<(), SinkError>;

    /// Replace the whole named table with `table`.
    async fn write_table(&self, name: &str, table: &Table) -> Result<(), SinkError>;
}

pub fn cell_to_json(cell: &CellValue) -> JsonValue {
    match cell {
        CellValue::Empty => JsonValue::String(String::new()),
        CellValue::Text(text) => JsonValue::String(text.clone()),
        CellValue::Integer(value) => json!(value),
        CellValue::Number(value) if value.is_finite() => json!(value),
        CellValue::Number(value) => JsonValue::String(value.to_string()),
        CellValue::Date(_) => JsonValue::String(cell.to_string()),
    }
}

pub fn cell_from_json(value: &JsonValue) -> CellValue {
    match value {
        JsonValue::Null => CellValue::Empty,
        JsonValue::String(text) if text.is_empty() => CellValue::Empty,
        JsonValue::String(text) => CellValue::Text(text.clone()),
        JsonValue::Number(number) => match number.as_i64() {
            Some(int) => CellValue::Integer(int),
            None => number
                .as_f64()
                .map(CellValue::Number)
                .unwrap_or_else(|| CellValue::Text(number.to_string())),
        },
        JsonValue::Bool(flag) => CellValue::Text(if *flag { "TRUE" } else { "FALSE" }.to_string()),
        other => CellValue::Text(other.to_string()),
    }
}

/// A1 reference to a whole sheet; quotes inside the title are doubled.
pub fn sheet_range(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

/// Google Sheets spreadsheet where each table is one sheet (tab).
#[derive(Debug, Clone)]
pub struct SheetsSink {
    http: HttpClient,
    endpoint: String,
    spreadsheet_id: String,
    token: AccessToken,
}

impl SheetsSink {
    pub fn new(
        http: HttpClient,
        endpoint: impl Into<String>,
        spreadsheet_id: impl Into<String>,
        token: AccessToken,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            spreadsheet_id: spreadsheet_id.into(),
            token,
        }
    }

    fn spreadsheet_url(&self, suffix: &str) -> Result<Url, FetchError> {
        let segment = format!("{}{suffix}", self.spreadsheet_id);
        api_url(&self.endpoint, &["v4", "spreadsheets", &segment])
    }

    fn values_url(&self, range: &str) -> Result<Url, FetchError> {
        api_url(
            &self.endpoint,
            &["v4", "spreadsheets", &self.spreadsheet_id, "values", range],
        )
    }

    async fn sheet_titles(&self) -> Result<Vec<String>, FetchError> {
        let mut url = self.spreadsheet_url("")?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties.title");
        let meta = self.http.get_json(url, Some(&self.token)).await?;
        Ok(meta
            .get("sheets")
            .and_then(JsonValue::as_array)
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| s.pointer("/properties/title").and_then(JsonValue::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put_grid(&self, name: &str, grid: Vec<Vec<CellValue>>) -> Result<(), FetchError> {
        let range = format!("{}!A1", sheet_range(name));
        let mut url = self.values_url(&range)?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        let values: Vec<Vec<JsonValue>> = grid
            .iter()
            .map(|row| row.iter().map(cell_to_json).collect())
            .collect();
        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": values,
        });
        self.http.put_json(url, Some(&self.token), &body).await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for SheetsSink {
    fn sink_id(&self) -> &'static str {
        "google-sheets"
    }

    async fn read_table(&self, name: &str) -> Result<Option<Table>, SinkError> {
        let read_err = |err: FetchError| SinkError::Read {
            table: name.to_string(),
            reason: err.to_string(),
        };

        let titles = self.sheet_titles().await.map_err(read_err)?;
        if !titles.iter().any(|t| t == name) {
            debug!(table = name, "sheet not present");
            return Ok(None);
        }

        let mut url = self.values_url(&sheet_range(name)).map_err(read_err)?;
        url.query_pairs_mut()
            .append_pair("valueRenderOption", "UNFORMATTED_VALUE")
            .append_pair("majorDimension", "ROWS");
        let payload = self
            .http
            .get_json(url, Some(&self.token))
            .await
            .map_err(read_err)?;

        let grid: Vec<Vec<CellValue>> = payload
            .get("values")
            .and_then(JsonValue::as_array)
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        row.as_array()
                            .map(|cells| cells.iter().map(cell_from_json).collect())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(Table::from_grid(grid)))
    }

    async fn create_table(&self, name: &str, schema: &[String]) -> Result<(), SinkError> {
        let create_err = |err: FetchError| SinkError::Create {
            table: name.to_string(),
            reason: err.to_string(),
        };
        info!(table = name, "creating sheet");
        let url = self.spreadsheet_url(":batchUpdate").map_err(create_err)?;
        let body = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": name,
                        "gridProperties": { "rowCount": 100, "columnCount": 20 },
                    }
                }
            }]
        });
        self.http
            .post_json(url, Some(&self.token), &body)
            .await
            .map_err(create_err)?;
        self.put_grid(name, Table::with_headers(schema.to_vec()).to_grid())
            .await
            .map_err(create_err)
    }

    async fn write_table(&self, name: &str, table: &Table) -> Result<(), SinkError> {
        let write_err = |err: FetchError| SinkError::WriteFailure {
            table: name.to_string(),
            reason: err.to_string(),
        };
        let clear_url = self
            .values_url(&format!("{}:clear", sheet_range(name)))
            .map_err(write_err)?;
        self.http
            .post_json(clear_url, Some(&self.token), &json!({}))
            .await
            .map_err(write_err)?;
        self.put_grid(name, table.to_grid()).await.map_err(write_err)?;
        info!(table = name, rows = table.len(), "sheet updated");
        Ok(())
    }
}

/// Quote a CSV field when it contains a delimiter, quote or line break.
fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

pub fn encode_csv(grid: &[Vec<CellValue>]) -> String {
    let mut out = String::new();
    for row in grid {
        let line = row
            .iter()
            .map(|cell| csv_field(&cell.to_string()))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// RFC 4180 reader. Every cell comes back as text; blank cells become `Empty`.
pub fn decode_csv(text: &str) -> Vec<Vec<CellValue>> {
    let mut rows = Vec::new();
    let mut row: Vec<CellValue> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    let finish_field = |field: &mut String, row: &mut Vec<CellValue>| {
        let value = std::mem::take(field);
        row.push(if value.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(value)
        });
    };

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => finish_field(&mut field, &mut row),
            '\r' => {}
            '\n' => {
                finish_field(&mut field, &mut row);
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(ch),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        finish_field(&mut field, &mut row);
        rows.push(row);
    }
    rows
}

/// Local CSV files, one per table, used when the spreadsheet is not reachable.
#[derive(Debug, Clone)]
pub struct CsvBackupSink {
    root: PathBuf,
}

impl CsvBackupSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("pipeline_backup_{safe}.csv"))
    }

    /// Write through a temp file in the same directory, then rename over the target.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating backup directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for CsvBackupSink {
    fn sink_id(&self) -> &'static str {
        "csv-backup"
    }

    async fn read_table(&self, name: &str) -> Result<Option<Table>, SinkError> {
        let path = self.table_path(name);
        let exists = fs::try_exists(&path).await.map_err(|err| SinkError::Read {
            table: name.to_string(),
            reason: format!("checking {}: {err}", path.display()),
        })?;
        if !exists {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .map_err(|err| SinkError::Read {
                table: name.to_string(),
                reason: format!("reading {}: {err}", path.display()),
            })?;
        Ok(Some(Table::from_grid(decode_csv(&text))))
    }

    async fn create_table(&self, name: &str, schema: &[String]) -> Result<(), SinkError> {
        let path = self.table_path(name);
        let header = encode_csv(&Table::with_headers(schema.to_vec()).to_grid());
        self.write_atomic(&path, header.as_bytes())
            .await
            .map_err(|err| SinkError::Create {
                table: name.to_string(),
                reason: format!("{err:#}"),
            })
    }

    async fn write_table(&self, name: &str, table: &Table) -> Result<(), SinkError> {
        let path = self.table_path(name);
        let body = encode_csv(&table.to_grid());
        self.write_atomic(&path, body.as_bytes())
            .await
            .map_err(|err| SinkError::WriteFailure {
                table: name.to_string(),
                reason: format!("{err:#}"),
            })?;
        info!(table = name, rows = table.len(), path = %path.display(), "csv backup written");
        Ok(())
    }
}

/// In-process tables; optionally rejects every write.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<BTreeMap<String, Table>>,
    reject_writes: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, table: Table) -> Self {
        self.tables.get_mut().insert(name.into(), table);
        self
    }

    pub fn rejecting_writes(mut self) -> Self {
        self.reject_writes = true;
        self
    }

    pub async fn table(&self, name: &str) -> Option<Table> {
        self.tables.lock().await.get(name).cloned()
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.tables.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn sink_id(&self) -> &'static str {
        "memory"
    }

    async fn read_table(&self, name: &str) -> Result<Option<Table>, SinkError> {
        Ok(self.table(name).await)
    }

    async fn create_table(&self, name: &str, schema: &[String]) -> Result<(), SinkError> {
        if self.reject_writes {
            return Err(SinkError::Create {
                table: name.to_string(),
                reason: "sink is read-only".to_string(),
            });
        }
        self.tables
            .lock()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Table::with_headers(schema.to_vec()));
        Ok(())
    }

    async fn write_table(&self, name: &str, table: &Table) -> Result<(), SinkError> {
        if self.reject_writes {
            return Err(SinkError::WriteFailure {
                table: name.to_string(),
                reason: "sink is read-only".to_string(),
            });
        }
        self.tables
            .lock()
            .await
            .insert(name.to_string(), table.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;
    use tiny_http::{Response, Server};

    #[derive(Debug)]
    struct Recorded {
        method: String,
        url: String,
        body: String,
        authorization: Option<String>,
    }

    /// Answer one request per canned `(status, body)` pair, in order.
    fn serve(responses: Vec<(u16, String)>) -> (String, thread::JoinHandle<Vec<Recorded>>) {
        let server = Server::http("127.0.0.1:0").expect("bind test server");
        let addr = server.server_addr().to_ip().expect("ip listener");
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in responses {
                let Ok(Some(mut request)) = server.recv_timeout(Duration::from_secs(5)) else {
                    break;
                };
                let mut text = String::new();
                let _ = request.as_reader().read_to_string(&mut text);
                let authorization = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.as_str().to_string());
                seen.push(Recorded {
                    method: request.method().to_string(),
                    url: request.url().to_string(),
                    body: text,
                    authorization,
                });
                let _ = request.respond(Response::from_string(body).with_status_code(status));
            }
            seen
        });
        (format!("http://{addr}"), handle)
    }

    fn fast_client() -> HttpClient {
        HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("seodaily-test".into()),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        })
        .expect("client")
    }

    fn token() -> AccessToken {
        AccessToken::new("test-token").expect("token")
    }

    fn sample_table() -> Table {
        Table {
            headers: vec!["date".into(), "url".into(), "clicks".into()],
            rows: vec![
                vec!["2024-05-01".into(), "/a".into(), CellValue::Integer(10)],
                vec!["2024-05-01".into(), "/b, \"quoted\"".into(), CellValue::Empty],
            ],
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn access_tokens_are_trimmed_and_redacted() {
        assert!(AccessToken::new("   ").is_none());
        let token = AccessToken::new(" abc \n").unwrap();
        assert_eq!(token.secret(), "abc");
        assert_eq!(format!("{token:?}"), "AccessToken(<redacted>)");
    }

    #[test]
    fn api_urls_encode_each_segment() {
        let url = api_url(
            "https://example.test/",
            &["webmasters", "v3", "sites", "https://site.test/", "query"],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/webmasters/v3/sites/https:%2F%2Fsite.test%2F/query"
        );
        assert!(api_url("not a url", &["x"]).is_err());
    }

    #[test]
    fn json_cells_keep_native_types() {
        assert_eq!(cell_from_json(&json!(10)), CellValue::Integer(10));
        assert_eq!(cell_from_json(&json!(0.25)), CellValue::Number(0.25));
        assert_eq!(cell_from_json(&json!("")), CellValue::Empty);
        assert_eq!(cell_from_json(&json!("/a")), CellValue::Text("/a".into()));
        assert_eq!(cell_to_json(&CellValue::Number(8.4)), json!(8.4));
        assert_eq!(cell_to_json(&CellValue::Empty), json!(""));
        let date = sample_date_cell();
        assert_eq!(cell_to_json(&date), json!("2024-05-01"));
    }

    fn sample_date_cell() -> CellValue {
        CellValue::Date(seodaily_core::parse_target_date("2024-05-01").unwrap())
    }

    #[test]
    fn csv_quotes_only_when_needed_and_reads_back() {
        let grid = sample_table().to_grid();
        let text = encode_csv(&grid);
        assert_eq!(
            text,
            "date,url,clicks\n2024-05-01,/a,10\n2024-05-01,\"/b, \"\"quoted\"\"\",\n"
        );
        let back = Table::from_grid(decode_csv(&text));
        assert_eq!(back.headers, sample_table().headers);
        assert_eq!(back.rows[1][1], CellValue::Text("/b, \"quoted\"".into()));
        assert_eq!(back.rows[1][2], CellValue::Empty);
        assert_eq!(back.rows[0][2], CellValue::Text("10".into()));
    }

    #[test]
    fn csv_reader_handles_crlf_and_embedded_newlines() {
        let rows = decode_csv("a,b\r\n\"line\nbreak\",2");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], CellValue::Text("line\nbreak".into()));
        assert_eq!(rows[1][1], CellValue::Text("2".into()));
    }

    #[tokio::test]
    async fn csv_sink_creates_and_replaces_tables() {
        let dir = tempdir().expect("tempdir");
        let sink = CsvBackupSink::new(dir.path().join("backups"));

        assert!(sink.read_table("gsc_data_daily").await.unwrap().is_none());
        sink.create_table("gsc_data_daily", &sample_table().headers)
            .await
            .unwrap();
        let created = sink.read_table("gsc_data_daily").await.unwrap().unwrap();
        assert_eq!(created, Table::with_headers(sample_table().headers));

        sink.write_table("gsc_data_daily", &sample_table()).await.unwrap();
        let stored = sink.read_table("gsc_data_daily").await.unwrap().unwrap();
        assert_eq!(stored.len(), 2);
        assert!(sink.table_path("gsc_data_daily").ends_with("pipeline_backup_gsc_data_daily.csv"));

        let leftovers: Vec<_> = std::fs::read_dir(sink.root())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn memory_sink_can_reject_writes() {
        let sink = MemorySink::new().rejecting_writes();
        let err = sink.write_table("t", &sample_table()).await.unwrap_err();
        assert!(matches!(err, SinkError::WriteFailure { .. }));
        assert!(sink.table("t").await.is_none());

        let sink = MemorySink::new().with_table("t", sample_table());
        assert_eq!(sink.read_table("t").await.unwrap(), Some(sample_table()));
    }

    #[tokio::test]
    async fn retryable_status_is_retried_until_success() {
        let (endpoint, handle) = serve(vec![
            (503, "busy".into()),
            (200, r#"{"ok":true}"#.into()),
        ]);
        let value = fast_client()
            .get_json(api_url(&endpoint, &["ping"]).unwrap(), Some(&token()))
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
        let seen = handle.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].authorization.as_deref(), Some("Bearer test-token"));
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let (endpoint, handle) = serve(vec![(401, "nope".into())]);
        let err = fast_client()
            .get_json(api_url(&endpoint, &["ping"]).unwrap(), None)
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(handle.join().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sheets_sink_reports_missing_sheet_as_absent() {
        let (endpoint, handle) = serve(vec![(
            200,
            r#"{"sheets":[{"properties":{"title":"other"}}]}"#.into(),
        )]);
        let sink = SheetsSink::new(fast_client(), endpoint, "sheet123", token());
        assert!(sink.read_table("gsc_data_daily").await.unwrap().is_none());
        let seen = handle.join().unwrap();
        assert_eq!(seen[0].method, "GET");
        assert!(seen[0].url.starts_with("/v4/spreadsheets/sheet123?fields="));
    }

    #[tokio::test]
    async fn sheets_sink_reads_unformatted_values() {
        let (endpoint, handle) = serve(vec![
            (200, r#"{"sheets":[{"properties":{"title":"gsc_data_daily"}}]}"#.into()),
            (
                200,
                r#"{"values":[["date","url","clicks"],["2024-05-01","/a",10],["2024-05-01","/b"]]}"#
                    .into(),
            ),
        ]);
        let sink = SheetsSink::new(fast_client(), endpoint, "sheet123", token());
        let table = sink.read_table("gsc_data_daily").await.unwrap().unwrap();
        assert_eq!(table.headers, vec!["date", "url", "clicks"]);
        assert_eq!(table.value(0, "clicks"), Some(&CellValue::Integer(10)));
        assert_eq!(table.value(1, "clicks"), Some(&CellValue::Empty));
        let seen = handle.join().unwrap();
        assert!(seen[1]
            .url
            .starts_with("/v4/spreadsheets/sheet123/values/'gsc_data_daily'?valueRenderOption=UNFORMATTED_VALUE"));
    }

    #[tokio::test]
    async fn sheets_sink_clears_then_writes_raw_values() {
        let (endpoint, handle) = serve(vec![(200, "{}".into()), (200, "{}".into())]);
        let sink = SheetsSink::new(fast_client(), endpoint, "sheet123", token());
        sink.write_table("gsc_data_daily", &sample_table()).await.unwrap();

        let seen = handle.join().unwrap();
        assert_eq!(seen[0].method, "POST");
        assert_eq!(seen[0].url, "/v4/spreadsheets/sheet123/values/'gsc_data_daily':clear");
        assert_eq!(seen[1].method, "PUT");
        assert_eq!(
            seen[1].url,
            "/v4/spreadsheets/sheet123/values/'gsc_data_daily'!A1?valueInputOption=RAW"
        );
        let body: JsonValue = serde_json::from_str(&seen[1].body).unwrap();
        assert_eq!(body["values"][0], json!(["date", "url", "clicks"]));
        assert_eq!(body["values"][1], json!(["2024-05-01", "/a", 10]));
        assert_eq!(body["values"][2][2], json!(""));
    }

    #[tokio::test]
    async fn sheets_sink_creates_sheet_with_header_row() {
        let (endpoint, handle) = serve(vec![(200, "{}".into()), (200, "{}".into())]);
        let sink = SheetsSink::new(fast_client(), endpoint, "sheet123", token());
        sink.create_table("ga4_data_daily", &["date".to_string(), "url".to_string()])
            .await
            .unwrap();

        let seen = handle.join().unwrap();
        assert_eq!(seen[0].url, "/v4/spreadsheets/sheet123:batchUpdate");
        let body: JsonValue = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(
            body.pointer("/requests/0/addSheet/properties/title"),
            Some(&json!("ga4_data_daily"))
        );
        let header: JsonValue = serde_json::from_str(&seen[1].body).unwrap();
        assert_eq!(header["values"], json!([["date", "url"]]));
    }

    #[tokio::test]
    async fn sheets_write_failure_surfaces_as_sink_error() {
        let (endpoint, handle) = serve(vec![(403, "forbidden".into())]);
        let sink = SheetsSink::new(fast_client(), endpoint, "sheet123", token());
        let err = sink.write_table("gsc_data_daily", &sample_table()).await.unwrap_err();
        assert!(matches!(err, SinkError::WriteFailure { .. }));
        handle.join().unwrap();
    }
}
