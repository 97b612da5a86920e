//! Pipeline orchestration: configuration, provider registry, run loop and notification.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use seodaily_adapters::{
    parse_url_prefixes, source_for_provider, AnalyticsConfig, RowSource, SearchConsoleConfig,
    SourceSettings, ANALYTICS_PROVIDER, DEFAULT_ANALYTICS_ENDPOINT,
    DEFAULT_SEARCH_CONSOLE_ENDPOINT, DEFAULT_ROW_LIMIT, SEARCH_CONSOLE_PROVIDER,
};
use seodaily_core::{merge, parse_utc_offset, Batch, BatchOrigin, DateResolver, DEFAULT_LOOKBACK_DAYS};
use seodaily_storage::{
    api_url, clip, AccessToken, CsvBackupSink, FetchError, HttpClient, HttpClientConfig, SheetsSink,
    Sink, DEFAULT_SHEETS_ENDPOINT,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "seodaily-sync";

pub const REGISTRY_FILE: &str = "providers.yaml";
pub const DEFAULT_TELEGRAM_ENDPOINT: &str = "https://api.telegram.org";
const NOTIFY_ERROR_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub provider_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub table: String,
}

fn enabled_by_default() -> bool {
    true
}

/// Ordered list of providers and the table each one owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRegistry {
    pub providers: Vec<ProviderEntry>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderEntry {
                    provider_id: SEARCH_CONSOLE_PROVIDER.to_string(),
                    display_name: "Search Console".to_string(),
                    enabled: true,
                    table: "gsc_data_daily".to_string(),
                },
                ProviderEntry {
                    provider_id: ANALYTICS_PROVIDER.to_string(),
                    display_name: "Analytics".to_string(),
                    enabled: true,
                    table: "ga4_data_daily".to_string(),
                },
            ],
        }
    }
}

impl ProviderRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing provider registry")?;
        registry.validate()?;
        Ok(registry)
    }

    /// Read `providers.yaml` from the workspace root, or use the built-in registry.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(REGISTRY_FILE);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            info!(path = %path.display(), "no provider registry file; using built-in providers");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Each enabled provider must own a distinct, non-blank table.
    pub fn validate(&self) -> Result<()> {
        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for entry in self.enabled() {
            let table = entry.table.trim();
            if table.is_empty() {
                bail!("provider {} has no destination table", entry.provider_id);
            }
            if let Some(other) = owners.insert(table, &entry.provider_id) {
                bail!(
                    "providers {other} and {} both write table {table}",
                    entry.provider_id
                );
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ProviderEntry> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

/// Where merged tables are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkChoice {
    /// Sheets when a token is configured, else the CSV backup.
    #[default]
    Auto,
    Sheets,
    Csv,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub endpoint: String,
    pub bot_token: AccessToken,
    pub chat_id: String,
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub spreadsheet_id: Option<String>,
    pub target_date: Option<String>,
    pub lookback_days: u32,
    pub utc_offset: FixedOffset,
    pub sources: SourceSettings,
    pub sheets_endpoint: String,
    pub sheets_token: Option<AccessToken>,
    pub telegram: Option<TelegramConfig>,
    pub backup_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        // Unusable numeric or offset settings degrade to defaults; the run still happens.
        let number = |key: &str, default: u32| -> u32 {
            match get(key) {
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    warn!(key, value = %raw, default, "not a non-negative integer; using the default");
                    default
                }),
                None => default,
            }
        };

        let utc_offset = match get("PIPELINE_UTC_OFFSET") {
            Some(raw) => parse_utc_offset(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "PIPELINE_UTC_OFFSET is not an offset like +02:00; using UTC");
                Utc.fix()
            }),
            None => Utc.fix(),
        };
        let lookback_days = number("PIPELINE_LOOKBACK_DAYS", DEFAULT_LOOKBACK_DAYS);

        let search_console = SearchConsoleConfig {
            endpoint: get("SEODAILY_GSC_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_SEARCH_CONSOLE_ENDPOINT.to_string()),
            site_url: get("GSC_SITE_URL"),
            row_limit: number("GSC_ROW_LIMIT", DEFAULT_ROW_LIMIT),
            token: resolve_token(&get, "GSC")?,
        };
        let analytics = AnalyticsConfig {
            endpoint: get("SEODAILY_GA4_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_ANALYTICS_ENDPOINT.to_string()),
            property_id: get("GA4_PROPERTY_ID"),
            row_limit: number("GA4_ROW_LIMIT", DEFAULT_ROW_LIMIT),
            base_url: get("GA4_BASE_URL"),
            url_prefixes: get("GA4_URL_PREFIX_FILTER")
                .map(|raw| parse_url_prefixes(&raw))
                .unwrap_or_default(),
            token: resolve_token(&get, "GA4")?,
        };

        let telegram = match (
            get("TELEGRAM_BOT_TOKEN").and_then(AccessToken::new),
            get("TELEGRAM_CHAT_ID"),
        ) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramConfig {
                endpoint: get("SEODAILY_TELEGRAM_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_TELEGRAM_ENDPOINT.to_string()),
                bot_token,
                chat_id,
            }),
            _ => None,
        };

        let workspace_root = get("SEODAILY_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            spreadsheet_id: get("SEO_MASTER_SPREADSHEET_ID"),
            target_date: get("PIPELINE_TARGET_DATE"),
            lookback_days,
            utc_offset,
            sources: SourceSettings {
                search_console,
                analytics,
            },
            sheets_endpoint: get("SEODAILY_SHEETS_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_SHEETS_ENDPOINT.to_string()),
            sheets_token: resolve_token(&get, "SHEETS")?,
            telegram,
            backup_dir: get("SEODAILY_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("backups")),
            workspace_root,
            http_timeout_secs: u64::from(number("SEODAILY_HTTP_TIMEOUT_SECS", 20)),
            user_agent: get("SEODAILY_USER_AGENT")
                .unwrap_or_else(|| format!("seodaily/{}", env!("CARGO_PKG_VERSION"))),
        })
    }

    /// A command-line date takes precedence over `PIPELINE_TARGET_DATE`.
    pub fn with_target_date(mut self, target_date: Option<String>) -> Self {
        if target_date.is_some() {
            self.target_date = target_date;
        }
        self
    }

    pub fn date_resolver(&self) -> DateResolver {
        DateResolver {
            lookback_days: self.lookback_days,
            utc_offset: self.utc_offset,
        }
    }

    pub fn resolve_target_date(&self) -> Result<NaiveDate> {
        Ok(self.date_resolver().resolve(self.target_date.as_deref())?)
    }

    pub fn http_client(&self) -> Result<HttpClient> {
        HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })
    }
}

/// `{P}_ACCESS_TOKEN`, then `{P}_ACCESS_TOKEN_FILE`, then the shared Google token (inline or file).
fn resolve_token(
    get: &impl Fn(&str) -> Option<String>,
    prefix: &str,
) -> Result<Option<AccessToken>> {
    for base in [format!("{prefix}_ACCESS_TOKEN"), "GOOGLE_OAUTH_ACCESS_TOKEN".to_string()] {
        if let Some(token) = get(base.as_str()).and_then(AccessToken::new) {
            return Ok(Some(token));
        }
        let file_key = format!("{base}_FILE");
        if let Some(path) = get(file_key.as_str()) {
            if let Some(token) =
                AccessToken::from_file(&path).with_context(|| format!("loading {file_key}"))?
            {
                return Ok(Some(token));
            }
        }
    }
    Ok(None)
}

pub fn build_sink(
    config: &PipelineConfig,
    choice: SinkChoice,
    http: &HttpClient,
) -> Result<Arc<dyn Sink>> {
    let sheets = |token: &AccessToken| -> Result<Arc<dyn Sink>> {
        let spreadsheet_id = config
            .spreadsheet_id
            .as_deref()
            .context("SEO_MASTER_SPREADSHEET_ID is required")?;
        Ok(Arc::new(SheetsSink::new(
            http.clone(),
            config.sheets_endpoint.clone(),
            spreadsheet_id,
            token.clone(),
        )))
    };
    let csv = || -> Arc<dyn Sink> { Arc::new(CsvBackupSink::new(config.backup_dir.clone())) };

    match choice {
        SinkChoice::Csv => Ok(csv()),
        SinkChoice::Sheets => {
            let token = config
                .sheets_token
                .as_ref()
                .context("sheets sink requested but no SHEETS_ACCESS_TOKEN is configured")?;
            sheets(token)
        }
        SinkChoice::Auto => {
            if config.spreadsheet_id.is_none() {
                bail!("SEO_MASTER_SPREADSHEET_ID is required");
            }
            match &config.sheets_token {
                Some(token) => sheets(token),
                None => {
                    warn!(
                        backup_dir = %config.backup_dir.display(),
                        "no sheets credentials; writing CSV backups instead"
                    );
                    Ok(csv())
                }
            }
        }
    }
}

/// A registry entry paired with the source that fills its table.
pub struct ProviderBinding {
    pub entry: ProviderEntry,
    pub source: Box<dyn RowSource>,
}

pub fn bind_providers(
    registry: &ProviderRegistry,
    settings: &SourceSettings,
    http: &HttpClient,
) -> Result<Vec<ProviderBinding>> {
    registry.validate()?;
    registry
        .enabled()
        .map(|entry| {
            let source = source_for_provider(&entry.provider_id, settings, http)
                .with_context(|| format!("no row source registered for {}", entry.provider_id))?;
            Ok(ProviderBinding {
                entry: entry.clone(),
                source,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    Written { created: bool, table_rows: usize },
    SkippedEmpty,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableOutcome {
    pub provider_id: String,
    pub table: String,
    pub origin: BatchOrigin,
    pub fetched_rows: usize,
    #[serde(flatten)]
    pub status: TableStatus,
}

impl TableOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, TableStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_date: NaiveDate,
    pub lookback_days: u32,
    pub sink: String,
    pub tables: Vec<TableOutcome>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !self.tables.iter().any(TableOutcome::is_failed)
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.is_failed())
            .map(|t| t.table.as_str())
            .collect()
    }

    pub fn first_error(&self) -> Option<&str> {
        self.tables.iter().find_map(|t| match &t.status {
            TableStatus::Failed { error } => Some(error.as_str()),
            _ => None,
        })
    }

    pub fn outcome(&self, provider_id: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|t| t.provider_id == provider_id)
    }
}

/// Plain-text run report for chat delivery.
pub fn build_summary_text(summary: &RunSummary) -> String {
    let status = if summary.is_success() { "SUCCESS" } else { "FAILED" };
    let mut lines = vec![
        format!("SEO daily sync: {status}"),
        format!(
            "Target date: {} (lookback {} days)",
            summary.target_date, summary.lookback_days
        ),
    ];
    for table in &summary.tables {
        let origin = match table.origin {
            BatchOrigin::Live => "live",
            BatchOrigin::Fallback => "sample",
        };
        let detail = match &table.status {
            TableStatus::Written { table_rows, .. } => format!(
                "{} rows ({origin}), table now {table_rows} rows",
                table.fetched_rows
            ),
            TableStatus::SkippedEmpty => "no rows, nothing written".to_string(),
            TableStatus::Failed { .. } => format!("{} rows ({origin}), write failed", table.fetched_rows),
        };
        lines.push(format!("{} -> {}: {detail}", table.provider_id, table.table));
    }
    lines.push(format!(
        "Finished: {}",
        summary.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(err) = summary.first_error() {
        lines.push(format!("Error: {}", clip(err, NOTIFY_ERROR_CHARS)));
    }
    if summary
        .outcome(ANALYTICS_PROVIDER)
        .is_some_and(|t| t.status == TableStatus::SkippedEmpty)
    {
        lines.push("Warning: analytics returned no data for the target date".to_string());
    }
    lines.join("\n")
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<()>;
}

/// Posts run summaries through the Telegram Bot API `sendMessage` method.
pub struct TelegramNotifier {
    http: HttpClient,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(http: HttpClient, config: TelegramConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        let bot = format!("bot{}", self.config.bot_token.secret());
        let url = api_url(&self.config.endpoint, &[bot.as_str(), "sendMessage"])
            .map_err(|_| anyhow!("invalid telegram endpoint {}", self.config.endpoint))?;
        // Errors carry the request URL, which embeds the bot token.
        self.http
            .post_form(
                url,
                &[
                    ("chat_id", self.config.chat_id.as_str()),
                    ("text", text),
                    ("disable_web_page_preview", "true"),
                ],
            )
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, .. } => {
                    anyhow!("telegram sendMessage returned http {status}")
                }
                FetchError::Request(err) => {
                    anyhow!("telegram sendMessage failed: {}", err.without_url())
                }
                _ => anyhow!("telegram sendMessage failed"),
            })
    }
}

pub struct SyncPipeline {
    resolver: DateResolver,
    target_date: Option<String>,
    providers: Vec<ProviderBinding>,
    sink: Arc<dyn Sink>,
    notifier: Option<Box<dyn Notifier>>,
}

impl SyncPipeline {
    pub fn new(resolver: DateResolver, providers: Vec<ProviderBinding>, sink: Arc<dyn Sink>) -> Self {
        Self {
            resolver,
            target_date: None,
            providers,
            sink,
            notifier: None,
        }
    }

    pub fn with_target_date(mut self, target_date: Option<String>) -> Self {
        self.target_date = target_date;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub async fn from_config(config: &PipelineConfig, sink_choice: SinkChoice) -> Result<Self> {
        let http = config.http_client()?;
        let registry = ProviderRegistry::load(&config.workspace_root).await?;
        let providers = bind_providers(&registry, &config.sources, &http)?;
        let sink = build_sink(config, sink_choice, &http)?;
        let mut pipeline = Self::new(config.date_resolver(), providers, sink)
            .with_target_date(config.target_date.clone());
        if let Some(telegram) = &config.telegram {
            pipeline = pipeline.with_notifier(Box::new(TelegramNotifier::new(http, telegram.clone())));
        }
        Ok(pipeline)
    }

    /// Resolve the date, then fetch, merge and write each provider's table in order.
    /// A failing table is recorded in the summary and does not stop the others.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        async {
            let started_at = Utc::now();
            let target_date = self
                .resolver
                .resolve(self.target_date.as_deref())
                .context("resolving target date")?;
            info!(
                %target_date,
                lookback_days = self.resolver.lookback_days,
                overridden = self.target_date.is_some(),
                sink = self.sink.sink_id(),
                providers = self.providers.len(),
                "sync run started"
            );

            let mut tables = Vec::with_capacity(self.providers.len());
            for binding in &self.providers {
                tables.push(self.sync_provider(binding, target_date).await);
            }

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                target_date,
                lookback_days: self.resolver.lookback_days,
                sink: self.sink.sink_id().to_string(),
                tables,
            };
            if summary.is_success() {
                info!(tables = summary.tables.len(), "sync run finished");
            } else {
                error!(failed = ?summary.failed_tables(), "sync run finished with failures");
            }

            if let Some(notifier) = &self.notifier {
                if let Err(err) = notifier.notify(&build_summary_text(&summary)).await {
                    warn!(error = %format!("{err:#}"), "run notification not delivered");
                }
            }
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    async fn sync_provider(&self, binding: &ProviderBinding, target_date: NaiveDate) -> TableOutcome {
        let provider_id = binding.entry.provider_id.clone();
        let table = binding.entry.table.clone();
        let batch = binding.source.fetch(target_date).await;
        let fetched_rows = batch.len();
        let origin = batch.origin;

        let status = if batch.is_empty() {
            info!(provider = %provider_id, %table, "no rows fetched; table left untouched");
            TableStatus::SkippedEmpty
        } else {
            match self.write_batch(&table, &binding.source.schema(), &batch).await {
                Ok((created, table_rows)) => {
                    info!(
                        provider = %provider_id,
                        %table,
                        ?origin,
                        fetched_rows,
                        table_rows,
                        created,
                        "table written"
                    );
                    TableStatus::Written { created, table_rows }
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    error!(provider = %provider_id, %table, error = %error, "table sync failed");
                    TableStatus::Failed { error }
                }
            }
        };

        TableOutcome {
            provider_id,
            table,
            origin,
            fetched_rows,
            status,
        }
    }

    /// Read, merge fully in memory, then issue a single write.
    async fn write_batch(&self, table: &str, schema: &[String], batch: &Batch) -> Result<(bool, usize)> {
        let existing = self.sink.read_table(table).await?;
        let created = existing.is_none();
        let merged = merge(existing, &batch.records, schema)
            .with_context(|| format!("merging {} rows into {table}", batch.len()))?;
        if created {
            self.sink.create_table(table, schema).await?;
        }
        self.sink.write_table(table, &merged).await?;
        Ok((created, merged.len()))
    }
}

pub async fn run_sync_once_from_env(
    target_date: Option<String>,
    sink_choice: SinkChoice,
) -> Result<RunSummary> {
    let config = PipelineConfig::from_env()?.with_target_date(target_date);
    let pipeline = SyncPipeline::from_config(&config, sink_choice).await?;
    pipeline.run_once().await
}
