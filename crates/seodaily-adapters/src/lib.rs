//! Row source contract and the Search Console / Analytics providers.

use async_trait::async_trait;
use chrono::NaiveDate;
use seodaily_core::{
    schema, AnalyticsRow, Batch, BatchOrigin, MetricRow, SearchConsoleRow,
};
use seodaily_storage::{api_url, AccessToken, FetchError, HttpClient};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "seodaily-adapters";

pub const SEARCH_CONSOLE_PROVIDER: &str = "search-console";
pub const ANALYTICS_PROVIDER: &str = "analytics";

pub const DEFAULT_SEARCH_CONSOLE_ENDPOINT: &str = "https://www.googleapis.com";
pub const DEFAULT_ANALYTICS_ENDPOINT: &str = "https://analyticsdata.googleapis.com";
pub const DEFAULT_ROW_LIMIT: u32 = 2500;

/// Dimensions tried in order; the first one that yields rows wins.
pub const ANALYTICS_DIMENSIONS: [&str; 4] = [
    "pageLocation",
    "landingPagePlusQueryString",
    "pagePathPlusQueryString",
    "pagePath",
];

const PATH_DIMENSIONS: [&str; 3] = [
    "landingPagePlusQueryString",
    "pagePathPlusQueryString",
    "pagePath",
];

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} unavailable: {source}")]
    Unavailable {
        provider: &'static str,
        #[source]
        source: FetchError,
    },
}

/// Produces one provider's rows for a target date. Never fails: when the upstream
/// API cannot be used the source answers with its deterministic fallback rows.
#[async_trait]
pub trait RowSource: Send + Sync {
    fn provider_id(&self) -> &'static str;

    fn schema(&self) -> Vec<String>;

    fn is_live(&self) -> bool;

    async fn fetch(&self, target_date: NaiveDate) -> Batch;
}

#[derive(Debug, Clone)]
pub struct SearchConsoleConfig {
    pub endpoint: String,
    pub site_url: Option<String>,
    pub row_limit: u32,
    pub token: Option<AccessToken>,
}

impl Default for SearchConsoleConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SEARCH_CONSOLE_ENDPOINT.to_string(),
            site_url: None,
            row_limit: DEFAULT_ROW_LIMIT,
            token: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConsoleClient {
    http: HttpClient,
    endpoint: String,
    site_url: String,
    row_limit: u32,
    token: AccessToken,
}

impl SearchConsoleClient {
    pub async fn query(&self, target_date: NaiveDate) -> Result<Vec<SearchConsoleRow>, ProviderError> {
        let unavailable = |source: FetchError| ProviderError::Unavailable {
            provider: SEARCH_CONSOLE_PROVIDER,
            source,
        };
        let url = api_url(
            &self.endpoint,
            &[
                "webmasters",
                "v3",
                "sites",
                self.site_url.as_str(),
                "searchAnalytics",
                "query",
            ],
        )
        .map_err(unavailable)?;
        let day = target_date.format("%Y-%m-%d").to_string();
        let body = json!({
            "startDate": day,
            "endDate": day,
            "dimensions": ["page"],
            "rowLimit": self.row_limit,
        });
        let payload = self
            .http
            .post_json(url, Some(&self.token), &body)
            .await
            .map_err(unavailable)?;
        Ok(parse_search_console_rows(&payload, target_date))
    }
}

fn metric(row: &JsonValue, name: &str) -> f64 {
    row.get(name).and_then(JsonValue::as_f64).unwrap_or(0.0)
}

/// Map a `searchAnalytics.query` response onto typed rows; rows without a page are skipped.
pub fn parse_search_console_rows(payload: &JsonValue, target_date: NaiveDate) -> Vec<SearchConsoleRow> {
    let Some(rows) = payload.get("rows").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let url = row
                .pointer("/keys/0")
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|u| !u.is_empty())?;
            Some(SearchConsoleRow {
                date: target_date,
                url: url.to_string(),
                clicks: metric(row, "clicks").round() as i64,
                impressions: metric(row, "impressions").round() as i64,
                ctr: metric(row, "ctr"),
                position: metric(row, "position"),
            })
        })
        .collect()
}

pub fn search_console_sample(target_date: NaiveDate) -> Vec<SearchConsoleRow> {
    vec![
        SearchConsoleRow {
            date: target_date,
            url: "https://example.com/article-1".to_string(),
            clicks: 120,
            impressions: 4500,
            ctr: 0.026,
            position: 8.4,
        },
        SearchConsoleRow {
            date: target_date,
            url: "https://example.com/article-2".to_string(),
            clicks: 75,
            impressions: 5200,
            ctr: 0.014,
            position: 12.1,
        },
    ]
}

/// Page metrics from Search Console.
#[derive(Debug, Clone)]
pub enum SearchConsoleSource {
    Live(SearchConsoleClient),
    Fallback,
}

impl SearchConsoleSource {
    /// Live only when both a token and a site are configured.
    pub fn from_config(config: &SearchConsoleConfig, http: &HttpClient) -> Self {
        match (&config.token, &config.site_url) {
            (Some(token), Some(site_url)) => Self::Live(SearchConsoleClient {
                http: http.clone(),
                endpoint: config.endpoint.clone(),
                site_url: site_url.clone(),
                row_limit: config.row_limit,
                token: token.clone(),
            }),
            (token, site_url) => {
                warn!(
                    provider = SEARCH_CONSOLE_PROVIDER,
                    has_token = token.is_some(),
                    has_site_url = site_url.is_some(),
                    "search console not configured; sample rows will be used"
                );
                Self::Fallback
            }
        }
    }
}

#[async_trait]
impl RowSource for SearchConsoleSource {
    fn provider_id(&self) -> &'static str {
        SEARCH_CONSOLE_PROVIDER
    }

    fn schema(&self) -> Vec<String> {
        schema(SearchConsoleRow::COLUMNS)
    }

    fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    async fn fetch(&self, target_date: NaiveDate) -> Batch {
        let client = match self {
            Self::Live(client) => client,
            Self::Fallback => {
                return Batch::from_rows(
                    SEARCH_CONSOLE_PROVIDER,
                    target_date,
                    BatchOrigin::Fallback,
                    search_console_sample(target_date),
                )
            }
        };
        match client.query(target_date).await {
            Ok(rows) => {
                info!(provider = SEARCH_CONSOLE_PROVIDER, %target_date, rows = rows.len(), "rows fetched");
                Batch::from_rows(SEARCH_CONSOLE_PROVIDER, target_date, BatchOrigin::Live, rows)
            }
            Err(err) => {
                warn!(provider = SEARCH_CONSOLE_PROVIDER, error = %err, "falling back to sample rows");
                Batch::from_rows(
                    SEARCH_CONSOLE_PROVIDER,
                    target_date,
                    BatchOrigin::Fallback,
                    search_console_sample(target_date),
                )
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub endpoint: String,
    pub property_id: Option<String>,
    pub row_limit: u32,
    pub base_url: Option<String>,
    pub url_prefixes: Vec<String>,
    pub token: Option<AccessToken>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ANALYTICS_ENDPOINT.to_string(),
            property_id: None,
            row_limit: DEFAULT_ROW_LIMIT,
            base_url: None,
            url_prefixes: Vec::new(),
            token: None,
        }
    }
}

/// Split a `|`-separated prefix list, dropping blanks.
pub fn parse_url_prefixes(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct AnalyticsClient {
    http: HttpClient,
    endpoint: String,
    property_id: String,
    row_limit: u32,
    base_url: Option<String>,
    url_prefixes: Vec<String>,
    token: AccessToken,
}

impl AnalyticsClient {
    /// Numeric property id, whether configured as `123` or `properties/123`.
    pub fn property_number(&self) -> &str {
        self.property_id
            .trim()
            .trim_start_matches("properties/")
            .trim_matches('/')
    }

    pub fn report_request(&self, target_date: NaiveDate, dimension: &str) -> JsonValue {
        let day = target_date.format("%Y-%m-%d").to_string();
        let mut request = json!({
            "dateRanges": [{ "startDate": day, "endDate": day }],
            "dimensions": [{ "name": dimension }],
            "metrics": [
                { "name": "totalUsers" },
                { "name": "sessions" },
                { "name": "averageSessionDuration" },
                { "name": "bounceRate" },
            ],
            "limit": self.row_limit,
            "keepEmptyRows": false,
        });
        if !self.url_prefixes.is_empty() {
            let expressions: Vec<JsonValue> = self
                .url_prefixes
                .iter()
                .map(|prefix| {
                    json!({
                        "filter": {
                            "fieldName": dimension,
                            "stringFilter": { "matchType": "BEGINS_WITH", "value": prefix },
                        }
                    })
                })
                .collect();
            request["dimensionFilter"] = json!({ "orGroup": { "expressions": expressions } });
        }
        request
    }

    pub async fn query(&self, target_date: NaiveDate) -> Result<Vec<AnalyticsRow>, ProviderError> {
        let unavailable = |source: FetchError| ProviderError::Unavailable {
            provider: ANALYTICS_PROVIDER,
            source,
        };
        let run_report = format!("{}:runReport", self.property_number());
        let url = api_url(&self.endpoint, &["v1beta", "properties", run_report.as_str()])
            .map_err(unavailable)?;

        for dimension in ANALYTICS_DIMENSIONS {
            let body = self.report_request(target_date, dimension);
            let payload = self
                .http
                .post_json(url.clone(), Some(&self.token), &body)
                .await
                .map_err(unavailable)?;
            let rows =
                parse_analytics_rows(&payload, target_date, dimension, self.base_url.as_deref());
            if !rows.is_empty() {
                info!(provider = ANALYTICS_PROVIDER, %target_date, dimension, rows = rows.len(), "rows fetched");
                return Ok(rows);
            }
            info!(provider = ANALYTICS_PROVIDER, %target_date, dimension, "no rows for dimension");
        }
        Ok(Vec::new())
    }
}

/// Absolute URLs pass through; path dimensions are joined to `base_url` when one is set.
pub fn normalize_page_url(raw: &str, dimension: &str, base_url: Option<&str>) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    let base = base_url.map(|b| b.trim().trim_end_matches('/')).filter(|b| !b.is_empty());
    let normalized = if PATH_DIMENSIONS.contains(&dimension) {
        value.trim_start_matches('/')
    } else {
        value
    };
    Some(match base {
        Some(base) => format!("{base}/{normalized}"),
        // The site root reduces to nothing once its slash is dropped.
        None if normalized.is_empty() => value.to_string(),
        None => normalized.to_string(),
    })
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn metric_value(row: &JsonValue, index: usize) -> f64 {
    row.get("metricValues")
        .and_then(|values| values.get(index))
        .and_then(|v| v.get("value"))
        .and_then(JsonValue::as_str)
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Map a `runReport` response onto typed rows with counts rounded to integers,
/// durations to 2 decimals and bounce rate to 4.
pub fn parse_analytics_rows(
    payload: &JsonValue,
    target_date: NaiveDate,
    dimension: &str,
    base_url: Option<&str>,
) -> Vec<AnalyticsRow> {
    let Some(rows) = payload.get("rows").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let raw = row
                .pointer("/dimensionValues/0/value")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            let url = normalize_page_url(raw, dimension, base_url)?;
            Some(AnalyticsRow {
                date: target_date,
                url,
                users: metric_value(row, 0).round() as i64,
                sessions: metric_value(row, 1).round() as i64,
                avg_session_duration: round_to(metric_value(row, 2), 2),
                bounce_rate: round_to(metric_value(row, 3), 4),
            })
        })
        .collect()
}

pub fn analytics_sample(target_date: NaiveDate) -> Vec<AnalyticsRow> {
    vec![
        AnalyticsRow {
            date: target_date,
            url: "/article-1".to_string(),
            users: 320,
            sessions: 410,
            avg_session_duration: 180.5,
            bounce_rate: 0.48,
        },
        AnalyticsRow {
            date: target_date,
            url: "/article-2".to_string(),
            users: 145,
            sessions: 200,
            avg_session_duration: 220.0,
            bounce_rate: 0.35,
        },
    ]
}

/// Path metrics from Analytics.
#[derive(Debug, Clone)]
pub enum AnalyticsSource {
    Live(AnalyticsClient),
    Fallback,
}

impl AnalyticsSource {
    pub fn from_config(config: &AnalyticsConfig, http: &HttpClient) -> Self {
        let property_id = config
            .property_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        match (&config.token, property_id) {
            (Some(token), Some(property_id)) => Self::Live(AnalyticsClient {
                http: http.clone(),
                endpoint: config.endpoint.clone(),
                property_id: property_id.to_string(),
                row_limit: config.row_limit,
                base_url: config.base_url.clone(),
                url_prefixes: config.url_prefixes.clone(),
                token: token.clone(),
            }),
            (token, property_id) => {
                warn!(
                    provider = ANALYTICS_PROVIDER,
                    has_token = token.is_some(),
                    has_property = property_id.is_some(),
                    "analytics not configured; sample rows will be used"
                );
                Self::Fallback
            }
        }
    }
}

#[async_trait]
impl RowSource for AnalyticsSource {
    fn provider_id(&self) -> &'static str {
        ANALYTICS_PROVIDER
    }

    fn schema(&self) -> Vec<String> {
        schema(AnalyticsRow::COLUMNS)
    }

    fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    async fn fetch(&self, target_date: NaiveDate) -> Batch {
        let client = match self {
            Self::Live(client) => client,
            Self::Fallback => {
                return Batch::from_rows(
                    ANALYTICS_PROVIDER,
                    target_date,
                    BatchOrigin::Fallback,
                    analytics_sample(target_date),
                )
            }
        };
        match client.query(target_date).await {
            Ok(rows) => Batch::from_rows(ANALYTICS_PROVIDER, target_date, BatchOrigin::Live, rows),
            Err(err) => {
                warn!(provider = ANALYTICS_PROVIDER, error = %err, "falling back to sample rows");
                Batch::from_rows(
                    ANALYTICS_PROVIDER,
                    target_date,
                    BatchOrigin::Fallback,
                    analytics_sample(target_date),
                )
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub search_console: SearchConsoleConfig,
    pub analytics: AnalyticsConfig,
}

pub fn source_for_provider(
    provider_id: &str,
    settings: &SourceSettings,
    http: &HttpClient,
) -> Option<Box<dyn RowSource>> {
    match provider_id {
        SEARCH_CONSOLE_PROVIDER => Some(Box::new(SearchConsoleSource::from_config(
            &settings.search_console,
            http,
        ))),
        ANALYTICS_PROVIDER => Some(Box::new(AnalyticsSource::from_config(
            &settings.analytics,
            http,
        ))),
        _ => None,
    }
}
