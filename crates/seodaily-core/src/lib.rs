//! Core data model, target-date resolution and the upsert-merge engine for seodaily.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{Days, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "seodaily-core";

pub const DATE_COLUMN: &str = "date";
pub const URL_COLUMN: &str = "url";

/// Days subtracted from "today" when no override is given; upstream APIs lag behind.
pub const DEFAULT_LOOKBACK_DAYS: u32 = 2;

pub const SEARCH_CONSOLE_COLUMNS: &[&str] =
    &["date", "url", "clicks", "impressions", "ctr", "position"];

pub const ANALYTICS_COLUMNS: &[&str] = &[
    "date",
    "url",
    "users",
    "sessions",
    "avg_session_duration",
    "bounce_rate",
];

/// Owned column schema from a static column list.
pub fn schema(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| c.to_string()).collect()
}

/// A single spreadsheet cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Integer(i64),
    Number(f64),
    Date(NaiveDate),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.is_empty(),
            _ => false,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Text(text) => f.write_str(text),
            CellValue::Integer(value) => write!(f, "{value}"),
            CellValue::Number(value) => write!(f, "{value}"),
            CellValue::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Integer(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(value: NaiveDate) -> Self {
        CellValue::Date(value)
    }
}

/// Logical identity of a row: the rendered `date` and `url` cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub date: String,
    pub url: String,
}

impl RowKey {
    fn from_cells(date: Option<&CellValue>, url: Option<&CellValue>) -> Self {
        let render = |cell: Option<&CellValue>| {
            cell.map(|c| c.to_string().trim().to_string())
                .unwrap_or_default()
        };
        Self {
            date: render(date),
            url: render(url),
        }
    }
}

/// Column name to cell mapping produced by a row source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    fields: BTreeMap<String, CellValue>,
}

impl Record {
    pub fn new(date: NaiveDate, url: impl Into<String>) -> Self {
        Self::default()
            .with(DATE_COLUMN, date)
            .with(URL_COLUMN, url.into())
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<CellValue>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.fields.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn key(&self) -> RowKey {
        RowKey::from_cells(self.get(DATE_COLUMN), self.get(URL_COLUMN))
    }

    /// Cells aligned to `headers`; only columns listed in `schema` are taken from the record.
    pub fn project(&self, headers: &[String], schema: &[String]) -> Vec<CellValue> {
        headers
            .iter()
            .map(|header| {
                if schema.contains(header) {
                    self.get(header).cloned().unwrap_or_default()
                } else {
                    CellValue::Empty
                }
            })
            .collect()
    }
}

/// Typed provider row with a fixed column set.
pub trait MetricRow {
    const COLUMNS: &'static [&'static str];

    fn into_record(self) -> Record;
}

/// Page-level Search Console metrics for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConsoleRow {
    pub date: NaiveDate,
    pub url: String,
    pub clicks: i64,
    pub impressions: i64,
    pub ctr: f64,
    pub position: f64,
}

impl MetricRow for SearchConsoleRow {
    const COLUMNS: &'static [&'static str] = SEARCH_CONSOLE_COLUMNS;

    fn into_record(self) -> Record {
        Record::new(self.date, self.url)
            .with("clicks", self.clicks)
            .with("impressions", self.impressions)
            .with("ctr", self.ctr)
            .with("position", self.position)
    }
}

/// Path-level Analytics metrics for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRow {
    pub date: NaiveDate,
    pub url: String,
    pub users: i64,
    pub sessions: i64,
    pub avg_session_duration: f64,
    pub bounce_rate: f64,
}

impl MetricRow for AnalyticsRow {
    const COLUMNS: &'static [&'static str] = ANALYTICS_COLUMNS;

    fn into_record(self) -> Record {
        Record::new(self.date, self.url)
            .with("users", self.users)
            .with("sessions", self.sessions)
            .with("avg_session_duration", self.avg_session_duration)
            .with("bounce_rate", self.bounce_rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOrigin {
    Live,
    Fallback,
}

/// Records fetched from one provider for one target date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub provider_id: String,
    pub target_date: NaiveDate,
    pub origin: BatchOrigin,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn from_rows<R: MetricRow>(
        provider_id: impl Into<String>,
        target_date: NaiveDate,
        origin: BatchOrigin,
        rows: Vec<R>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            target_date,
            origin,
            records: rows.into_iter().map(MetricRow::into_record).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Header row plus data rows, each row aligned to the headers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl Table {
    pub fn with_headers(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    /// Build a table from a raw cell grid whose first row holds the headers.
    /// Short rows are padded with empty cells; cells past the last header are dropped.
    pub fn from_grid(grid: Vec<Vec<CellValue>>) -> Self {
        let mut grid = grid.into_iter();
        let Some(header_row) = grid.next() else {
            return Self::default();
        };
        let mut headers: Vec<String> = header_row
            .iter()
            .map(|cell| cell.to_string().trim().to_string())
            .collect();
        while headers.last().is_some_and(|h| h.is_empty()) {
            headers.pop();
        }
        let width = headers.len();
        let rows = grid
            .filter(|row| row.iter().any(|cell| !cell.is_empty()))
            .map(|mut row| {
                row.resize(width, CellValue::Empty);
                row
            })
            .collect();
        Self { headers, rows }
    }

    /// Header row followed by data rows.
    pub fn to_grid(&self) -> Vec<Vec<CellValue>> {
        let mut grid = Vec::with_capacity(self.rows.len() + 1);
        grid.push(
            self.headers
                .iter()
                .map(|h| CellValue::Text(h.clone()))
                .collect(),
        );
        grid.extend(self.rows.iter().cloned());
        grid
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == column)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&CellValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub fn keys(&self) -> Vec<RowKey> {
        let locator = KeyLocator::for_table(self);
        self.rows.iter().map(|row| locator.key(row)).collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyLocator {
    date: Option<usize>,
    url: Option<usize>,
}

impl KeyLocator {
    fn for_table(table: &Table) -> Self {
        Self {
            date: table.column_index(DATE_COLUMN),
            url: table.column_index(URL_COLUMN),
        }
    }

    fn key(&self, row: &[CellValue]) -> RowKey {
        RowKey::from_cells(
            self.date.and_then(|i| row.get(i)),
            self.url.and_then(|i| row.get(i)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("schema mismatch: no destination columns for a batch of {rows} rows")]
    SchemaMismatch { rows: usize },
}

/// Reconcile `batch` into `existing`, replacing rows whose (date, url) key is in the batch.
///
/// Untouched rows keep their values and relative order; batch rows are appended in
/// batch order, projected onto the headers. Within the batch the last record for a
/// key wins. An empty batch returns the table unchanged (or a header-only table
/// built from `schema` when none existed).
pub fn merge(
    existing: Option<Table>,
    batch: &[Record],
    schema: &[String],
) -> Result<Table, MergeError> {
    if schema.is_empty() && !batch.is_empty() {
        return Err(MergeError::SchemaMismatch { rows: batch.len() });
    }
    if batch.is_empty() {
        return Ok(existing.unwrap_or_else(|| Table::with_headers(schema.to_vec())));
    }

    let mut table = match existing {
        Some(table) if !table.headers.is_empty() => table,
        _ => Table::with_headers(schema.to_vec()),
    };
    for column in schema {
        if !table.headers.contains(column) {
            table.headers.push(column.clone());
        }
    }

    let incoming = last_write_wins(batch);
    let incoming_keys: HashSet<RowKey> = incoming.iter().map(|r| r.key()).collect();
    let locator = KeyLocator::for_table(&table);
    let width = table.headers.len();

    let mut rows: Vec<Vec<CellValue>> = table
        .rows
        .into_iter()
        .filter(|row| !incoming_keys.contains(&locator.key(row)))
        .map(|mut row| {
            row.resize(width, CellValue::Empty);
            row
        })
        .collect();
    rows.extend(
        incoming
            .into_iter()
            .map(|record| record.project(&table.headers, schema)),
    );

    Ok(Table {
        headers: table.headers,
        rows,
    })
}

/// Drop every record that a later record with the same key supersedes.
fn last_write_wins(batch: &[Record]) -> Vec<&Record> {
    let mut last_seen: HashMap<RowKey, usize> = HashMap::new();
    for (idx, record) in batch.iter().enumerate() {
        last_seen.insert(record.key(), idx);
    }
    batch
        .iter()
        .enumerate()
        .filter(|(idx, record)| last_seen.get(&record.key()) == Some(idx))
        .map(|(_, record)| record)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("invalid target date `{input}`: expected YYYY-MM-DD")]
    InvalidDateFormat { input: String },
    #[error("lookback of {lookback_days} days from {today} is out of range")]
    OutOfRange { today: NaiveDate, lookback_days: u32 },
}

/// Parse a `YYYY-MM-DD` date, rejecting unpadded or otherwise loose forms.
pub fn parse_target_date(input: &str) -> Result<NaiveDate, DateError> {
    let invalid = || DateError::InvalidDateFormat {
        input: input.to_string(),
    };
    let trimmed = input.trim();
    let bytes = trimmed.as_bytes();
    let shaped = bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shaped {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| invalid())
}

/// Parse `Z`, `UTC`, `+HH:MM`, `-HH:MM` or `+HHMM` into a fixed offset.
pub fn parse_utc_offset(input: &str) -> Option<FixedOffset> {
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return Some(Utc.fix());
    }
    let (sign, rest) = match trimmed.as_bytes().first()? {
        b'+' => (1, &trimmed[1..]),
        b'-' => (-1, &trimmed[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Computes the single processing date of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateResolver {
    pub lookback_days: u32,
    pub utc_offset: FixedOffset,
}

impl Default for DateResolver {
    fn default() -> Self {
        Self {
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            utc_offset: Utc.fix(),
        }
    }
}

impl DateResolver {
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.utc_offset).date_naive()
    }

    pub fn resolve(&self, override_date: Option<&str>) -> Result<NaiveDate, DateError> {
        self.resolve_at(override_date, self.today())
    }

    /// A blank override counts as absent.
    pub fn resolve_at(
        &self,
        override_date: Option<&str>,
        today: NaiveDate,
    ) -> Result<NaiveDate, DateError> {
        match override_date.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => parse_target_date(raw),
            None => today
                .checked_sub_days(Days::new(u64::from(self.lookback_days)))
                .ok_or(DateError::OutOfRange {
                    today,
                    lookback_days: self.lookback_days,
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn gsc(date: &str, url: &str, clicks: i64) -> Record {
        Record::new(d(date), url).with("clicks", clicks)
    }

    fn clicks_schema() -> Vec<String> {
        schema(&["date", "url", "clicks"])
    }

    fn urls(table: &Table) -> Vec<String> {
        table.keys().into_iter().map(|k| k.url).collect()
    }

    #[test]
    fn rerun_replaces_existing_row_and_appends_new_one() {
        let existing = merge(None, &[gsc("2024-05-01", "/a", 10)], &clicks_schema()).unwrap();
        let batch = vec![gsc("2024-05-01", "/a", 15), gsc("2024-05-01", "/b", 3)];

        let merged = merge(Some(existing), &batch, &clicks_schema()).unwrap();

        assert_eq!(merged.headers, clicks_schema());
        assert_eq!(
            merged.rows,
            vec![
                vec![CellValue::Date(d("2024-05-01")), "/a".into(), CellValue::Integer(15)],
                vec![CellValue::Date(d("2024-05-01")), "/b".into(), CellValue::Integer(3)],
            ]
        );
    }

    #[test]
    fn absent_table_is_created_from_schema() {
        let batch = vec![Record::new(d("2024-05-02"), "/x").with("clicks", 1i64).with("extra", "dropped")];
        let merged = merge(None, &batch, &clicks_schema()).unwrap();
        assert_eq!(merged.headers, clicks_schema());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.value(0, "clicks"), Some(&CellValue::Integer(1)));
        assert_eq!(merged.column_index("extra"), None);
    }

    #[test]
    fn missing_fields_project_to_empty_cells() {
        let batch = vec![Record::new(d("2024-05-02"), "/x")];
        let merged = merge(None, &batch, &clicks_schema()).unwrap();
        assert_eq!(merged.value(0, "clicks"), Some(&CellValue::Empty));
    }

    #[test]
    fn empty_batch_returns_existing_table_untouched() {
        let existing = Table {
            headers: vec!["legacy".into()],
            rows: vec![vec!["keep me".into()]],
        };
        let merged = merge(Some(existing.clone()), &[], &clicks_schema()).unwrap();
        assert_eq!(merged, existing);

        let created = merge(None, &[], &clicks_schema()).unwrap();
        assert_eq!(created, Table::with_headers(clicks_schema()));
    }

    #[test]
    fn empty_schema_with_rows_is_a_schema_mismatch() {
        let err = merge(None, &[gsc("2024-05-01", "/a", 1)], &[]).unwrap_err();
        assert_eq!(err, MergeError::SchemaMismatch { rows: 1 });
        assert!(merge(None, &[], &[]).is_ok());
    }

    #[test]
    fn later_duplicate_in_batch_wins() {
        let batch = vec![
            gsc("2024-05-01", "/a", 1),
            gsc("2024-05-01", "/b", 2),
            gsc("2024-05-01", "/a", 9),
        ];
        let merged = merge(None, &batch, &clicks_schema()).unwrap();
        assert_eq!(urls(&merged), vec!["/b", "/a"]);
        assert_eq!(merged.value(1, "clicks"), Some(&CellValue::Integer(9)));
    }

    #[test]
    fn untouched_rows_keep_values_and_order() {
        let existing = Table {
            headers: clicks_schema(),
            rows: vec![
                vec!["2024-04-30".into(), "/z".into(), "7".into()],
                vec!["2024-05-01".into(), "/a".into(), "10".into()],
                vec!["2024-04-30".into(), "/y".into(), CellValue::Number(0.5)],
            ],
        };
        let merged = merge(Some(existing), &[gsc("2024-05-01", "/a", 11)], &clicks_schema()).unwrap();
        assert_eq!(urls(&merged), vec!["/z", "/y", "/a"]);
        assert_eq!(merged.rows[0][2], CellValue::Text("7".into()));
        assert_eq!(merged.rows[1][2], CellValue::Number(0.5));
    }

    #[test]
    fn text_dates_read_back_from_a_sink_match_typed_dates() {
        let existing = Table {
            headers: clicks_schema(),
            rows: vec![vec!["2024-05-01".into(), " /a ".into(), "10".into()]],
        };
        let merged = merge(Some(existing), &[gsc("2024-05-01", "/a", 12)], &clicks_schema()).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.value(0, "clicks"), Some(&CellValue::Integer(12)));
    }

    #[test]
    fn existing_headers_are_extended_with_new_schema_columns() {
        let existing = Table {
            headers: vec!["date".into(), "url".into(), "notes".into()],
            rows: vec![vec!["2024-04-01".into(), "/old".into(), "manual".into()]],
        };
        let merged = merge(Some(existing), &[gsc("2024-05-01", "/new", 4)], &clicks_schema()).unwrap();
        assert_eq!(merged.headers, vec!["date", "url", "notes", "clicks"]);
        assert_eq!(
            merged.rows[0],
            vec!["2024-04-01".into(), "/old".into(), "manual".into(), CellValue::Empty]
        );
        assert_eq!(merged.value(1, "notes"), Some(&CellValue::Empty));
        assert_eq!(merged.value(1, "clicks"), Some(&CellValue::Integer(4)));
    }

    #[test]
    fn headerless_existing_table_adopts_schema() {
        let merged = merge(Some(Table::default()), &[gsc("2024-05-01", "/a", 1)], &clicks_schema()).unwrap();
        assert_eq!(merged.headers, clicks_schema());
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn grid_round_trip_pads_short_rows_and_skips_blank_ones() {
        let table = Table::from_grid(vec![
            vec!["date".into(), "url".into(), "clicks".into(), "".into()],
            vec!["2024-05-01".into(), "/a".into()],
            vec![],
            vec!["2024-05-01".into(), "/b".into(), "3".into(), "stray".into()],
        ]);
        assert_eq!(table.headers, clicks_schema());
        assert_eq!(table.rows[0], vec!["2024-05-01".into(), "/a".into(), CellValue::Empty]);
        assert_eq!(table.rows[1].len(), 3);
        assert_eq!(table.to_grid().len(), 3);
    }

    #[test]
    fn provider_rows_follow_their_column_schema() {
        let record = SearchConsoleRow {
            date: d("2024-05-01"),
            url: "https://example.com/a".into(),
            clicks: 3,
            impressions: 40,
            ctr: 0.075,
            position: 4.2,
        }
        .into_record();
        let mut columns: Vec<&str> = record.columns().collect();
        let mut expected = SearchConsoleRow::COLUMNS.to_vec();
        columns.sort_unstable();
        expected.sort_unstable();
        assert_eq!(columns, expected);

        let batch = Batch::from_rows(
            "analytics",
            d("2024-05-01"),
            BatchOrigin::Fallback,
            vec![AnalyticsRow {
                date: d("2024-05-01"),
                url: "/a".into(),
                users: 1,
                sessions: 2,
                avg_session_duration: 3.5,
                bounce_rate: 0.25,
            }],
        );
        let merged = merge(None, &batch.records, &schema(ANALYTICS_COLUMNS)).unwrap();
        assert_eq!(merged.value(0, "avg_session_duration"), Some(&CellValue::Number(3.5)));
    }

    #[test]
    fn cell_rendering() {
        assert_eq!(CellValue::Date(d("2024-01-09")).to_string(), "2024-01-09");
        assert_eq!(CellValue::Number(8.4).to_string(), "8.4");
        assert_eq!(CellValue::Integer(120).to_string(), "120");
        assert_eq!(CellValue::Empty.to_string(), "");
    }

    #[test]
    fn target_date_override_must_be_strict_iso() {
        assert_eq!(parse_target_date("2024-05-01").unwrap(), d("2024-05-01"));
        for bad in ["2024-5-1", "2024/05/01", "01-05-2024", "2024-02-30", "yesterday", "2024-05-01T00:00"] {
            assert!(
                matches!(parse_target_date(bad), Err(DateError::InvalidDateFormat { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn default_target_is_two_days_back() {
        let resolver = DateResolver::default();
        assert_eq!(resolver.resolve_at(None, d("2024-03-01")).unwrap(), d("2024-02-28"));
        assert_eq!(resolver.resolve_at(Some("  "), d("2024-03-01")).unwrap(), d("2024-02-28"));
        assert_eq!(
            resolver.resolve_at(Some("2023-12-31"), d("2024-03-01")).unwrap(),
            d("2023-12-31")
        );
        assert!(resolver.resolve_at(Some("31/12/2023"), d("2024-03-01")).is_err());
    }

    #[test]
    fn custom_lookback() {
        let resolver = DateResolver {
            lookback_days: 3,
            ..DateResolver::default()
        };
        assert_eq!(resolver.resolve_at(None, d("2024-01-02")).unwrap(), d("2023-12-30"));
    }

    #[test]
    fn utc_offsets() {
        assert_eq!(parse_utc_offset("-05:00"), FixedOffset::west_opt(5 * 3600));
        assert_eq!(parse_utc_offset("+0530"), FixedOffset::east_opt(5 * 3600 + 30 * 60));
        assert_eq!(parse_utc_offset("UTC"), FixedOffset::east_opt(0));
        assert_eq!(parse_utc_offset("America/Bogota"), None);
        assert_eq!(parse_utc_offset("+25:00"), None);
    }

    fn arb_batch() -> impl Strategy<Value = Vec<Record>> {
        prop::collection::vec((0u8..3, 0u8..6, 0i64..1000), 0..12).prop_map(|rows| {
            rows.into_iter()
                .map(|(day, page, clicks)| {
                    let date = d("2024-05-01") + chrono::Duration::days(i64::from(day));
                    Record::new(date, format!("/page-{page}")).with("clicks", clicks)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn merging_the_same_batch_twice_is_idempotent(seed in arb_batch(), batch in arb_batch()) {
            let schema = clicks_schema();
            let base = merge(None, &seed, &schema).unwrap();
            let once = merge(Some(base), &batch, &schema).unwrap();
            let twice = merge(Some(once.clone()), &batch, &schema).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn merged_tables_never_repeat_a_key(seed in arb_batch(), batch in arb_batch()) {
            let schema = clicks_schema();
            let base = merge(None, &seed, &schema).unwrap();
            let merged = merge(Some(base), &batch, &schema).unwrap();
            let keys = merged.keys();
            let unique: HashSet<_> = keys.iter().collect();
            prop_assert_eq!(unique.len(), keys.len());
        }

        #[test]
        fn rows_outside_the_batch_are_preserved_in_order(seed in arb_batch(), batch in arb_batch()) {
            let schema = clicks_schema();
            let base = merge(None, &seed, &schema).unwrap();
            let touched: HashSet<RowKey> = batch.iter().map(Record::key).collect();
            let expected: Vec<Vec<CellValue>> = base
                .rows
                .iter()
                .zip(base.keys())
                .filter(|(_, key)| !touched.contains(key))
                .map(|(row, _)| row.clone())
                .collect();
            let merged = merge(Some(base), &batch, &schema).unwrap();
            prop_assert_eq!(&merged.rows[..expected.len()], &expected[..]);
        }
    }
}
