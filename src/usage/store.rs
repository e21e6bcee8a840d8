//! Append-only daily usage files and their aggregations.
//!
//! Layout: `{root}/{tenantId}/{YYYY-MM}/{YYYY-MM-DD}.jsonl`, one JSON record
//! per line, UTF-8, partitioned by UTC calendar day. Appends are serialized
//! per file; each append is a single write of one terminated line, which
//! keeps the format safe under concurrent writers. Readers skip blank and
//! malformed lines so a torn write never poisons aggregation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::pricing::round6;
use crate::usage::UsageRecord;

// ---------------------------------------------------------------------------
// Aggregation shapes
// ---------------------------------------------------------------------------

/// Summed counters over a set of usage records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_duration_ms: u64,
    /// Percentage of records with status >= 400, integer-rounded.
    pub error_rate: u32,
}

/// One day's aggregation, with per-model and per-hour buckets of the same
/// shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub date: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
    pub by_model: BTreeMap<String, UsageTotals>,
    pub by_hour: BTreeMap<String, UsageTotals>,
}

impl DailyUsage {
    fn zeroed(date: NaiveDate) -> Self {
        Self {
            date: date.to_string(),
            totals: UsageTotals::default(),
            by_model: BTreeMap::new(),
            by_hour: BTreeMap::new(),
        }
    }
}

/// Aggregation over an inclusive date range.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeUsage {
    pub from: String,
    pub to: String,
    pub days: Vec<DailyUsage>,
    pub totals: UsageTotals,
}

/// Snapshot of a tenant's position against its daily cap.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitStatus {
    pub date: String,
    pub spend: f64,
    #[serde(rename = "maxUSD")]
    pub max_usd: Option<f64>,
    pub percent_used: u32,
    pub exceeded: bool,
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Running sums; finalized into [`UsageTotals`] once all records are seen.
#[derive(Debug, Default, Clone)]
struct Accumulator {
    requests: u64,
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_tokens: u64,
    cache_read_tokens: u64,
    total_tokens: u64,
    cost: f64,
    duration_sum: u64,
    errors: u64,
}

impl Accumulator {
    fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
        self.cache_creation_tokens += record.cache_creation_tokens;
        self.cache_read_tokens += record.cache_read_tokens;
        self.total_tokens += record.total_tokens;
        self.cost += record.total_cost;
        self.duration_sum += record.duration;
        if record.status_code >= 400 {
            self.errors += 1;
        }
    }

    fn merge(&mut self, other: &Accumulator) {
        self.requests += other.requests;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
        self.duration_sum += other.duration_sum;
        self.errors += other.errors;
    }

    fn finish(&self) -> UsageTotals {
        let (avg_duration_ms, error_rate) = if self.requests == 0 {
            (0, 0)
        } else {
            (
                (self.duration_sum as f64 / self.requests as f64).round() as u64,
                (self.errors as f64 / self.requests as f64 * 100.0).round() as u32,
            )
        };
        UsageTotals {
            requests: self.requests,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_tokens: self.cache_creation_tokens,
            cache_read_tokens: self.cache_read_tokens,
            total_tokens: self.total_tokens,
            total_cost: round6(self.cost),
            avg_duration_ms,
            error_rate,
        }
    }
}

// ---------------------------------------------------------------------------
// UsageStore
// ---------------------------------------------------------------------------

/// File-backed usage store rooted at `data/usage` in production.
pub struct UsageStore {
    root: PathBuf,
    /// One append lock per day file, so concurrent requests for the same
    /// tenant/day never interleave partial lines.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl UsageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn day_file(&self, tenant_id: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(tenant_id)
            .join(format!("{:04}-{:02}", date.year(), date.month()))
            .join(format!("{date}.jsonl"))
    }

    async fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one record to the tenant's day file (derived from the record's
    /// own UTC timestamp). Durable once this returns.
    pub async fn record(&self, record: &UsageRecord) -> std::io::Result<()> {
        let date = record_date(record);
        let path = self.day_file(&record.tenant_id, date);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        line.push('\n');

        let lock = self.file_lock(&path).await;
        let _guard = lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        // One write call per record keeps the line atomic for readers.
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Aggregate one day. A missing file yields a zeroed aggregation.
    pub async fn daily_usage(&self, tenant_id: &str, date: NaiveDate) -> DailyUsage {
        self.load_day(tenant_id, date).await.0
    }

    /// Read and fold one day file, keeping the raw sums alongside the
    /// finished aggregation so range queries combine days exactly.
    async fn load_day(&self, tenant_id: &str, date: NaiveDate) -> (DailyUsage, Accumulator) {
        let path = self.day_file(tenant_id, date);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read usage file");
                }
                return (DailyUsage::zeroed(date), Accumulator::default());
            }
        };

        let mut totals = Accumulator::default();
        let mut by_model: BTreeMap<String, Accumulator> = BTreeMap::new();
        let mut by_hour: BTreeMap<String, Accumulator> = BTreeMap::new();

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<UsageRecord>(line) else {
                // Torn or corrupt line; skip rather than fail the whole day.
                continue;
            };

            totals.add(&record);
            by_model
                .entry(record.model.clone())
                .or_default()
                .add(&record);
            if let Ok(ts) = DateTime::parse_from_rfc3339(&record.timestamp) {
                let hour = format!("{:02}", ts.with_timezone(&Utc).hour());
                by_hour.entry(hour).or_default().add(&record);
            }
        }

        let day = DailyUsage {
            date: date.to_string(),
            totals: totals.finish(),
            by_model: by_model.into_iter().map(|(k, a)| (k, a.finish())).collect(),
            by_hour: by_hour.into_iter().map(|(k, a)| (k, a.finish())).collect(),
        };
        (day, totals)
    }

    /// Aggregate an inclusive date range; missing days are zeroed.
    pub async fn usage_in_range(
        &self,
        tenant_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> RangeUsage {
        let mut days = Vec::new();
        let mut combined = Accumulator::default();

        let mut date = from;
        while date <= to {
            let (day, sums) = self.load_day(tenant_id, date).await;
            combined.merge(&sums);
            days.push(day);
            let Some(next) = date.succ_opt() else { break };
            date = next;
        }

        RangeUsage {
            from: from.to_string(),
            to: to.to_string(),
            days,
            totals: combined.finish(),
        }
    }

    /// Seven days starting at `start`.
    pub async fn weekly_usage(&self, tenant_id: &str, start: NaiveDate) -> RangeUsage {
        let end = start + Duration::days(6);
        self.usage_in_range(tenant_id, start, end).await
    }

    /// Whole calendar month. `None` for an invalid year/month pair.
    pub async fn monthly_usage(
        &self,
        tenant_id: &str,
        year: i32,
        month: u32,
    ) -> Option<RangeUsage> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let last = NaiveDate::from_ymd_opt(year, month, days_in_month(year, month))?;
        Some(self.usage_in_range(tenant_id, first, last).await)
    }

    /// Today's spend in USD (UTC day).
    pub async fn today_spend(&self, tenant_id: &str) -> f64 {
        let today = Utc::now().date_naive();
        self.daily_usage(tenant_id, today).await.totals.total_cost
    }

    /// Today's spend against the configured cap.
    pub async fn limit_status(&self, tenant_id: &str, max_usd: Option<f64>) -> LimitStatus {
        let today = Utc::now().date_naive();
        let spend = self.daily_usage(tenant_id, today).await.totals.total_cost;

        let (percent_used, exceeded) = match max_usd {
            Some(cap) => {
                let percent = if cap > 0.0 {
                    ((spend / cap) * 100.0).round() as u32
                } else {
                    0
                };
                (percent, spend >= cap)
            }
            None => (0, false),
        };

        LimitStatus {
            date: today.to_string(),
            spend,
            max_usd,
            percent_used,
            exceeded,
        }
    }
}

/// UTC day a record belongs to, from its own timestamp (falling back to the
/// current day for unparseable timestamps).
fn record_date(record: &UsageRecord) -> NaiveDate {
    DateTime::parse_from_rfc3339(&record.timestamp)
        .map(|ts| ts.with_timezone(&Utc).date_naive())
        .unwrap_or_else(|_| Utc::now().date_naive())
}

/// Number of days in a given month.
fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
