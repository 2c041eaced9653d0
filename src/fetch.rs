//! Replays captured endpoints with the browser's cookies, reads responses the
//! page already received, and collects the interval export the page downloads.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{Days, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::browser::{DownloadEvent, DownloadTap, PortalPage};
use crate::dataset::{parse_rows, round2, round3, BillRecord, DatasetKind, MeterRead, TouPeriod, UsageRecord};
use crate::error::{FetchFailure, ScrapeError};
use crate::intercept::EndpointDescriptor;
use crate::portal;
use crate::session::SessionContext;
use crate::shadow::Locator;
use crate::wait::{poll_until, Backoff};

/// Body of `usage-history-ajax/format/json`.
#[derive(Debug, Deserialize)]
pub struct ChartPayload {
    #[serde(default)]
    pub column_fulldates: Vec<String>,
    #[serde(default)]
    pub series_data: Vec<ChartSeries>,
}

#[derive(Debug, Deserialize)]
pub struct ChartSeries {
    pub name: String,
    #[serde(default)]
    pub data: Vec<Option<f64>>,
}

fn chart_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.split(' ').next().unwrap_or_default();
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(day, "%m/%d/%Y"))
        .ok()
}

/// Flattens a chart payload into records. Time-of-use kinds keep one record
/// per series; the rest are summed per date.
pub fn chart_records(kind: DatasetKind, payload: &ChartPayload) -> Result<Vec<UsageRecord>, FetchFailure> {
    if payload.column_fulldates.is_empty() || payload.series_data.is_empty() {
        return Err(FetchFailure::Empty(format!(
            "{} dates, {} series",
            payload.column_fulldates.len(),
            payload.series_data.len()
        )));
    }

    let mut records = Vec::new();
    for (i, raw) in payload.column_fulldates.iter().enumerate() {
        let Some(date) = chart_date(raw) else {
            debug!("skipping unparseable chart date {raw:?}");
            continue;
        };
        let values = payload
            .series_data
            .iter()
            .map(|s| (s, s.data.get(i).copied().flatten()));

        if kind.has_periods() {
            for (series, value) in values {
                let Some(period) = TouPeriod::from_series_name(&series.name) else {
                    debug!("ignoring series {:?}", series.name);
                    continue;
                };
                records.push(UsageRecord {
                    date,
                    period: Some(period),
                    quantity: value.unwrap_or(0.0),
                });
            }
        } else {
            let quantity = values.filter_map(|(_, v)| v).sum::<f64>();
            records.push(UsageRecord { date, period: None, quantity: round3(quantity) });
        }
    }

    if records.is_empty() {
        return Err(FetchFailure::Empty(format!(
            "no usable dates among {}",
            payload.column_fulldates.len()
        )));
    }
    Ok(records)
}

/// Keeps records inside the dataset's window; nothing left is a failure.
pub fn within_window(kind: DatasetKind, today: NaiveDate, records: Vec<UsageRecord>) -> Result<Vec<UsageRecord>, FetchFailure> {
    keep_window(kind, today, records, |r| r.date)
}

fn keep_window<T>(kind: DatasetKind, today: NaiveDate, records: Vec<T>, date: impl Fn(&T) -> NaiveDate) -> Result<Vec<T>, FetchFailure> {
    let window = kind.window();
    let received = records.len();
    let kept: Vec<T> = records
        .into_iter()
        .filter(|r| window.contains(today, date(r)))
        .collect();
    if kept.is_empty() {
        return Err(FetchFailure::OutsideWindow {
            window: window.to_string(),
            received,
        });
    }
    if kept.len() < received {
        debug!("{kind}: dropped {} records outside the {window} window", received - kept.len());
    }
    Ok(kept)
}

/* ---------------- Bill history ---------------- */

/// Body of `bill-presentment-account-summary-ajax`.
#[derive(Debug, Deserialize)]
pub struct BillPayload {
    #[serde(default)]
    pub cost_barchart: CostChart,
}

#[derive(Debug, Default, Deserialize)]
pub struct CostChart {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub series_data: Vec<BillSeries>,
}

#[derive(Debug, Deserialize)]
pub struct BillSeries {
    pub name: String,
    #[serde(default)]
    pub data: Vec<Value>,
}

const ELECTRIC_CHARGES: &str = "Electric Charges";
const GAS_CHARGES: &str = "Gas Charges";

/// Parses `$1,234.56`, `-12.5` and friends; anything unreadable is zero.
pub fn parse_money(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse().unwrap_or(0.0)
}

/// A JSON number, or a string holding one (possibly with `$` and commas).
fn amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => Some(parse_money(s)),
        _ => None,
    }
}

/// One record per billing cycle with a non-zero charge.
pub fn bill_records(payload: &BillPayload) -> Result<Vec<BillRecord>, FetchFailure> {
    let chart = &payload.cost_barchart;
    if chart.categories.is_empty() || chart.series_data.is_empty() {
        return Err(FetchFailure::Empty(format!(
            "{} billing dates, {} series",
            chart.categories.len(),
            chart.series_data.len()
        )));
    }
    let series = |name: &str| chart.series_data.iter().find(|s| s.name == name);
    let (electric, gas) = (series(ELECTRIC_CHARGES), series(GAS_CHARGES));
    let charge = |s: Option<&BillSeries>, i: usize| s.and_then(|s| s.data.get(i)).and_then(amount).unwrap_or(0.0);

    let mut records = Vec::new();
    for (i, raw) in chart.categories.iter().enumerate() {
        let Some(date) = chart_date(raw) else {
            debug!("skipping unparseable billing date {raw:?}");
            continue;
        };
        let record = BillRecord {
            date,
            electric: round2(charge(electric, i)),
            gas: round2(charge(gas, i)),
        };
        if record.electric != 0.0 || record.gas != 0.0 {
            records.push(record);
        }
    }
    if records.is_empty() {
        return Err(FetchFailure::Empty(format!("no charges among {} billing dates", chart.categories.len())));
    }
    Ok(records)
}

/* ---------------- On-demand reads ---------------- */

/// Body of the `odr-ajax` response.
#[derive(Debug, Deserialize)]
pub struct OnDemandPayload {
    #[serde(default)]
    pub error: Value,
    #[serde(default)]
    pub intervals: Vec<OnDemandInterval>,
}

#[derive(Debug, Deserialize)]
pub struct OnDemandInterval {
    #[serde(default)]
    pub last_request_timestamp: Option<String>,
    #[serde(default)]
    pub last_request_unix_timestamp: Option<Value>,
    #[serde(default)]
    pub odr_amt: Option<Value>,
    #[serde(default)]
    pub rate_level: Option<String>,
}

const ON_DEMAND_TIME_FORMAT: &str = "%m/%d/%Y %I:%M %p";

fn portal_error(error: &Value) -> Option<String> {
    match error {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Reads from an on-demand response body, oldest first.
pub fn on_demand_reads(url: &str, body: &str) -> Result<Vec<MeterRead>, FetchFailure> {
    let payload: OnDemandPayload = serde_json::from_str(body).map_err(|e| FetchFailure::MalformedJson {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if let Some(message) = portal_error(&payload.error) {
        return Err(FetchFailure::Rejected {
            url: url.to_string(),
            message,
        });
    }

    let mut reads: Vec<MeterRead> = payload
        .intervals
        .iter()
        .filter_map(|iv| {
            let secs = iv.last_request_unix_timestamp.as_ref().and_then(amount)? as i64;
            let kwh = iv.odr_amt.as_ref().and_then(amount)?;
            let raw = iv.last_request_timestamp.as_deref()?;
            let at = NaiveDateTime::parse_from_str(raw.trim(), ON_DEMAND_TIME_FORMAT)
                .ok()
                .or_else(|| Local.timestamp_opt(secs, 0).single().map(|t| t.naive_local()))?;
            Some(MeterRead {
                at,
                kwh,
                rate_level: iv.rate_level.clone().unwrap_or_default(),
                unix_ms: secs * 1000,
            })
        })
        .collect();
    if reads.is_empty() {
        return Err(FetchFailure::Empty(format!("no usable intervals among {}", payload.intervals.len())));
    }
    reads.sort_by_key(|r| r.unix_ms);
    Ok(reads)
}

/// Keeps reads taken inside the on-demand window.
pub fn reads_within_window(today: NaiveDate, reads: Vec<MeterRead>) -> Result<Vec<MeterRead>, FetchFailure> {
    keep_window(DatasetKind::OnDemandKwh, today, reads, |r| r.at.date())
}

/// Waits for the page to finish receiving the response to `request_id`.
pub fn read_response<P: PortalPage + ?Sized>(
    page: &P,
    request_id: &str,
    timeout: Duration,
    backoff: Backoff,
) -> Result<String, FetchFailure> {
    let mut last_error = None;
    poll_until("response body", timeout, backoff, || match page.response_body(request_id) {
        Ok(body) => Some(body),
        Err(e) => {
            last_error = Some(e);
            None
        }
    })
    .map_err(|elapsed| {
        let cause = last_error.unwrap_or_else(|| anyhow!("no response"));
        FetchFailure::Browser(cause.context(format!("response to {request_id} unavailable after {:?}", elapsed.waited)))
    })
}

/* ---------------- API path ---------------- */

/// HTTP client carrying one authenticated session.
pub struct UsageClient {
    client: reqwest::Client,
    session: SessionContext,
    referer: String,
    ttl: Duration,
}

impl UsageClient {
    pub fn new(session: &SessionContext, referer: &str, timeout: Duration, ttl: Duration) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .user_agent(session.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .timeout(timeout)
            .build()
            .map_err(|e| ScrapeError::browser("http client", e.into()))?;
        Ok(Self {
            client,
            session: session.clone(),
            referer: referer.to_string(),
            ttl,
        })
    }

    /// Fetches one chart dataset through a descriptor captured in this session.
    pub async fn fetch_chart(
        &self,
        kind: DatasetKind,
        descriptor: Option<&EndpointDescriptor>,
        today: NaiveDate,
    ) -> Result<Vec<UsageRecord>, FetchFailure> {
        let descriptor = descriptor.ok_or(FetchFailure::MissingEndpoint)?;
        descriptor.check_fresh(&self.session, self.ttl)?;

        let url = descriptor.with_params(&[("usageType", kind.usage_type())]);
        let start = Instant::now();
        let body = self.get_text(&url, &self.referer).await?;
        let payload: ChartPayload = serde_json::from_str(&body).map_err(|e| FetchFailure::MalformedJson {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        debug!(
            %kind,
            bytes = body.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "chart payload received"
        );

        let records = within_window(kind, today, chart_records(kind, &payload)?)?;
        info!("{kind}: {} records", records.len());
        Ok(records)
    }

    /// Re-requests the bill summary for the whole bill-history window, the
    /// way the bill page asks for it.
    pub async fn fetch_bills(
        &self,
        descriptor: Option<&EndpointDescriptor>,
        referer: &str,
        today: NaiveDate,
    ) -> Result<Vec<BillRecord>, FetchFailure> {
        let kind = DatasetKind::BillHistory;
        let descriptor = descriptor.ok_or(FetchFailure::MissingEndpoint)?;
        descriptor.check_fresh(&self.session, self.ttl)?;

        let start_date = kind.window().start(today);
        let end_date = today.checked_add_days(Days::new(1)).unwrap_or(today);
        let epoch = |d: NaiveDate| d.and_time(NaiveTime::MIN).and_utc().timestamp().to_string();
        let (start_date, end_date) = (epoch(start_date), epoch(end_date));
        let cache_buster = Utc::now().timestamp_millis().to_string();
        let url = descriptor.with_params(&[
            ("page", "false"),
            ("widget_id", portal::BILL_WIDGET_ID),
            ("start_date", start_date.as_str()),
            ("end_date", end_date.as_str()),
            ("_", cache_buster.as_str()),
        ]);

        let body = self.get_text(&url, referer).await?;
        let payload: BillPayload = serde_json::from_str(&body).map_err(|e| FetchFailure::MalformedJson {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let records = keep_window(kind, today, bill_records(&payload)?, |r| r.date)?;
        info!("{kind}: {} billing cycles", records.len());
        Ok(records)
    }

    async fn get_text(&self, url: &Url, referer: &str) -> Result<String, FetchFailure> {
        let mut req = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json, text/javascript, */*; q=0.01")
            .header(reqwest::header::REFERER, referer)
            .header("X-Requested-With", "XMLHttpRequest");
        match self.session.cookie_header_for(url) {
            Some(cookies) => req = req.header(reqwest::header::COOKIE, cookies),
            None => debug!("no session cookie applies to {}", url.host_str().unwrap_or_default()),
        }

        let resp = req.send().await.map_err(|source| FetchFailure::Transport {
            url: url.to_string(),
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchFailure::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        resp.text().await.map_err(|source| FetchFailure::Transport {
            url: url.to_string(),
            source,
        })
    }
}

/* ---------------- Download path ---------------- */

const PARTIAL_SUFFIX: &str = ".crdownload";

fn listing(dir: &Path) -> Vec<(PathBuf, u64)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            meta.is_file().then(|| (e.path(), meta.len()))
        })
        .collect()
}

/// Follows the browser's download events, remembering suggested names.
struct DownloadWatch<'a> {
    tap: &'a DownloadTap,
    dir: &'a Path,
    names: HashMap<String, String>,
}

impl DownloadWatch<'_> {
    /// A completed download's file, or the guid of a canceled one.
    fn drain(&mut self) -> Option<Result<PathBuf, String>> {
        while let Ok(event) = self.tap.try_recv() {
            match event {
                DownloadEvent::Started { guid, file_name } => {
                    debug!("download {guid} started: {file_name}");
                    self.names.insert(guid, file_name);
                }
                DownloadEvent::Completed { guid, path } => {
                    let path = path.or_else(|| self.names.get(&guid).map(|name| self.dir.join(name)));
                    match path {
                        Some(path) if path.is_file() => return Some(Ok(path)),
                        other => debug!("download {guid} completed but {other:?} is not a file"),
                    }
                }
                DownloadEvent::Canceled { guid } => return Some(Err(guid)),
            }
        }
        None
    }
}

/// Waits for a finished file in `dir`. The browser's completion event wins;
/// failing that, a file that is not a partial download, is non-empty and has
/// the same size on two consecutive polls.
pub fn await_download(dir: &Path, events: Option<&DownloadTap>, timeout: Duration, backoff: Backoff) -> Result<PathBuf, FetchFailure> {
    let mut watch = events.map(|tap| DownloadWatch {
        tap,
        dir,
        names: HashMap::new(),
    });
    let mut last: Option<(PathBuf, u64)> = None;
    let outcome = poll_until("interval download", timeout, backoff, || {
        if let Some(done) = watch.as_mut().and_then(DownloadWatch::drain) {
            return Some(done);
        }
        let files = listing(dir);
        if files
            .iter()
            .any(|(p, _)| p.to_string_lossy().ends_with(PARTIAL_SUFFIX))
        {
            last = None;
            return None;
        }
        let candidate = files
            .into_iter()
            .filter(|(_, len)| *len > 0)
            .max_by(|a, b| a.0.cmp(&b.0))?;
        let settled = last.as_ref() == Some(&candidate);
        last = Some(candidate.clone());
        settled.then_some(Ok(candidate.0))
    });
    match outcome {
        Ok(Ok(path)) => Ok(path),
        Ok(Err(guid)) => Err(FetchFailure::DownloadCanceled(guid)),
        Err(elapsed) => Err(FetchFailure::DownloadTimeout {
            dir: dir.to_path_buf(),
            waited: elapsed.waited,
        }),
    }
}

/// Triggers the interval export in the page and returns the downloaded file.
pub fn download_interval<P: PortalPage + ?Sized>(
    page: &P,
    locator: &Locator,
    dir: &Path,
    timeout: Duration,
) -> Result<PathBuf, ScrapeError> {
    let kind = DatasetKind::IntervalKwh;
    fs::create_dir_all(dir).map_err(|e| ScrapeError::io(format!("creating {}", dir.display()), e))?;
    let events = page
        .allow_downloads(dir)
        .map_err(|e| ScrapeError::fetch(kind, FetchFailure::Browser(e.context("enabling downloads"))))?;
    locator.click(page, portal::EXPORT_BUTTON)?;
    let path = await_download(dir, Some(&events), timeout, locator.backoff)
        .map_err(|f| ScrapeError::fetch(kind, f))?;
    info!("interval export saved to {}", path.display());
    Ok(path)
}

const INTERVAL_FORMATS: [&str; 5] = [
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
];

fn interval_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    INTERVAL_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .map(|dt| dt.date())
        .or_else(|| chart_date(raw))
}

fn column(header: &[String], names: &[&str]) -> Option<usize> {
    header.iter().position(|h| {
        let h = h.trim().to_ascii_lowercase();
        names.iter().any(|n| h.contains(n))
    })
}

/// Sums the interval export's readings into one kWh record per day.
pub fn interval_records(path: &Path) -> Result<Vec<UsageRecord>, FetchFailure> {
    let malformed = |reason: String| FetchFailure::MalformedCsv {
        path: path.to_path_buf(),
        reason,
    };
    let text = fs::read_to_string(path).map_err(|e| malformed(e.to_string()))?;
    let mut rows = parse_rows(text.trim_start_matches('\u{feff}')).into_iter();
    let header = rows.next().ok_or_else(|| malformed("no header row".to_string()))?;
    let date_col = column(&header, &["date", "start", "time"])
        .ok_or_else(|| malformed(format!("no date column in {header:?}")))?;
    let usage_col = column(&header, &["kwh", "usage", "consumption", "value"])
        .ok_or_else(|| malformed(format!("no usage column in {header:?}")))?;

    let mut daily: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut skipped = 0;
    for row in rows {
        let date = row.get(date_col).and_then(|d| interval_date(d));
        let usage = row.get(usage_col).and_then(|v| v.trim().parse::<f64>().ok());
        match (date, usage) {
            (Some(date), Some(usage)) => *daily.entry(date).or_default() += usage,
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("skipped {skipped} unreadable interval rows in {}", path.display());
    }
    if daily.is_empty() {
        return Err(FetchFailure::Empty(format!("no interval readings in {}", path.display())));
    }

    Ok(daily
        .into_iter()
        .map(|(date, kwh)| UsageRecord { date, period: None, quantity: round3(kwh) })
        .collect())
}
