//! Usage records and the dated CSV files they are written to.

use std::fmt;
use std::fs;
use std::mem::take;
use std::path::{Path, PathBuf};

use chrono::{Days, Months, NaiveDate, NaiveDateTime};
use clap::ValueEnum;

use crate::error::ScrapeError;

/// Every dataset the portal can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum DatasetKind {
    ElecDailyKwh,
    ElecDailyCost,
    IntervalKwh,
    GasMonthlyTherms,
    GasMonthlyCost,
    ElecMonthlyKwh,
    ElecMonthlyCost,
    BillHistory,
    OnDemandKwh,
}

/// Time-of-use bucket reported by the electric charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TouPeriod {
    OnPeak,
    OffPeak,
    Total,
}

/// How far back a dataset's records may reach from the run date.
/// `Days(n)` spans `n` calendar dates ending on the run date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Days(u64),
    Months(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub date: NaiveDate,
    pub period: Option<TouPeriod>,
    pub quantity: f64,
}

/// Records of one dataset, tagged with the run date they were fetched on.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSet {
    pub kind: DatasetKind,
    pub run_date: NaiveDate,
    pub records: Vec<UsageRecord>,
}

/// One billing cycle. Electric and gas are billed on different dates, so one
/// side is usually zero.
#[derive(Debug, Clone, PartialEq)]
pub struct BillRecord {
    pub date: NaiveDate,
    pub electric: f64,
    pub gas: f64,
}

impl BillRecord {
    pub fn total(&self) -> f64 {
        round2(self.electric + self.gas)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BillSet {
    pub run_date: NaiveDate,
    pub records: Vec<BillRecord>,
}

/// One on-demand meter read (a 15-minute interval).
#[derive(Debug, Clone, PartialEq)]
pub struct MeterRead {
    pub at: NaiveDateTime,
    pub kwh: f64,
    pub rate_level: String,
    pub unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadSet {
    pub run_date: NaiveDate,
    pub reads: Vec<MeterRead>,
}

/// Any dataset file's contents.
#[derive(Debug, Clone, PartialEq)]
pub enum Dataset {
    Usage(UsageSet),
    Bills(BillSet),
    Reads(ReadSet),
}

impl Dataset {
    pub fn kind(&self) -> DatasetKind {
        match self {
            Dataset::Usage(set) => set.kind,
            Dataset::Bills(_) => DatasetKind::BillHistory,
            Dataset::Reads(_) => DatasetKind::OnDemandKwh,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Dataset::Usage(set) => set.records.len(),
            Dataset::Bills(set) => set.records.len(),
            Dataset::Reads(set) => set.reads.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 9] = [
        DatasetKind::ElecDailyKwh,
        DatasetKind::ElecDailyCost,
        DatasetKind::IntervalKwh,
        DatasetKind::GasMonthlyTherms,
        DatasetKind::GasMonthlyCost,
        DatasetKind::ElecMonthlyKwh,
        DatasetKind::ElecMonthlyCost,
        DatasetKind::BillHistory,
        DatasetKind::OnDemandKwh,
    ];

    /// Datasets fetched when none are named on the command line.
    pub const DEFAULT: [DatasetKind; 5] = [
        DatasetKind::ElecDailyKwh,
        DatasetKind::ElecDailyCost,
        DatasetKind::IntervalKwh,
        DatasetKind::GasMonthlyTherms,
        DatasetKind::GasMonthlyCost,
    ];

    pub fn file_prefix(self) -> &'static str {
        match self {
            DatasetKind::ElecDailyKwh => "byday_kwh",
            DatasetKind::ElecDailyCost => "byday_cost",
            DatasetKind::IntervalKwh => "interval_daily_kwh",
            DatasetKind::GasMonthlyTherms => "bymonth_gas_usage",
            DatasetKind::GasMonthlyCost => "bymonth_gas_cost",
            DatasetKind::ElecMonthlyKwh => "bymonth_elec_kwh",
            DatasetKind::ElecMonthlyCost => "bymonth_elec_cost",
            DatasetKind::BillHistory => "bill_summary",
            DatasetKind::OnDemandKwh => "ondemand",
        }
    }

    pub fn header(self) -> &'static [&'static str] {
        match self {
            DatasetKind::GasMonthlyTherms => &["Date", "Therms"],
            DatasetKind::GasMonthlyCost => &["Date", "Cost"],
            DatasetKind::IntervalKwh => &["Date", "kWh"],
            DatasetKind::BillHistory => &["Date", "Electric Charges", "Gas Charges", "Total"],
            DatasetKind::OnDemandKwh => &["DateTime", "kWh", "rate_level", "unix_ms"],
            _ => &["Date", "On Peak", "Off Peak", "Total"],
        }
    }

    pub fn has_periods(self) -> bool {
        matches!(
            self,
            DatasetKind::ElecDailyKwh | DatasetKind::ElecDailyCost | DatasetKind::ElecMonthlyKwh | DatasetKind::ElecMonthlyCost
        )
    }

    pub fn window(self) -> Window {
        match self {
            DatasetKind::ElecDailyKwh | DatasetKind::ElecDailyCost => Window::Days(30),
            DatasetKind::IntervalKwh | DatasetKind::BillHistory => Window::Months(24),
            // Today's reads, plus yesterday's for a run that straddles midnight.
            DatasetKind::OnDemandKwh => Window::Days(2),
            _ => Window::Months(13),
        }
    }

    /// `usageType` query value the chart endpoint expects.
    pub fn usage_type(self) -> &'static str {
        match self {
            DatasetKind::ElecDailyCost | DatasetKind::GasMonthlyCost | DatasetKind::ElecMonthlyCost => "C",
            _ => "Q",
        }
    }

    pub fn file_name(self, run_date: NaiveDate) -> String {
        format!("{}_{}.csv", self.file_prefix(), run_date.format("%Y-%m-%d"))
    }

    /// Inverse of [`DatasetKind::file_name`].
    pub fn parse_file_name(name: &str) -> Option<(DatasetKind, NaiveDate)> {
        let stem = name.strip_suffix(".csv")?;
        let (prefix, date) = stem.rsplit_once('_')?;
        let kind = DatasetKind::ALL.into_iter().find(|k| k.file_prefix() == prefix)?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        Some((kind, date))
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(v) => f.write_str(v.get_name()),
            None => write!(f, "{self:?}"),
        }
    }
}

impl TouPeriod {
    /// Maps a chart series name ("On Peak", "Off-Peak", ...) to a period.
    pub fn from_series_name(name: &str) -> Option<TouPeriod> {
        let key: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "onpeak" => Some(TouPeriod::OnPeak),
            "offpeak" => Some(TouPeriod::OffPeak),
            "total" => Some(TouPeriod::Total),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TouPeriod::OnPeak => "on_peak",
            TouPeriod::OffPeak => "off_peak",
            TouPeriod::Total => "total",
        }
    }
}

impl Window {
    /// First date inside the window ending on `today`.
    pub fn start(self, today: NaiveDate) -> NaiveDate {
        let start = match self {
            Window::Days(n) => today.checked_sub_days(Days::new(n.saturating_sub(1))),
            Window::Months(n) => today.checked_sub_months(Months::new(n)),
        };
        start.unwrap_or(NaiveDate::MIN)
    }

    pub fn contains(self, today: NaiveDate, date: NaiveDate) -> bool {
        date >= self.start(today) && date <= today
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::Days(n) => write!(f, "{n}-day"),
            Window::Months(n) => write!(f, "{n}-month"),
        }
    }
}

/// Rounds to three decimals, the precision the portal reports kWh in.
pub fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Rounds to cents.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub const READ_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

/* ---------------- Writing ---------------- */

fn write_atomic(dir: &Path, name: &str, text: &str) -> Result<PathBuf, ScrapeError> {
    let path = dir.join(name);
    let tmp = path.with_extension("csv.tmp");
    fs::write(&tmp, text).map_err(|e| ScrapeError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, &path).map_err(|e| ScrapeError::io(format!("renaming to {}", path.display()), e))?;
    Ok(path)
}

/// Writes `set` to `<dir>/<prefix>_<run date>.csv` and returns the path.
pub fn write_set(dir: &Path, set: &UsageSet) -> Result<PathBuf, ScrapeError> {
    write_atomic(dir, &set.kind.file_name(set.run_date), &render_csv(set))
}

pub fn write_bills(dir: &Path, set: &BillSet) -> Result<PathBuf, ScrapeError> {
    write_atomic(dir, &DatasetKind::BillHistory.file_name(set.run_date), &render_bills(set))
}

pub fn write_reads(dir: &Path, set: &ReadSet) -> Result<PathBuf, ScrapeError> {
    write_atomic(dir, &DatasetKind::OnDemandKwh.file_name(set.run_date), &render_reads(set))
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn render_csv(set: &UsageSet) -> String {
    let mut out = set.kind.header().join(",");
    out.push('\n');

    let mut dates: Vec<NaiveDate> = set.records.iter().map(|r| r.date).collect();
    dates.sort();
    dates.dedup();

    for date in dates {
        let on_date = set.records.iter().filter(|r| r.date == date);
        if set.kind.has_periods() {
            let mut on = 0.0;
            let mut off = 0.0;
            let mut total = None;
            for r in on_date {
                match r.period {
                    Some(TouPeriod::OnPeak) => on += r.quantity,
                    Some(TouPeriod::OffPeak) => off += r.quantity,
                    Some(TouPeriod::Total) => total = Some(total.unwrap_or(0.0) + r.quantity),
                    None => {}
                }
            }
            let total = total.unwrap_or(on + off);
            out.push_str(&format!("{},{},{},{}\n", date, round3(on), round3(off), round3(total)));
        } else {
            let sum: f64 = on_date.map(|r| r.quantity).sum();
            out.push_str(&format!("{},{}\n", date, round3(sum)));
        }
    }
    out
}

/// One row per billing cycle, oldest first.
pub fn render_bills(set: &BillSet) -> String {
    let mut out = DatasetKind::BillHistory.header().join(",");
    out.push('\n');
    let mut records: Vec<&BillRecord> = set.records.iter().collect();
    records.sort_by_key(|r| r.date);
    for r in records {
        out.push_str(&format!("{},{},{},{}\n", r.date, round2(r.electric), round2(r.gas), r.total()));
    }
    out
}

/// One row per read, ordered by timestamp.
pub fn render_reads(set: &ReadSet) -> String {
    let mut out = DatasetKind::OnDemandKwh.header().join(",");
    out.push('\n');
    let mut reads: Vec<&MeterRead> = set.reads.iter().collect();
    reads.sort_by_key(|r| r.unix_ms);
    for r in reads {
        out.push_str(&format!(
            "{},{},{},{}\n",
            r.at.format(READ_TIME_FORMAT),
            r.kwh,
            quote(&r.rate_level),
            r.unix_ms
        ));
    }
    out
}

/* ---------------- Reading ---------------- */

/// Minimal CSV parser (quotes + CRLF tolerant).
pub fn parse_rows(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut field = String::new();
    let mut row = Vec::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes && matches!(chars.peek(), Some('"')) {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                row.push(take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => field.push(ch),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

/// Kind, run date and data rows of a dataset file whose header checks out.
fn open_rows(path: &Path) -> Result<(DatasetKind, NaiveDate, Vec<Vec<String>>), ScrapeError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let (kind, run_date) = DatasetKind::parse_file_name(name)
        .ok_or_else(|| ScrapeError::Configuration(format!("{} is not a dataset file", path.display())))?;
    let text = fs::read_to_string(path).map_err(|e| ScrapeError::io(format!("reading {}", path.display()), e))?;

    let mut rows = parse_rows(&text);
    let header = if rows.is_empty() { Vec::new() } else { rows.remove(0) };
    if header.iter().map(String::as_str).ne(kind.header().iter().copied()) {
        return Err(ScrapeError::io(
            format!("reading {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("unexpected header {header:?}")),
        ));
    }
    Ok((kind, run_date, rows))
}

/// Reads any dataset file, picking the layout from its name.
pub fn read_dataset(path: &Path) -> Result<Dataset, ScrapeError> {
    let kind = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(DatasetKind::parse_file_name)
        .map(|(kind, _)| kind);
    Ok(match kind {
        Some(DatasetKind::BillHistory) => Dataset::Bills(read_bills(path)?),
        Some(DatasetKind::OnDemandKwh) => Dataset::Reads(read_reads(path)?),
        _ => Dataset::Usage(read_set(path)?),
    })
}

fn number(cell: Option<&String>) -> Option<f64> {
    cell.and_then(|c| c.trim().parse::<f64>().ok())
}

pub fn read_bills(path: &Path) -> Result<BillSet, ScrapeError> {
    let (_, run_date, rows) = open_rows(path)?;
    let records = rows
        .iter()
        .filter_map(|row| {
            let date = NaiveDate::parse_from_str(row.first()?, "%Y-%m-%d").ok()?;
            Some(BillRecord {
                date,
                electric: number(row.get(1))?,
                gas: number(row.get(2))?,
            })
        })
        .collect();
    Ok(BillSet { run_date, records })
}

pub fn read_reads(path: &Path) -> Result<ReadSet, ScrapeError> {
    let (_, run_date, rows) = open_rows(path)?;
    let reads = rows
        .iter()
        .filter_map(|row| {
            Some(MeterRead {
                at: NaiveDateTime::parse_from_str(row.first()?, READ_TIME_FORMAT).ok()?,
                kwh: number(row.get(1))?,
                rate_level: row.get(2)?.clone(),
                unix_ms: row.get(3)?.trim().parse().ok()?,
            })
        })
        .collect();
    Ok(ReadSet { run_date, reads })
}

/// Reads a CSV this module wrote back into records.
pub fn read_set(path: &Path) -> Result<UsageSet, ScrapeError> {
    let (kind, run_date, rows) = open_rows(path)?;
    if matches!(kind, DatasetKind::BillHistory | DatasetKind::OnDemandKwh) {
        return Err(ScrapeError::io(
            format!("reading {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{kind} is not a usage dataset")),
        ));
    }

    let periods: &[Option<TouPeriod>] = if kind.has_periods() {
        &[Some(TouPeriod::OnPeak), Some(TouPeriod::OffPeak), Some(TouPeriod::Total)]
    } else {
        &[None]
    };

    let mut records = Vec::new();
    for row in rows {
        let Some(date) = row.first().and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()) else {
            continue;
        };
        for (period, cell) in periods.iter().zip(row.iter().skip(1)) {
            if let Ok(quantity) = cell.trim().parse::<f64>() {
                records.push(UsageRecord { date, period: *period, quantity });
            }
        }
    }
    Ok(UsageSet { kind, run_date, records })
}
