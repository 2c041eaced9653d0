//! Prometheus textfile rendered from the newest CSV of each dataset.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tracing::{debug, info, warn};

use crate::dataset::{read_dataset, Dataset, DatasetKind, READ_TIME_FORMAT};
use crate::error::ScrapeError;

pub const PROM_FILE: &str = "xcel.prom";
const LAST_RUN: &str = "xcel_last_run_timestamp_seconds";

struct MetricDef {
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
}

fn metric_def(kind: DatasetKind) -> MetricDef {
    const DAY: &[&str] = &["date"];
    const DAY_PERIOD: &[&str] = &["date", "period"];
    let (name, help, labels): (&'static str, &'static str, &'static [&'static str]) = match kind {
        DatasetKind::ElecDailyKwh => ("xcel_electric_daily_kwh", "Daily electric usage in kWh by time-of-use period.", DAY_PERIOD),
        DatasetKind::ElecDailyCost => ("xcel_electric_daily_cost_dollars", "Daily electric cost in dollars by time-of-use period.", DAY_PERIOD),
        DatasetKind::IntervalKwh => ("xcel_electric_interval_daily_kwh", "Daily electric usage in kWh summed from interval readings.", DAY),
        DatasetKind::GasMonthlyTherms => ("xcel_gas_monthly_therms", "Monthly gas usage in therms.", DAY),
        DatasetKind::GasMonthlyCost => ("xcel_gas_monthly_cost_dollars", "Monthly gas cost in dollars.", DAY),
        DatasetKind::ElecMonthlyKwh => ("xcel_electric_monthly_kwh", "Monthly electric usage in kWh by time-of-use period.", DAY_PERIOD),
        DatasetKind::ElecMonthlyCost => ("xcel_electric_monthly_cost_dollars", "Monthly electric cost in dollars by time-of-use period.", DAY_PERIOD),
        DatasetKind::BillHistory => ("xcel_bill_charges_dollars", "Billed charges in dollars per billing cycle.", &["date", "charge"]),
        DatasetKind::OnDemandKwh => ("xcel_electric_ondemand_kwh", "Electric usage in kWh from on-demand meter reads.", &["time", "rate_level"]),
    };
    MetricDef { name, help, labels }
}

/// Newest dataset file per kind, by the run date in its name.
pub fn latest_files(data_dir: &Path) -> Result<BTreeMap<DatasetKind, PathBuf>, ScrapeError> {
    let entries = fs::read_dir(data_dir).map_err(|e| ScrapeError::io(format!("listing {}", data_dir.display()), e))?;
    let mut newest: BTreeMap<DatasetKind, (NaiveDate, PathBuf)> = BTreeMap::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let Some((kind, date)) = name.to_str().and_then(DatasetKind::parse_file_name) else {
            continue;
        };
        let slot = newest.entry(kind).or_insert((date, entry.path()));
        if date > slot.0 {
            *slot = (date, entry.path());
        }
    }
    Ok(newest.into_iter().map(|(k, (_, p))| (k, p)).collect())
}

fn set_samples(gauge: &GaugeVec, dataset: &Dataset) {
    match dataset {
        Dataset::Usage(set) => {
            for r in &set.records {
                let date = r.date.to_string();
                match r.period {
                    Some(p) if set.kind.has_periods() => gauge.with_label_values(&[date.as_str(), p.label()]).set(r.quantity),
                    _ if set.kind.has_periods() => gauge.with_label_values(&[date.as_str(), "total"]).set(r.quantity),
                    _ => gauge.with_label_values(&[date.as_str()]).set(r.quantity),
                }
            }
        }
        Dataset::Bills(set) => {
            for r in &set.records {
                let date = r.date.to_string();
                gauge.with_label_values(&[date.as_str(), "electric"]).set(r.electric);
                gauge.with_label_values(&[date.as_str(), "gas"]).set(r.gas);
                gauge.with_label_values(&[date.as_str(), "total"]).set(r.total());
            }
        }
        Dataset::Reads(set) => {
            for r in &set.reads {
                let time = r.at.format(READ_TIME_FORMAT).to_string();
                gauge.with_label_values(&[time.as_str(), r.rate_level.as_str()]).set(r.kwh);
            }
        }
    }
}

/// Text exposition for `datasets`, one gauge family per dataset kind plus the
/// run timestamp.
pub fn render(datasets: &[Dataset], now: DateTime<Utc>) -> Result<String, ScrapeError> {
    let registry = Registry::new();
    let mut families: BTreeMap<DatasetKind, GaugeVec> = BTreeMap::new();
    for dataset in datasets {
        let kind = dataset.kind();
        if !families.contains_key(&kind) {
            let def = metric_def(kind);
            let gauge = GaugeVec::new(Opts::new(def.name, def.help), def.labels)?;
            registry.register(Box::new(gauge.clone()))?;
            families.insert(kind, gauge);
        }
        if let Some(gauge) = families.get(&kind) {
            set_samples(gauge, dataset);
        }
    }

    let last_run = Gauge::with_opts(Opts::new(LAST_RUN, "Unix time the exporter last ran."))?;
    registry.register(Box::new(last_run.clone()))?;
    last_run.set(now.timestamp() as f64);

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| ScrapeError::Metrics(prometheus::Error::Msg(e.to_string())))
}

/// Rebuilds `<prom_dir>/xcel.prom` from the CSVs in `data_dir`.
pub fn generate(data_dir: &Path, prom_dir: &Path, now: DateTime<Utc>) -> Result<PathBuf, ScrapeError> {
    let mut datasets = Vec::new();
    for (kind, path) in latest_files(data_dir)? {
        match read_dataset(&path) {
            Ok(dataset) => {
                debug!("{kind}: {} records from {}", dataset.len(), path.display());
                datasets.push(dataset);
            }
            Err(e) => warn!("skipping {}: {e}", path.display()),
        }
    }

    let text = render(&datasets, now)?;
    let samples = text.lines().filter(|l| !l.is_empty() && !l.starts_with('#')).count();

    let path = prom_dir.join(PROM_FILE);
    let tmp = prom_dir.join(format!(".{PROM_FILE}.tmp"));
    fs::write(&tmp, &text).map_err(|e| ScrapeError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, &path).map_err(|e| ScrapeError::io(format!("renaming to {}", path.display()), e))?;
    info!("wrote {} ({samples} samples from {} datasets)", path.display(), datasets.len());
    Ok(path)
}

/// The value of the first sample of `family` whose line contains `labels`.
#[cfg(test)]
pub(crate) fn sample(text: &str, family: &str, labels: &str) -> Option<f64> {
    text.lines()
        .filter(|l| l.starts_with(family) && l.contains(labels))
        .find_map(|l| l.rsplit(' ').next()?.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{write_bills, write_reads, write_set, BillRecord, BillSet, MeterRead, ReadSet, TouPeriod, UsageRecord, UsageSet};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn renders_labelled_samples_in_order() {
        let datasets = vec![
            Dataset::Usage(UsageSet {
                kind: DatasetKind::GasMonthlyTherms,
                run_date: d("2026-10-17"),
                records: vec![UsageRecord { date: d("2026-10-01"), period: None, quantity: 14.5 }],
            }),
            Dataset::Usage(UsageSet {
                kind: DatasetKind::ElecDailyKwh,
                run_date: d("2026-10-17"),
                records: vec![
                    UsageRecord { date: d("2026-10-16"), period: Some(TouPeriod::OnPeak), quantity: 2.25 },
                    UsageRecord { date: d("2026-10-15"), period: Some(TouPeriod::OffPeak), quantity: 7.125 },
                ],
            }),
        ];
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 6, 0, 0).unwrap();
        let text = render(&datasets, now).unwrap();
        let (families, last) = text.rsplit_once("xcel_last_run_timestamp_seconds ").unwrap();
        assert_eq!(
            families,
            "# HELP xcel_electric_daily_kwh Daily electric usage in kWh by time-of-use period.\n\
             # TYPE xcel_electric_daily_kwh gauge\n\
             xcel_electric_daily_kwh{date=\"2026-10-15\",period=\"off_peak\"} 7.125\n\
             xcel_electric_daily_kwh{date=\"2026-10-16\",period=\"on_peak\"} 2.25\n\
             # HELP xcel_gas_monthly_therms Monthly gas usage in therms.\n\
             # TYPE xcel_gas_monthly_therms gauge\n\
             xcel_gas_monthly_therms{date=\"2026-10-01\"} 14.5\n\
             # HELP xcel_last_run_timestamp_seconds Unix time the exporter last ran.\n\
             # TYPE xcel_last_run_timestamp_seconds gauge\n"
        );
        assert_eq!(last.trim().parse::<f64>().unwrap(), now.timestamp() as f64);
    }

    #[test]
    fn bills_and_reads_get_their_own_families() {
        let datasets = vec![
            Dataset::Bills(BillSet {
                run_date: d("2026-10-17"),
                records: vec![BillRecord { date: d("2026-10-03"), electric: 0.0, gas: 48.13 }],
            }),
            Dataset::Reads(ReadSet {
                run_date: d("2026-10-17"),
                reads: vec![MeterRead {
                    at: d("2026-10-17").and_hms_opt(8, 30, 0).unwrap(),
                    kwh: 1.25,
                    rate_level: "Off Peak".into(),
                    unix_ms: 1_792_229_400_000,
                }],
            }),
        ];
        let text = render(&datasets, Utc::now()).unwrap();
        assert_eq!(sample(&text, "xcel_bill_charges_dollars", "charge=\"gas\",date=\"2026-10-03\""), Some(48.13));
        assert_eq!(sample(&text, "xcel_bill_charges_dollars", "charge=\"total\",date=\"2026-10-03\""), Some(48.13));
        assert_eq!(sample(&text, "xcel_bill_charges_dollars", "charge=\"electric\""), Some(0.0));
        assert_eq!(
            sample(&text, "xcel_electric_ondemand_kwh", "rate_level=\"Off Peak\",time=\"2026-10-17 08:30\""),
            Some(1.25)
        );
    }

    #[test]
    fn newest_file_per_kind_wins() {
        let dir = tempfile::tempdir().unwrap();
        let rec = |q| vec![UsageRecord { date: d("2026-10-01"), period: None, quantity: q }];
        for (run, q) in [("2026-10-10", 1.5), ("2026-10-17", 2.5)] {
            write_set(dir.path(), &UsageSet { kind: DatasetKind::GasMonthlyCost, run_date: d(run), records: rec(q) }).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let latest = latest_files(dir.path()).unwrap();
        assert_eq!(latest.len(), 1);
        assert!(latest[&DatasetKind::GasMonthlyCost].ends_with("bymonth_gas_cost_2026-10-17.csv"));

        let prom = tempfile::tempdir().unwrap();
        let path = generate(dir.path(), prom.path(), Utc::now()).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("xcel_gas_monthly_cost_dollars{date=\"2026-10-01\"} 2.5\n"));
        assert!(!prom.path().join(format!(".{PROM_FILE}.tmp")).exists());
    }

    #[test]
    fn bill_and_read_files_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let run = d("2026-10-17");
        write_bills(dir.path(), &BillSet { run_date: run, records: vec![BillRecord { date: d("2026-09-28"), electric: 112.4, gas: 0.0 }] }).unwrap();
        write_reads(
            dir.path(),
            &ReadSet {
                run_date: run,
                reads: vec![MeterRead { at: run.and_hms_opt(7, 45, 0).unwrap(), kwh: 0.75, rate_level: "On Peak".into(), unix_ms: 1 }],
            },
        )
        .unwrap();
        let text = fs::read_to_string(generate(dir.path(), dir.path(), Utc::now()).unwrap()).unwrap();
        assert_eq!(sample(&text, "xcel_bill_charges_dollars", "charge=\"electric\",date=\"2026-09-28\""), Some(112.4));
        assert_eq!(sample(&text, "xcel_electric_ondemand_kwh", "time=\"2026-10-17 07:45\""), Some(0.75));
    }

    #[test]
    fn empty_data_dir_still_reports_last_run() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let path = generate(dir.path(), dir.path(), now).unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert_eq!(text.matches("# TYPE ").count(), 1);
        assert_eq!(sample(&text, LAST_RUN, ""), Some(now.timestamp() as f64));
    }
}
