//! One run: log in, federate, then walk the usage-history page one meter and
//! period at a time, writing each dataset as soon as it is fetched. Bill
//! history comes last since it leaves the usage page.

use std::fs;
use std::path::PathBuf;

use chrono::{NaiveDate, Utc};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{error, info, warn};

use crate::browser::PortalPage;
use crate::config::Settings;
use crate::dataset::{write_bills, write_reads, write_set, BillSet, Dataset, DatasetKind, ReadSet, UsageRecord, UsageSet};
use crate::error::{FetchFailure, ScrapeError};
use crate::fetch::{self, UsageClient};
use crate::intercept::{EndpointDescriptor, EndpointMatch, Interceptor};
use crate::metrics;
use crate::portal;
use crate::session::{save_screenshot, Negotiator, SessionContext};
use crate::shadow::{Locator, OptionMatch};

pub const ON_DEMAND_SCREENSHOT: &str = "ondemand_error.png";
pub const BILL_HISTORY_SCREENSHOT: &str = "bill_history_error.png";

#[derive(Debug, Clone)]
pub struct WrittenSet {
    pub kind: DatasetKind,
    pub path: PathBuf,
    pub records: usize,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub written: Vec<WrittenSet>,
    /// In the order they happened. A fatal failure is always last.
    pub failures: Vec<ScrapeError>,
    pub metrics: Option<PathBuf>,
}

impl RunReport {
    /// Zero only when nothing failed; otherwise the code of the first failure.
    pub fn exit_code(&self) -> i32 {
        self.failures.first().map(ScrapeError::exit_code).unwrap_or(0)
    }
}

/// Runs a blocking browser interaction without stalling the runtime's other
/// tasks.
fn browser_stage<T>(stage: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(stage),
        _ => stage(),
    }
}

/// Datasets that share one meter selection and one page interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Chart {
        gas: bool,
        time_period: &'static str,
        kinds: [DatasetKind; 2],
    },
    IntervalExport,
    OnDemand,
    BillHistory,
}

const STEPS: [Step; 6] = [
    Step::Chart {
        gas: false,
        time_period: "DAILY",
        kinds: [DatasetKind::ElecDailyKwh, DatasetKind::ElecDailyCost],
    },
    Step::Chart {
        gas: false,
        time_period: "MONTHLY",
        kinds: [DatasetKind::ElecMonthlyKwh, DatasetKind::ElecMonthlyCost],
    },
    Step::Chart {
        gas: true,
        time_period: "MONTHLY",
        kinds: [DatasetKind::GasMonthlyTherms, DatasetKind::GasMonthlyCost],
    },
    Step::IntervalExport,
    Step::OnDemand,
    Step::BillHistory,
];

struct Run<'a, P: PortalPage> {
    page: &'a P,
    settings: &'a Settings,
    session: SessionContext,
    client: UsageClient,
    locator: Locator,
    today: NaiveDate,
    report: &'a mut RunReport,
}

impl<'a, P: PortalPage> Run<'a, P> {
    /// The electric meter by its exact id; the gas meter by a label fragment.
    fn select_meter(&self, gas: bool) -> Result<(), ScrapeError> {
        let option = if gas {
            OptionMatch::Containing(self.settings.gas_meter.clone())
        } else {
            OptionMatch::Exact(self.settings.meter_id.clone())
        };
        self.locator.select_option(self.page, portal::METER_SELECT, &option)?;
        Ok(())
    }

    fn keep(&mut self, dataset: Dataset) -> Result<(), ScrapeError> {
        let dir = &self.settings.output_dir;
        let path = match &dataset {
            Dataset::Usage(set) => write_set(dir, set)?,
            Dataset::Bills(set) => write_bills(dir, set)?,
            Dataset::Reads(set) => write_reads(dir, set)?,
        };
        let (kind, records) = (dataset.kind(), dataset.len());
        info!("{kind}: saved {} ({records} records)", path.display());
        self.report.written.push(WrittenSet { kind, path, records });
        Ok(())
    }

    fn usage(&self, kind: DatasetKind, records: Vec<UsageRecord>) -> Dataset {
        Dataset::Usage(UsageSet { kind, run_date: self.today, records })
    }

    fn dataset_failed(&mut self, kind: DatasetKind, failure: FetchFailure) {
        let e = ScrapeError::fetch(kind, failure);
        warn!("{e}");
        self.report.failures.push(e);
    }

    /// Captures `pattern` while `trigger` runs. A request that never shows
    /// up fails only `kind`, leaving a screenshot behind.
    fn capture_for(
        &mut self,
        kind: DatasetKind,
        pattern: &EndpointMatch,
        screenshot: &str,
        trigger: impl FnOnce() -> Result<(), ScrapeError>,
    ) -> Result<Option<EndpointDescriptor>, ScrapeError> {
        let (page, session) = (self.page, &self.session);
        let interceptor = Interceptor::new(self.settings.timeouts.capture);
        match browser_stage(|| interceptor.capture(page, session, pattern, trigger)) {
            Ok(descriptor) => Ok(Some(descriptor)),
            Err(e @ ScrapeError::EndpointNotObserved { .. }) => {
                warn!("{e}");
                save_screenshot(page, &self.settings.output_dir, screenshot);
                self.dataset_failed(kind, FetchFailure::MissingEndpoint);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn chart(&mut self, gas: bool, time_period: &'static str, kinds: &[DatasetKind]) -> Result<(), ScrapeError> {
        let (page, locator) = (self.page, self.locator);
        // Listening starts before the meter changes: either change may fire the request.
        let descriptor = browser_stage(|| {
            Interceptor::new(self.settings.timeouts.capture).capture(
                page,
                &self.session,
                &EndpointMatch::usage_history(time_period),
                || {
                    self.select_meter(gas)?;
                    locator.select_value(page, portal::TIME_PERIOD_SELECT, time_period).map(|_| ())
                },
            )
        })?;

        for &kind in kinds {
            match self.client.fetch_chart(kind, Some(&descriptor), self.today).await {
                Ok(records) => self.keep(self.usage(kind, records))?,
                Err(failure) => self.dataset_failed(kind, failure),
            }
        }
        Ok(())
    }

    fn interval(&mut self) -> Result<(), ScrapeError> {
        let kind = DatasetKind::IntervalKwh;
        let settings = self.settings;
        let dir = &settings.download_dir;
        let downloaded = browser_stage(|| {
            self.select_meter(false)?;
            fetch::download_interval(self.page, &self.locator, dir, settings.timeouts.download)
        });
        let downloaded = match downloaded {
            Ok(path) => path,
            Err(e) if !e.is_fatal() => {
                warn!("{e}");
                self.report.failures.push(e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let records = fetch::interval_records(&downloaded)
            .and_then(|records| fetch::within_window(kind, self.today, records));
        match records {
            Ok(records) => {
                self.keep(self.usage(kind, records))?;
                if let Err(e) = fs::remove_dir_all(dir) {
                    warn!("could not remove {}: {e}", dir.display());
                }
            }
            Err(failure) => {
                let e = ScrapeError::fetch(kind, failure);
                warn!("{e} (export kept at {})", downloaded.display());
                self.report.failures.push(e);
            }
        }
        Ok(())
    }

    /// Reloads the usage page and keeps the on-demand reads it fetches.
    fn on_demand(&mut self) -> Result<(), ScrapeError> {
        let kind = DatasetKind::OnDemandKwh;
        let page = self.page;
        let usage_url = self.settings.urls.usage_history();
        let trigger = || page.navigate(&usage_url).map_err(|e| ScrapeError::browser("usage history page", e));
        let Some(descriptor) = self.capture_for(kind, &EndpointMatch::on_demand(), ON_DEMAND_SCREENSHOT, trigger)? else {
            return Ok(());
        };

        let url = descriptor.with_params(&[]);
        let (wait, backoff) = (self.settings.timeouts.capture, self.locator.backoff);
        let reads = descriptor
            .request_id
            .as_deref()
            .ok_or(FetchFailure::MissingEndpoint)
            .and_then(|id| browser_stage(|| fetch::read_response(page, id, wait, backoff)))
            .and_then(|body| fetch::on_demand_reads(url.as_str(), &body))
            .and_then(|reads| fetch::reads_within_window(self.today, reads));
        match reads {
            Ok(reads) => self.keep(Dataset::Reads(ReadSet { run_date: self.today, reads })),
            Err(failure) => {
                self.dataset_failed(kind, failure);
                Ok(())
            }
        }
    }

    /// Opens the bill history page and re-requests its account summary for
    /// the whole bill window.
    async fn bill_history(&mut self) -> Result<(), ScrapeError> {
        let kind = DatasetKind::BillHistory;
        let page = self.page;
        let bill_url = self.settings.urls.bill_history();
        info!("opening {bill_url}");
        let trigger = || page.navigate(&bill_url).map_err(|e| ScrapeError::browser("bill history page", e));
        let Some(descriptor) = self.capture_for(kind, &EndpointMatch::bill_summary(), BILL_HISTORY_SCREENSHOT, trigger)? else {
            return Ok(());
        };

        match self.client.fetch_bills(Some(&descriptor), &bill_url, self.today).await {
            Ok(records) => self.keep(Dataset::Bills(BillSet { run_date: self.today, records })),
            Err(failure) => {
                self.dataset_failed(kind, failure);
                Ok(())
            }
        }
    }

    async fn steps(&mut self) -> Result<(), ScrapeError> {
        let settings = self.settings;
        let selected = &settings.datasets;
        for step in STEPS {
            match step {
                Step::Chart { gas, time_period, kinds } => {
                    let wanted: Vec<DatasetKind> = kinds.into_iter().filter(|k| selected.contains(k)).collect();
                    if !wanted.is_empty() {
                        self.chart(gas, time_period, &wanted).await?;
                    }
                }
                Step::IntervalExport => {
                    if selected.contains(&DatasetKind::IntervalKwh) {
                        self.interval()?;
                    }
                }
                Step::OnDemand => {
                    if selected.contains(&DatasetKind::OnDemandKwh) {
                        self.on_demand()?;
                    }
                }
                Step::BillHistory => {
                    if selected.contains(&DatasetKind::BillHistory) {
                        self.bill_history().await?;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn scrape<P: PortalPage>(page: &P, settings: &Settings, today: NaiveDate, report: &mut RunReport) -> Result<(), ScrapeError> {
    let session = browser_stage(|| {
        Negotiator::new(&settings.urls, &settings.timeouts, &settings.output_dir).negotiate(
            page,
            &settings.credentials,
            &settings.browser.user_agent,
        )
    })?;

    let usage_url = settings.urls.usage_history();
    info!("opening {usage_url}");
    browser_stage(|| page.navigate(&usage_url))
        .map_err(|e| ScrapeError::browser("usage history page", e))?;

    let client = UsageClient::new(&session, &usage_url, settings.timeouts.http, settings.timeouts.endpoint_ttl)?;
    let mut walk = Run {
        page,
        settings,
        session,
        client,
        locator: Locator::new(settings.timeouts.control, settings.timeouts.poll),
        today,
        report,
    };
    walk.steps().await
}

/// Runs the whole pipeline on `page`. The page (and its browser) is dropped
/// before the metrics file is regenerated, whatever the outcome.
pub async fn run<P: PortalPage>(page: P, settings: &Settings, today: NaiveDate) -> RunReport {
    let mut report = RunReport::default();
    if let Err(e) = scrape(&page, settings, today, &mut report).await {
        error!("{e}");
        report.failures.push(e);
    }
    drop(page);
    info!("browser closed");

    if report.written.is_empty() {
        warn!("no datasets written; leaving metrics untouched");
    } else {
        match metrics::generate(&settings.output_dir, &settings.prom_dir, Utc::now()) {
            Ok(path) => report.metrics = Some(path),
            Err(e) => {
                error!("{e}");
                report.failures.push(e);
            }
        }
    }
    report
}
