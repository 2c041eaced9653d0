use std::process::ExitCode;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use xcelbot::browser::ChromePage;
use xcelbot::config::{Cli, Plan};
use xcelbot::error::ScrapeError;
use xcelbot::metrics;
use xcelbot::pipeline::{self, RunReport};

#[derive(Serialize)]
struct Written {
    dataset: String,
    path: String,
    records: usize,
}

#[derive(Serialize)]
struct Output {
    written: Vec<Written>,
    failures: Vec<String>,
    metrics_path: Option<String>,
    exit_code: i32,
    elapsed_ms: u64,
}

impl Output {
    fn from_report(report: &RunReport, start: Instant) -> Self {
        Self {
            written: report
                .written
                .iter()
                .map(|w| Written {
                    dataset: w.kind.to_string(),
                    path: w.path.display().to_string(),
                    records: w.records,
                })
                .collect(),
            failures: report.failures.iter().map(|e| e.to_string()).collect(),
            metrics_path: report.metrics.as_ref().map(|p| p.display().to_string()),
            exit_code: report.exit_code(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn failed(e: &ScrapeError, start: Instant) -> Self {
        Self {
            written: Vec::new(),
            failures: vec![e.to_string()],
            metrics_path: None,
            exit_code: e.exit_code(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn setup_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("xcelbot=debug")
        } else {
            EnvFilter::new("xcelbot=info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn print_json<T: Serialize>(v: T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&v)?);
    Ok(())
}

async fn execute(cli: &Cli, start: Instant) -> Result<Output, ScrapeError> {
    match Plan::from_cli(cli)? {
        Plan::MetricsOnly { output_dir, prom_dir } => {
            let path = metrics::generate(&output_dir, &prom_dir, chrono::Utc::now())?;
            Ok(Output::from_report(
                &RunReport {
                    metrics: Some(path),
                    ..RunReport::default()
                },
                start,
            ))
        }
        Plan::Fetch(settings) => {
            info!(datasets = ?settings.datasets, headless = settings.browser.headless, "starting run");
            let page = ChromePage::launch(&settings.browser).map_err(|e| ScrapeError::browser("launch", e))?;
            let today = chrono::Local::now().date_naive();
            let report = pipeline::run(page, &settings, today).await;
            Ok(Output::from_report(&report, start))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.debug);
    let start = Instant::now();

    let output = match execute(&cli, start).await {
        Ok(output) => output,
        Err(e) => {
            error!("{e}");
            Output::failed(&e, start)
        }
    };

    let code = output.exit_code;
    if let Err(e) = print_json(output) {
        error!("could not print summary: {e:#}");
    }
    if code == 0 {
        info!("done in {} ms", start.elapsed().as_millis());
    }
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
