use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::browser::BrowserOptions;
use crate::dataset::DatasetKind;
use crate::error::ScrapeError;
use crate::portal::{PortalUrls, DEFAULT_ACCOUNT_BASE, DEFAULT_APP_BASE};
use crate::session::Credentials;
use crate::wait::Backoff;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Fetch Xcel Energy usage into dated CSV files and a Prometheus textfile"
)]
pub struct Cli {
    /// Portal login (email)
    #[arg(long, env = "XCEL_USERNAME")]
    pub username: Option<String>,
    /// Portal password
    #[arg(long, env = "XCEL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Electric meter id, matched against the meter dropdown options
    #[arg(long, env = "METER_ID")]
    pub meter_id: Option<String>,
    /// Meter dropdown label that selects the gas meters
    #[arg(long, env = "XCEL_GAS_METER", default_value = "Legacy Gas")]
    pub gas_meter: String,
    /// Directory for dated CSV files and failure screenshots
    #[arg(long, env = "XCEL_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,
    /// Directory the Prometheus textfile is written to
    #[arg(long, env = "XCEL_PROM_DIR")]
    pub prom_dir: Option<PathBuf>,
    /// Datasets to fetch (comma-separated); defaults to daily electric, interval and gas
    #[arg(long, value_enum, value_delimiter = ',')]
    pub datasets: Vec<DatasetKind>,
    /// Only regenerate the textfile from CSVs already in the output dir
    #[arg(long)]
    pub metrics_only: bool,
    /// Run Chrome in headful mode
    #[arg(long)]
    pub headful: bool,
    /// Verbose logging
    #[arg(short, long)]
    pub debug: bool,

    /// Seconds to wait for the login form to attach
    #[arg(long, default_value_t = 30)]
    pub login_form_secs: u64,
    /// Seconds to wait for the post-login redirect
    #[arg(long, default_value_t = 30)]
    pub login_secs: u64,
    /// Seconds to wait for the SSO redirect chain to settle
    #[arg(long, default_value_t = 60)]
    pub sso_secs: u64,
    /// Milliseconds the URL must stay unchanged before SSO counts as settled
    #[arg(long, default_value_t = 1500)]
    pub sso_settle_ms: u64,
    /// Seconds to wait for a shadow-DOM control to mount
    #[arg(long, default_value_t = 20)]
    pub control_secs: u64,
    /// Seconds to wait for the usage endpoint request
    #[arg(long, default_value_t = 15)]
    pub capture_secs: u64,
    /// Seconds to wait for the interval export download
    #[arg(long, default_value_t = 120)]
    pub download_secs: u64,
    /// Per-request HTTP timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub http_secs: u64,
    /// Page navigation timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub navigation_secs: u64,
    /// Captured endpoints older than this many seconds are refused
    #[arg(long, default_value_t = 1800)]
    pub endpoint_ttl_secs: u64,

    #[arg(long, default_value = DEFAULT_ACCOUNT_BASE, hide = true)]
    pub account_base: Url,
    #[arg(long, default_value = DEFAULT_APP_BASE, hide = true)]
    pub app_base: Url,
}

/// Every bounded wait in a run.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub login_form: Duration,
    pub login: Duration,
    pub sso: Duration,
    pub sso_settle: Duration,
    pub control: Duration,
    pub capture: Duration,
    pub download: Duration,
    pub http: Duration,
    pub navigation: Duration,
    pub endpoint_ttl: Duration,
    pub poll: Backoff,
}

impl Timeouts {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            login_form: Duration::from_secs(cli.login_form_secs),
            login: Duration::from_secs(cli.login_secs),
            sso: Duration::from_secs(cli.sso_secs),
            sso_settle: Duration::from_millis(cli.sso_settle_ms),
            control: Duration::from_secs(cli.control_secs),
            capture: Duration::from_secs(cli.capture_secs),
            download: Duration::from_secs(cli.download_secs),
            http: Duration::from_secs(cli.http_secs),
            navigation: Duration::from_secs(cli.navigation_secs),
            endpoint_ttl: Duration::from_secs(cli.endpoint_ttl_secs),
            poll: Backoff::default(),
        }
    }

    #[cfg(test)]
    pub fn quick() -> Self {
        let ms = Duration::from_millis;
        Self {
            login_form: ms(100),
            login: ms(100),
            sso: ms(150),
            sso_settle: ms(10),
            control: ms(200),
            capture: ms(200),
            download: ms(500),
            http: ms(2000),
            navigation: ms(1000),
            endpoint_ttl: Duration::from_secs(60),
            poll: Backoff::fixed(ms(5)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: Credentials,
    pub meter_id: String,
    pub gas_meter: String,
    pub output_dir: PathBuf,
    pub prom_dir: PathBuf,
    pub download_dir: PathBuf,
    pub datasets: Vec<DatasetKind>,
    pub timeouts: Timeouts,
    pub urls: PortalUrls,
    pub browser: BrowserOptions,
}

/// What this invocation will do, after validation.
#[derive(Debug)]
pub enum Plan {
    Fetch(Box<Settings>),
    MetricsOnly { output_dir: PathBuf, prom_dir: PathBuf },
}

/// The value as given, or `None` when it is unset or only whitespace.
fn present(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.trim().is_empty())
}

fn prepare_dir(path: &Path) -> Result<PathBuf, ScrapeError> {
    fs::create_dir_all(path).map_err(|e| ScrapeError::io(format!("creating {}", path.display()), e))?;
    dunce::canonicalize(path).map_err(|e| ScrapeError::io(format!("resolving {}", path.display()), e))
}

impl Plan {
    /// Checks every required input is present before anything is launched.
    pub fn from_cli(cli: &Cli) -> Result<Plan, ScrapeError> {
        let username = present(&cli.username);
        let password = present(&cli.password);
        let meter_id = present(&cli.meter_id).map(|m| m.trim().to_string());

        let mut missing = Vec::new();
        if !cli.metrics_only {
            if username.is_none() {
                missing.push("XCEL_USERNAME");
            }
            if password.is_none() {
                missing.push("XCEL_PASSWORD");
            }
            if meter_id.is_none() {
                missing.push("METER_ID");
            }
        }
        if cli.output_dir.is_none() {
            missing.push("XCEL_OUTPUT_DIR");
        }
        if cli.prom_dir.is_none() {
            missing.push("XCEL_PROM_DIR");
        }
        if !missing.is_empty() {
            return Err(ScrapeError::Configuration(format!("missing {}", missing.join(", "))));
        }

        let (Some(output_dir), Some(prom_dir)) = (&cli.output_dir, &cli.prom_dir) else {
            return Err(ScrapeError::Configuration("missing output directories".to_string()));
        };
        let output_dir = prepare_dir(output_dir)?;
        let prom_dir = prepare_dir(prom_dir)?;
        if cli.metrics_only {
            return Ok(Plan::MetricsOnly { output_dir, prom_dir });
        }

        let (Some(username), Some(password), Some(meter_id)) = (username, password, meter_id) else {
            return Err(ScrapeError::Configuration("missing credentials".to_string()));
        };

        let mut datasets = if cli.datasets.is_empty() {
            DatasetKind::DEFAULT.to_vec()
        } else {
            cli.datasets.clone()
        };
        datasets.sort();
        datasets.dedup();

        let timeouts = Timeouts::from_cli(cli);
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();

        Ok(Plan::Fetch(Box::new(Settings {
            credentials: Credentials { username, password },
            meter_id,
            gas_meter: cli.gas_meter.clone(),
            download_dir: output_dir.join(".downloads").join(stamp),
            output_dir,
            prom_dir,
            datasets,
            browser: BrowserOptions {
                headless: !cli.headful,
                user_agent: ua_generator::ua::spoof_ua().to_string(),
                navigation_timeout: timeouts.navigation,
                idle_timeout: timeouts.sso.max(timeouts.download) + Duration::from_secs(60),
            },
            timeouts,
            urls: PortalUrls::new(cli.account_base.clone(), cli.app_base.clone()),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 6] = [
        "XCEL_USERNAME",
        "XCEL_PASSWORD",
        "METER_ID",
        "XCEL_GAS_METER",
        "XCEL_OUTPUT_DIR",
        "XCEL_PROM_DIR",
    ];

    fn parse(args: &[&str]) -> Cli {
        temp_env::with_vars_unset(VARS, || Cli::parse_from(std::iter::once("xcelbot").chain(args.iter().copied())))
    }

    #[test]
    fn missing_inputs_are_all_named() {
        let cli = parse(&["--username", "u", "--password", "  "]);
        let err = Plan::from_cli(&cli).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("XCEL_PASSWORD"));
        assert!(msg.contains("METER_ID"));
        assert!(msg.contains("XCEL_OUTPUT_DIR"));
        assert!(!msg.contains("XCEL_USERNAME"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn full_inputs_build_fetch_plan() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("data");
        let prom = dir.path().join("prom");
        let cli = parse(&[
            "--username", "u", "--password", "p", "--meter-id", "123",
            "--output-dir", out.to_str().unwrap(),
            "--prom-dir", prom.to_str().unwrap(),
            "--datasets", "gas-monthly-cost,elec-daily-kwh,gas-monthly-cost",
        ]);
        let Plan::Fetch(settings) = Plan::from_cli(&cli).unwrap() else {
            panic!("expected fetch plan");
        };
        assert_eq!(settings.datasets, vec![DatasetKind::ElecDailyKwh, DatasetKind::GasMonthlyCost]);
        assert!(out.is_dir() && prom.is_dir());
        assert!(settings.download_dir.starts_with(&settings.output_dir));
        assert!(settings.browser.headless);
        assert_eq!(settings.gas_meter, "Legacy Gas");
        assert_eq!(settings.timeouts.sso, Duration::from_secs(60));
    }

    #[test]
    fn credentials_keep_surrounding_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let cli = parse(&[
            "--username", "u", "--password", " pass word ", "--meter-id", "123",
            "--output-dir", dir.path().to_str().unwrap(),
            "--prom-dir", dir.path().to_str().unwrap(),
        ]);
        let Plan::Fetch(settings) = Plan::from_cli(&cli).unwrap() else {
            panic!("expected fetch plan");
        };
        assert_eq!(settings.credentials.password, " pass word ");
        assert_eq!(settings.meter_id, "123");
    }

    #[test]
    fn metrics_only_needs_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let cli = parse(&[
            "--metrics-only",
            "--output-dir", dir.path().to_str().unwrap(),
            "--prom-dir", dir.path().to_str().unwrap(),
        ]);
        assert!(matches!(Plan::from_cli(&cli).unwrap(), Plan::MetricsOnly { .. }));
    }

    #[test]
    fn default_datasets_exclude_monthly_electric() {
        let dir = tempfile::tempdir().unwrap();
        let cli = parse(&[
            "--username", "u", "--password", "p", "--meter-id", "1",
            "--output-dir", dir.path().to_str().unwrap(),
            "--prom-dir", dir.path().to_str().unwrap(),
        ]);
        let Plan::Fetch(settings) = Plan::from_cli(&cli).unwrap() else {
            panic!("expected fetch plan");
        };
        assert_eq!(settings.datasets, DatasetKind::DEFAULT.to_vec());
    }
}
