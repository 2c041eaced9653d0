use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::dataset::DatasetKind;

/// Why a single dataset could not be fetched.
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("no endpoint has been captured for this session")]
    MissingEndpoint,
    #[error("endpoint captured {age:?} ago by another session or past its ttl of {ttl:?}")]
    StaleEndpoint { age: Duration, ttl: Duration },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("malformed JSON from {url}: {reason}")]
    MalformedJson { url: String, reason: String },
    #[error("empty payload: {0}")]
    Empty(String),
    #[error("portal rejected {url}: {message}")]
    Rejected { url: String, message: String },
    #[error("no download appeared in {dir} within {waited:?}")]
    DownloadTimeout { dir: PathBuf, waited: Duration },
    #[error("download {0} was canceled by the browser")]
    DownloadCanceled(String),
    #[error("unreadable CSV {path}: {reason}")]
    MalformedCsv { path: PathBuf, reason: String },
    #[error("no records inside the {window} window (received {received})")]
    OutsideWindow { window: String, received: usize },
    #[error(transparent)]
    Browser(anyhow::Error),
}

/// Terminal failures of a run. Every variant names the stage that failed and
/// what was expected versus what was seen.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("authentication failed at {stage}: expected {expected}, observed {observed} (screenshot: {})", display_opt(.screenshot))]
    Authentication {
        stage: &'static str,
        expected: String,
        observed: String,
        screenshot: Option<PathBuf>,
    },

    #[error("SSO did not settle: expected {expected}, observed {observed} (screenshot: {})", display_opt(.screenshot))]
    Sso {
        expected: String,
        observed: String,
        screenshot: Option<PathBuf>,
    },

    #[error("control {selector} not found after {waited:?} ({scanned} nodes scanned)")]
    ControlNotFound {
        selector: String,
        waited: Duration,
        scanned: usize,
    },

    #[error("endpoint matching {pattern} not observed within {waited:?} ({seen} other requests seen)")]
    EndpointNotObserved {
        pattern: String,
        waited: Duration,
        seen: usize,
    },

    #[error("fetching {kind} failed: {failure}")]
    Fetch {
        kind: DatasetKind,
        #[source]
        failure: FetchFailure,
    },

    #[error("browser error during {stage}: {source:#}")]
    Browser {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("rendering metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn display_opt(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl ScrapeError {
    pub fn browser(stage: &'static str, source: anyhow::Error) -> Self {
        ScrapeError::Browser { stage, source }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ScrapeError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn fetch(kind: DatasetKind, failure: FetchFailure) -> Self {
        ScrapeError::Fetch { kind, failure }
    }

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ScrapeError::Configuration(_) => 2,
            ScrapeError::Authentication { .. } => 3,
            ScrapeError::Sso { .. } => 4,
            ScrapeError::ControlNotFound { .. } => 5,
            ScrapeError::EndpointNotObserved { .. } => 6,
            ScrapeError::Fetch { .. } => 7,
            ScrapeError::Browser { .. } => 8,
            ScrapeError::Io { .. } | ScrapeError::Metrics(_) => 9,
        }
    }

    /// Fetch failures are scoped to one dataset; everything else ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ScrapeError::Fetch { .. })
    }
}
