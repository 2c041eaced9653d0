//! Captures the ajax requests the portal pages fire on load or after a UI
//! change, recovering the account identifiers baked into their query strings.

use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use url::Url;

use crate::browser::PortalPage;
use crate::error::{FetchFailure, ScrapeError};
use crate::portal;
use crate::session::{SessionContext, SessionToken};

/// Which request to capture: a path fragment plus query pairs that must be present.
#[derive(Debug, Clone)]
pub struct EndpointMatch {
    pub fragment: String,
    pub required: Vec<(String, String)>,
}

impl EndpointMatch {
    /// The chart ajax call for one `timePeriod` (`DAILY`, `MONTHLY`).
    pub fn usage_history(time_period: &str) -> Self {
        Self {
            fragment: portal::USAGE_AJAX_FRAGMENT.to_string(),
            required: vec![("timePeriod".to_string(), time_period.to_string())],
        }
    }

    /// The bill history page's account summary call; it carries `custid`.
    pub fn bill_summary() -> Self {
        Self {
            fragment: portal::BILL_AJAX_FRAGMENT.to_string(),
            required: Vec::new(),
        }
    }

    /// The on-demand read call the usage page fires as it loads.
    pub fn on_demand() -> Self {
        Self {
            fragment: portal::ON_DEMAND_AJAX_FRAGMENT.to_string(),
            required: Vec::new(),
        }
    }

    pub fn matches(&self, url: &Url) -> bool {
        url.as_str().contains(&self.fragment)
            && self
                .required
                .iter()
                .all(|(k, v)| url.query_pairs().any(|(qk, qv)| qk == k.as_str() && qv == v.as_str()))
    }

    pub fn describe(&self) -> String {
        let mut out = self.fragment.clone();
        for (k, v) in &self.required {
            out.push_str(&format!(" {k}={v}"));
        }
        out
    }
}

/// A captured endpoint: where it lives and the parameters the page used.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    base: Url,
    params: Vec<(String, String)>,
    session: SessionToken,
    captured_at: Instant,
    /// Protocol id of the captured request, for reading its response.
    pub request_id: Option<String>,
}

impl EndpointDescriptor {
    pub fn from_url(url: &Url, session: &SessionContext) -> Self {
        let params = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let mut base = url.clone();
        base.set_query(None);
        base.set_fragment(None);
        Self {
            base,
            params,
            session: session.token,
            captured_at: Instant::now(),
            request_id: None,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Account number: `custId` on the chart calls, `custid` on the bill calls.
    pub fn customer_id(&self) -> Option<&str> {
        self.param("custId").or_else(|| self.param("custid"))
    }

    pub fn fuel_type(&self) -> Option<&str> {
        self.param("fuelType")
    }

    /// The captured URL with some parameters replaced (or appended), order kept.
    pub fn with_params(&self, overrides: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        {
            let mut query = url.query_pairs_mut();
            for (k, v) in &self.params {
                let v = overrides
                    .iter()
                    .find(|(ok, _)| ok == k)
                    .map(|(_, ov)| *ov)
                    .unwrap_or(v.as_str());
                query.append_pair(k, v);
            }
            for (k, v) in overrides {
                if !self.params.iter().any(|(pk, _)| pk == k) {
                    query.append_pair(k, v);
                }
            }
        }
        url
    }

    /// Refuses descriptors from another session or older than `ttl`.
    pub fn check_fresh(&self, session: &SessionContext, ttl: Duration) -> Result<(), FetchFailure> {
        let age = self.captured_at.elapsed();
        if self.session != session.token || age > ttl {
            return Err(FetchFailure::StaleEndpoint { age, ttl });
        }
        Ok(())
    }
}

pub struct Interceptor {
    pub timeout: Duration,
}

impl Interceptor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Attaches a listener, runs `trigger`, and returns the first request
    /// matching `pattern`. Later matches are ignored; the listener is detached
    /// before returning.
    pub fn capture<P, F>(
        &self,
        page: &P,
        session: &SessionContext,
        pattern: &EndpointMatch,
        trigger: F,
    ) -> Result<EndpointDescriptor, ScrapeError>
    where
        P: PortalPage + ?Sized,
        F: FnOnce() -> Result<(), ScrapeError>,
    {
        let tap = page
            .tap_requests()
            .map_err(|e| ScrapeError::browser("request listener", e))?;
        trigger()?;

        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut seen = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tap.recv_timeout(remaining) {
                Ok(request) => {
                    let Ok(url) = Url::parse(&request.url) else {
                        seen += 1;
                        continue;
                    };
                    if pattern.matches(&url) {
                        let mut descriptor = EndpointDescriptor::from_url(&url, session);
                        descriptor.request_id = Some(request.request_id);
                        info!(
                            cust_id = descriptor.customer_id().unwrap_or("?"),
                            fuel_type = descriptor.fuel_type().unwrap_or("?"),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "captured {}",
                            pattern.describe()
                        );
                        return Ok(descriptor);
                    }
                    debug!("ignoring request {}", request.url);
                    seen += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Err(ScrapeError::EndpointNotObserved {
            pattern: pattern.describe(),
            waited: start.elapsed(),
            seen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ControlAction;
    use crate::fake::FakePage;

    const DAILY_1: &str = "https://usage.example.test/myenergy/usage-history-ajax/format/json?custId=111&fuelType=E&usageType=Q&timePeriod=DAILY";
    const DAILY_2: &str = "https://usage.example.test/myenergy/usage-history-ajax/format/json?custId=222&fuelType=E&usageType=Q&timePeriod=DAILY";

    fn session() -> SessionContext {
        SessionContext::new(vec![], "ua", "https://usage.example.test/")
    }

    #[test]
    fn first_matching_request_wins() {
        let page = FakePage::new();
        page.on_apply(|state, _, _| {
            state.fire_request("https://usage.example.test/static/app.js");
            state.fire_request(DAILY_1);
            state.fire_request(DAILY_2);
        });
        let session = session();

        let descriptor = Interceptor::new(Duration::from_millis(200))
            .capture(&page, &session, &EndpointMatch::usage_history("DAILY"), || {
                page.apply(32, &ControlAction::SetValue("DAILY".into()))
                    .map_err(|e| ScrapeError::browser("test", e))
            })
            .unwrap();

        assert_eq!(descriptor.customer_id(), Some("111"));
        assert_eq!(descriptor.fuel_type(), Some("E"));
        assert_eq!(descriptor.request_id.as_deref(), Some("fake.2"));
        page.with_state(|s| {
            assert_eq!(s.taps_opened, 1);
            assert_eq!(s.taps_detached, 1);
        });
    }

    #[test]
    fn listener_is_attached_before_trigger() {
        let page = FakePage::new();
        let session = session();
        // The trigger fires synchronously; a listener attached afterwards would miss it.
        let descriptor = Interceptor::new(Duration::from_millis(50))
            .capture(&page, &session, &EndpointMatch::usage_history("DAILY"), || {
                page.with_state(|s| s.fire_request(DAILY_2));
                Ok(())
            })
            .unwrap();
        assert_eq!(descriptor.customer_id(), Some("222"));
    }

    #[test]
    fn unmatched_requests_time_out() {
        let page = FakePage::new();
        let session = session();
        let err = Interceptor::new(Duration::from_millis(30))
            .capture(&page, &session, &EndpointMatch::usage_history("MONTHLY"), || {
                page.with_state(|s| s.fire_request(DAILY_1));
                Ok(())
            })
            .unwrap_err();
        match err {
            ScrapeError::EndpointNotObserved { pattern, seen, .. } => {
                assert!(pattern.contains("timePeriod=MONTHLY"));
                assert_eq!(seen, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bill_summary_keeps_lower_case_custid() {
        let page = FakePage::new();
        let session = session();
        let descriptor = Interceptor::new(Duration::from_millis(50))
            .capture(&page, &session, &EndpointMatch::bill_summary(), || {
                page.with_state(|s| {
                    s.fire_request("https://usage.example.test/myenergy/bill-presentment-account-summary-ajax?custid=777&page=true")
                });
                Ok(())
            })
            .unwrap();
        assert_eq!(descriptor.customer_id(), Some("777"));
        let url = descriptor.with_params(&[("page", "false"), ("widget_id", "4907")]);
        assert_eq!(url.query(), Some("custid=777&page=false&widget_id=4907"));
    }

    #[test]
    fn with_params_swaps_usage_type_in_place() {
        let session = session();
        let d = EndpointDescriptor::from_url(&Url::parse(DAILY_1).unwrap(), &session);
        let url = d.with_params(&[("usageType", "C"), ("_", "1")]);
        assert_eq!(
            url.as_str(),
            "https://usage.example.test/myenergy/usage-history-ajax/format/json?custId=111&fuelType=E&usageType=C&timePeriod=DAILY&_=1"
        );
    }

    #[test]
    fn descriptor_from_other_session_is_stale() {
        let first = session();
        let second = session();
        let d = EndpointDescriptor::from_url(&Url::parse(DAILY_1).unwrap(), &first);
        assert!(d.check_fresh(&first, Duration::from_secs(60)).is_ok());
        assert!(matches!(
            d.check_fresh(&second, Duration::from_secs(60)),
            Err(FetchFailure::StaleEndpoint { .. })
        ));
        assert!(d.check_fresh(&first, Duration::ZERO).is_err());
    }
}
