//! Login through the Gigya screen-set, then the IdP-initiated SAML hop to the
//! usage application.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::browser::{PortalPage, SessionCookie};
use crate::config::Timeouts;
use crate::error::ScrapeError;
use crate::portal::{self, PortalUrls};
use crate::wait::poll_until;

pub const LOGIN_SCREENSHOT: &str = "login_error.png";
pub const SSO_SCREENSHOT: &str = "sso_error.png";

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identifies one authenticated session; descriptors captured under another
/// token are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken(Uuid);

impl SessionToken {
    fn fresh() -> Self {
        SessionToken(Uuid::new_v4())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Cookies of an authenticated browser, plus the user agent they were issued to.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub token: SessionToken,
    pub cookies: Vec<SessionCookie>,
    pub user_agent: String,
    pub landing_url: String,
}

impl SessionContext {
    pub fn new(cookies: Vec<SessionCookie>, user_agent: &str, landing_url: &str) -> Self {
        Self {
            token: SessionToken::fresh(),
            cookies,
            user_agent: user_agent.to_string(),
            landing_url: landing_url.to_string(),
        }
    }

    pub fn has_cookie(&self, name: &str) -> bool {
        self.cookies.iter().any(|c| c.name == name)
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    pub fn cookie_header_for(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let secure = url.scheme() == "https";
        let path = url.path();
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .filter(|c| domain_matches(host, &c.domain))
            .filter(|c| path.starts_with(c.path.as_str()))
            .filter(|c| secure || !c.secure || host == "127.0.0.1" || host == "localhost")
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    host.eq_ignore_ascii_case(domain)
        || host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
}

/// Screenshot of the current page into `dir`; a failure is only logged.
pub fn save_screenshot(page: &(impl PortalPage + ?Sized), dir: &Path, name: &str) -> Option<PathBuf> {
    let path = dir.join(name);
    match page.screenshot(&path) {
        Ok(()) => {
            info!("saved screenshot {}", path.display());
            Some(path)
        }
        Err(e) => {
            warn!("could not save screenshot {}: {e:#}", path.display());
            None
        }
    }
}

pub struct Negotiator<'a> {
    pub urls: &'a PortalUrls,
    pub timeouts: &'a Timeouts,
    pub artifacts_dir: &'a Path,
    pub required_cookies: &'a [&'a str],
}

impl<'a> Negotiator<'a> {
    pub fn new(urls: &'a PortalUrls, timeouts: &'a Timeouts, artifacts_dir: &'a Path) -> Self {
        Self {
            urls,
            timeouts,
            artifacts_dir,
            required_cookies: &portal::REQUIRED_SESSION_COOKIES,
        }
    }

    pub fn negotiate<P: PortalPage + ?Sized>(
        &self,
        page: &P,
        credentials: &Credentials,
        user_agent: &str,
    ) -> Result<SessionContext, ScrapeError> {
        self.login(page, credentials)?;
        self.federate(page, user_agent)
    }

    fn capture(&self, page: &(impl PortalPage + ?Sized), name: &str) -> Option<PathBuf> {
        save_screenshot(page, self.artifacts_dir, name)
    }

    fn auth_failure(
        &self,
        page: &(impl PortalPage + ?Sized),
        stage: &'static str,
        expected: String,
        observed: String,
    ) -> ScrapeError {
        ScrapeError::Authentication {
            stage,
            expected,
            observed,
            screenshot: self.capture(page, LOGIN_SCREENSHOT),
        }
    }

    fn login<P: PortalPage + ?Sized>(&self, page: &P, credentials: &Credentials) -> Result<(), ScrapeError> {
        info!("loading login page");
        let login_url = self.urls.login();
        if let Err(e) = page.navigate(&login_url) {
            return Err(self.auth_failure(page, "login page", format!("{login_url} to load"), format!("{e:#}")));
        }

        if let Err(elapsed) = poll_until("login form", self.timeouts.login_form, self.timeouts.poll, || {
            page.has_element(portal::LOGIN_ID_INPUT).then_some(())
        }) {
            return Err(self.auth_failure(
                page,
                "login form",
                format!("instance loginID input within {:?}", self.timeouts.login_form),
                format!("not attached after {:?} at {}", elapsed.waited, page.current_url()),
            ));
        }
        info!("login form ready");

        let submitted = page
            .fill(portal::LOGIN_ID_INPUT, &credentials.username)
            .and_then(|_| page.fill(portal::PASSWORD_INPUT, &credentials.password))
            .and_then(|_| page.click(portal::SUBMIT_INPUT));
        if let Err(e) = submitted {
            return Err(self.auth_failure(page, "credential entry", "fillable login form".to_string(), format!("{e:#}")));
        }

        let left_login = poll_until("post-login redirect", self.timeouts.login, self.timeouts.poll, || {
            let url = page.current_url();
            (!url.contains(portal::LOGIN_PAGE_MARKER)).then_some(url)
        });
        match left_login {
            Ok(url) => {
                info!("logged in, now at {url}");
                Ok(())
            }
            Err(elapsed) => Err(self.auth_failure(
                page,
                "post-login redirect",
                format!("navigation away from {} within {:?}", portal::LOGIN_PAGE_MARKER, self.timeouts.login),
                format!("still at {} after {:?}", page.current_url(), elapsed.waited),
            )),
        }
    }

    fn federate<P: PortalPage + ?Sized>(&self, page: &P, user_agent: &str) -> Result<SessionContext, ScrapeError> {
        info!("starting IdP-initiated SSO to {}", self.urls.app_host());
        if let Err(e) = page.navigate(&self.urls.sso()) {
            // The assertion auto-post can outlive the navigation wait; settling decides.
            warn!("SSO navigation reported: {e:#}");
        }

        let app_host = self.urls.app_host().to_string();
        let cookie_urls = self.urls.cookie_urls();
        let mut last_url = String::new();
        let mut stable_since = Instant::now();
        let mut missing: Vec<String> = self.required_cookies.iter().map(|c| c.to_string()).collect();

        let settled = poll_until("SSO settle", self.timeouts.sso, self.timeouts.poll, || {
            let url = page.current_url();
            if url != last_url {
                last_url = url.clone();
                stable_since = Instant::now();
            }
            let on_app = Url::parse(&url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(&app_host)))
                .unwrap_or(false);
            if !on_app {
                return None;
            }
            let cookies = match page.cookies(&cookie_urls) {
                Ok(c) => c,
                Err(e) => {
                    warn!("reading cookies failed: {e:#}");
                    return None;
                }
            };
            missing = self
                .required_cookies
                .iter()
                .filter(|name| !cookies.iter().any(|c| c.name == **name))
                .map(|name| name.to_string())
                .collect();
            (missing.is_empty() && stable_since.elapsed() >= self.timeouts.sso_settle).then_some((url, cookies))
        });

        match settled {
            Ok((url, cookies)) => {
                let session = SessionContext::new(cookies, user_agent, &url);
                info!(session = %session.token, "SSO complete, now at {url}");
                Ok(session)
            }
            Err(elapsed) => Err(ScrapeError::Sso {
                expected: format!(
                    "{app_host} with cookies {:?}, URL stable for {:?}",
                    self.required_cookies, self.timeouts.sso_settle
                ),
                observed: format!("{last_url} after {:?}, missing {missing:?}", elapsed.waited),
                screenshot: self.capture(page, SSO_SCREENSHOT),
            }),
        }
    }
}
