//! The one seam between the pipeline and a real browser.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::{Browser, Element, LaunchOptionsBuilder, Tab};
use tracing::debug;

use crate::dom::{DomNode, NodeId};

/// Cookie as read back from the browser's jar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
}

/// What to do with a control found by the shadow-DOM locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Set `value` and dispatch a bubbling `change` event.
    SetValue(String),
    Click,
}

/// A request the page sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRequest {
    pub url: String,
    /// Protocol request id; the response body is fetched by it.
    pub request_id: String,
}

/// Download lifecycle as the browser reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started { guid: String, file_name: String },
    Completed { guid: String, path: Option<PathBuf> },
    Canceled { guid: String },
}

/// Receives page events while it is alive. Dropping the tap detaches its
/// listener from the page.
pub struct Tap<T> {
    rx: Receiver<T>,
    detach: Option<Box<dyn FnOnce()>>,
}

pub type RequestTap = Tap<ObservedRequest>;
pub type DownloadTap = Tap<DownloadEvent>;

impl<T> Tap<T> {
    pub fn new(rx: Receiver<T>, detach: impl FnOnce() + 'static) -> Self {
        Self {
            rx,
            detach: Some(Box::new(detach)),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }
}

impl<T> Drop for Tap<T> {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Everything the pipeline needs from a browser page.
pub trait PortalPage {
    /// Loads `url` and waits for the navigation to finish.
    fn navigate(&self, url: &str) -> Result<()>;
    fn current_url(&self) -> String;
    /// Top-level (non-shadow) element lookup, no waiting.
    fn has_element(&self, selector: &str) -> bool;
    fn fill(&self, selector: &str, text: &str) -> Result<()>;
    fn click(&self, selector: &str) -> Result<()>;
    fn cookies(&self, urls: &[String]) -> Result<Vec<SessionCookie>>;
    fn screenshot(&self, path: &Path) -> Result<()>;
    /// Whole document with shadow roots pierced.
    fn dom_snapshot(&self) -> Result<DomNode>;
    /// Elements under `scope` (the document or a shadow root of the last
    /// snapshot) matching a CSS selector, in document order. Does not cross
    /// into nested shadow roots.
    fn query_selector_all(&self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>>;
    fn apply(&self, node: NodeId, action: &ControlAction) -> Result<()>;
    fn tap_requests(&self) -> Result<RequestTap>;
    /// Body of a response to a request seen by a tap. Fails until the
    /// response has finished loading.
    fn response_body(&self, request_id: &str) -> Result<String>;
    /// Saves downloads into `dir` instead of prompting, and reports their progress.
    fn allow_downloads(&self, dir: &Path) -> Result<DownloadTap>;
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    pub user_agent: String,
    pub navigation_timeout: Duration,
    pub idle_timeout: Duration,
}

const SET_VALUE_JS: &str = "function(v) { this.value = v; this.dispatchEvent(new Event('change', { bubbles: true })); }";
const CLICK_JS: &str = "function() { this.click(); }";

/// A single Chrome tab. Dropping it closes the browser process.
pub struct ChromePage {
    tab: Arc<Tab>,
    _browser: Browser,
}

impl ChromePage {
    pub fn launch(opts: &BrowserOptions) -> Result<Self> {
        let mut arg_vec: Vec<OsString> = vec![
            OsString::from("--disable-gpu"),
            OsString::from("--disable-dev-shm-usage"),
            OsString::from("--no-first-run"),
            OsString::from("--no-default-browser-check"),
            OsString::from("--hide-scrollbars"),
        ];
        if opts.headless {
            arg_vec.push(OsString::from("--headless=new"));
        }

        let launch_opts = LaunchOptionsBuilder::default()
            .headless(opts.headless)
            .window_size(Some((1366, 900)))
            .idle_browser_timeout(opts.idle_timeout)
            .args(
                arg_vec
                    .iter()
                    .map(|s| s.as_os_str())
                    .collect::<Vec<&OsStr>>(),
            )
            .build()
            .map_err(|e| anyhow!("invalid launch options: {e}"))?;

        let browser = Browser::new(launch_opts)?;
        let tab = browser.new_tab()?;
        tab.set_default_timeout(opts.navigation_timeout);
        tab.set_user_agent(&opts.user_agent, Some("en-US"), None)?;
        debug!("chrome launched");

        Ok(Self { tab, _browser: browser })
    }

    fn enable_network(&self) -> Result<()> {
        use headless_chrome::protocol::cdp::Network;

        self.tab.call_method(Network::Enable {
            max_total_buffer_size: None,
            max_resource_buffer_size: None,
            max_post_data_size: None,
            report_direct_socket_traffic: None,
            enable_durable_messages: None,
        })?;
        Ok(())
    }
}

impl Drop for ChromePage {
    fn drop(&mut self) {
        debug!("closing chrome");
    }
}

fn convert_node(node: &headless_chrome::protocol::cdp::DOM::Node) -> DomNode {
    let attributes = node
        .attributes
        .as_deref()
        .unwrap_or_default()
        .chunks(2)
        .filter_map(|pair| match pair {
            [name, value] => Some((name.clone(), value.clone())),
            _ => None,
        })
        .collect();

    DomNode {
        id: node.node_id,
        tag: node.local_name.to_ascii_lowercase(),
        attributes,
        text: (node.node_type == 3).then(|| node.node_value.clone()),
        children: node
            .children
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(convert_node)
            .collect(),
        shadow_roots: node
            .shadow_roots
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(convert_node)
            .collect(),
    }
}

impl PortalPage for ChromePage {
    fn navigate(&self, url: &str) -> Result<()> {
        self.tab.navigate_to(url)?.wait_until_navigated()?;
        Ok(())
    }

    fn current_url(&self) -> String {
        self.tab.get_url()
    }

    fn has_element(&self, selector: &str) -> bool {
        self.tab.find_element(selector).is_ok()
    }

    fn fill(&self, selector: &str, text: &str) -> Result<()> {
        self.tab.find_element(selector)?.click()?;
        self.tab.type_str(text)?;
        Ok(())
    }

    fn click(&self, selector: &str) -> Result<()> {
        self.tab.find_element(selector)?.click()?;
        Ok(())
    }

    fn cookies(&self, urls: &[String]) -> Result<Vec<SessionCookie>> {
        use headless_chrome::protocol::cdp::Network;

        self.enable_network()?;
        let got = self.tab.call_method(Network::GetCookies {
            urls: Some(urls.to_vec()),
        })?;
        Ok(got
            .cookies
            .into_iter()
            .map(|c| SessionCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                secure: c.secure,
            })
            .collect())
    }

    fn screenshot(&self, path: &Path) -> Result<()> {
        use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;

        let png = self
            .tab
            .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
        std::fs::write(path, png)?;
        Ok(())
    }

    fn dom_snapshot(&self) -> Result<DomNode> {
        use headless_chrome::protocol::cdp::DOM;

        let doc = self.tab.call_method(DOM::GetDocument {
            depth: Some(64),
            pierce: Some(true),
        })?;
        Ok(convert_node(&doc.root))
    }

    fn query_selector_all(&self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        use headless_chrome::protocol::cdp::DOM;

        let found = self.tab.call_method(DOM::QuerySelectorAll {
            node_id: scope,
            selector: selector.to_string(),
        })?;
        Ok(found.node_ids)
    }

    fn apply(&self, node: NodeId, action: &ControlAction) -> Result<()> {
        let element = Element::new(&self.tab, node)?;
        match action {
            ControlAction::SetValue(value) => {
                element.call_js_fn(SET_VALUE_JS, vec![serde_json::json!(value)], false)?
            }
            ControlAction::Click => element.call_js_fn(CLICK_JS, vec![], false)?,
        };
        Ok(())
    }

    fn tap_requests(&self) -> Result<RequestTap> {
        self.enable_network()?;

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let listener = self.tab.add_event_listener(Arc::new(move |event: &Event| {
            if let Event::NetworkRequestWillBeSent(sent) = event {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(ObservedRequest {
                        url: sent.params.request.url.clone(),
                        request_id: sent.params.request_id.clone(),
                    });
                }
            }
        }))?;

        let tab = Arc::clone(&self.tab);
        Ok(Tap::new(rx, move || {
            if let Err(e) = tab.remove_event_listener(&listener) {
                debug!("failed to detach request listener: {e:#}");
            }
        }))
    }

    fn response_body(&self, request_id: &str) -> Result<String> {
        use headless_chrome::protocol::cdp::Network;

        let got = self.tab.call_method(Network::GetResponseBody {
            request_id: request_id.to_string(),
        })?;
        if got.base_64_encoded {
            bail!("response {request_id} is binary");
        }
        Ok(got.body)
    }

    fn allow_downloads(&self, dir: &Path) -> Result<DownloadTap> {
        use headless_chrome::protocol::cdp::Browser::{
            DownloadProgressEventStateOption, SetDownloadBehavior, SetDownloadBehaviorBehaviorOption,
        };

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let listener = self.tab.add_event_listener(Arc::new(move |event: &Event| {
            let update = match event {
                Event::BrowserDownloadWillBegin(begin) => DownloadEvent::Started {
                    guid: begin.params.guid.clone(),
                    file_name: begin.params.suggested_filename.clone(),
                },
                Event::BrowserDownloadProgress(progress) => match progress.params.state {
                    DownloadProgressEventStateOption::Completed => DownloadEvent::Completed {
                        guid: progress.params.guid.clone(),
                        path: progress.params.file_path.as_ref().map(PathBuf::from),
                    },
                    DownloadProgressEventStateOption::Canceled => DownloadEvent::Canceled {
                        guid: progress.params.guid.clone(),
                    },
                    DownloadProgressEventStateOption::InProgress => return,
                },
                _ => return,
            };
            if let Ok(tx) = tx.lock() {
                let _ = tx.send(update);
            }
        }))?;

        let enabled = self.tab.call_method(SetDownloadBehavior {
            behavior: SetDownloadBehaviorBehaviorOption::Allow,
            browser_context_id: None,
            download_path: Some(dir.display().to_string()),
            events_enabled: Some(true),
        });
        if let Err(e) = enabled {
            let _ = self.tab.remove_event_listener(&listener);
            return Err(e);
        }

        let tab = Arc::clone(&self.tab);
        Ok(Tap::new(rx, move || {
            if let Err(e) = tab.remove_event_listener(&listener) {
                debug!("failed to detach download listener: {e:#}");
            }
        }))
    }
}
