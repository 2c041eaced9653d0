//! Scriptable in-memory page for tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::mpsc::{self, Sender};

use anyhow::{anyhow, bail, Result};
use scraper::{Html, Selector};

use crate::browser::{ControlAction, DownloadEvent, DownloadTap, ObservedRequest, PortalPage, RequestTap, SessionCookie, Tap};
use crate::dom::{DomNode, NodeId};

const NODE_ID_ATTR: &str = "data-fake-node-id";

#[derive(Default)]
pub struct FakeState {
    pub url: String,
    pub elements: HashSet<String>,
    pub cookies: Vec<SessionCookie>,
    pub navigations: Vec<String>,
    pub filled: Vec<(String, String)>,
    pub clicked: Vec<String>,
    pub applied: Vec<(NodeId, ControlAction)>,
    pub screenshots: Vec<PathBuf>,
    pub download_dir: Option<PathBuf>,
    /// `allow_downloads` fails while set.
    pub refuse_downloads: bool,
    pub taps_opened: usize,
    pub taps_detached: usize,
    tap: Option<Sender<ObservedRequest>>,
    downloads: Option<Sender<DownloadEvent>>,
    requests_sent: usize,
    bodies: HashMap<String, String>,
}

impl FakeState {
    /// Emits a request to the attached tap, as the page's JS would, and
    /// returns its request id.
    pub fn fire_request(&mut self, url: &str) -> String {
        self.requests_sent += 1;
        let request_id = format!("fake.{}", self.requests_sent);
        if let Some(tx) = &self.tap {
            let _ = tx.send(ObservedRequest {
                url: url.to_string(),
                request_id: request_id.clone(),
            });
        }
        request_id
    }

    /// A request whose response has finished loading with `body`.
    pub fn fire_response(&mut self, url: &str, body: &str) {
        let request_id = self.fire_request(url);
        self.bodies.insert(request_id, body.to_string());
    }

    /// Writes a finished download into the download dir and reports it.
    pub fn finish_download(&mut self, name: &str, contents: &str) {
        let Some(dir) = &self.download_dir else {
            return;
        };
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        if let Some(tx) = &self.downloads {
            let guid = format!("guid-{name}");
            let _ = tx.send(DownloadEvent::Started {
                guid: guid.clone(),
                file_name: name.to_string(),
            });
            let _ = tx.send(DownloadEvent::Completed { guid, path: Some(path) });
        }
    }

    pub fn cookie(&mut self, name: &str, domain: &str) {
        self.cookies.push(SessionCookie {
            name: name.to_string(),
            value: format!("{name}-value"),
            domain: domain.to_string(),
            path: "/".to_string(),
            secure: true,
        });
    }
}

pub struct FakePage {
    state: Rc<RefCell<FakeState>>,
    dom: RefCell<Box<dyn Fn() -> DomNode>>,
    snapshot: RefCell<Option<DomNode>>,
    on_navigate: RefCell<Box<dyn Fn(&mut FakeState, &str)>>,
    on_click: RefCell<Box<dyn Fn(&mut FakeState, &str)>>,
    on_apply: RefCell<Box<dyn Fn(&mut FakeState, NodeId, &ControlAction)>>,
    closed: Rc<Cell<bool>>,
}

impl FakePage {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(FakeState::default())),
            dom: RefCell::new(Box::new(|| DomNode::fragment(1))),
            snapshot: RefCell::new(None),
            on_navigate: RefCell::new(Box::new(|_, _| {})),
            on_click: RefCell::new(Box::new(|_, _| {})),
            on_apply: RefCell::new(Box::new(|_, _, _| {})),
            closed: Rc::new(Cell::new(false)),
        }
    }

    pub fn set_dom(&self, dom: impl Fn() -> DomNode + 'static) {
        *self.dom.borrow_mut() = Box::new(dom);
    }

    /// Runs after the URL has been set to the navigation target.
    pub fn on_navigate(&self, hook: impl Fn(&mut FakeState, &str) + 'static) {
        *self.on_navigate.borrow_mut() = Box::new(hook);
    }

    pub fn on_click(&self, hook: impl Fn(&mut FakeState, &str) + 'static) {
        *self.on_click.borrow_mut() = Box::new(hook);
    }

    pub fn on_apply(&self, hook: impl Fn(&mut FakeState, NodeId, &ControlAction) + 'static) {
        *self.on_apply.borrow_mut() = Box::new(hook);
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut *self.state.borrow_mut())
    }

    pub fn applied(&self) -> Vec<(NodeId, ControlAction)> {
        self.state.borrow().applied.clone()
    }

    pub fn closed_flag(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.closed)
    }

    /// Shared handle for inspecting state after the page has been dropped.
    pub fn state(&self) -> Rc<RefCell<FakeState>> {
        Rc::clone(&self.state)
    }
}

impl Drop for FakePage {
    fn drop(&mut self) {
        self.closed.set(true);
    }
}

fn find(node: &DomNode, id: NodeId) -> Option<&DomNode> {
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        if n.id == id {
            return Some(n);
        }
        stack.extend(n.children.iter());
        stack.extend(n.shadow_roots.iter());
    }
    None
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

/// Light-DOM markup of `node`'s children, each element tagged with its id.
fn render_children(node: &DomNode, out: &mut String) {
    for child in &node.children {
        if child.is_element() {
            out.push('<');
            out.push_str(&child.tag);
            for (name, value) in &child.attributes {
                out.push_str(&format!(" {name}=\"{}\"", escape(value)));
            }
            out.push_str(&format!(" {NODE_ID_ATTR}=\"{}\">", child.id));
            render_children(child, out);
            out.push_str(&format!("</{}>", child.tag));
        } else if let Some(text) = &child.text {
            out.push_str(&escape(text));
        } else {
            render_children(child, out);
        }
    }
}

impl PortalPage for FakePage {
    fn navigate(&self, url: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.navigations.push(url.to_string());
        state.url = url.to_string();
        (self.on_navigate.borrow())(&mut *state, url);
        Ok(())
    }

    fn current_url(&self) -> String {
        self.state.borrow().url.clone()
    }

    fn has_element(&self, selector: &str) -> bool {
        self.state.borrow().elements.contains(selector)
    }

    fn fill(&self, selector: &str, text: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.elements.contains(selector) {
            bail!("no element {selector}");
        }
        state.filled.push((selector.to_string(), text.to_string()));
        Ok(())
    }

    fn click(&self, selector: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.elements.contains(selector) {
            bail!("no element {selector}");
        }
        state.clicked.push(selector.to_string());
        (self.on_click.borrow())(&mut *state, selector);
        Ok(())
    }

    fn cookies(&self, _urls: &[String]) -> Result<Vec<SessionCookie>> {
        Ok(self.state.borrow().cookies.clone())
    }

    fn screenshot(&self, path: &Path) -> Result<()> {
        std::fs::write(path, b"\x89PNG")?;
        self.state.borrow_mut().screenshots.push(path.to_path_buf());
        Ok(())
    }

    fn dom_snapshot(&self) -> Result<DomNode> {
        let dom = (self.dom.borrow())();
        *self.snapshot.borrow_mut() = Some(dom.clone());
        Ok(dom)
    }

    fn query_selector_all(&self, scope: NodeId, selector: &str) -> Result<Vec<NodeId>> {
        let parsed = Selector::parse(selector).map_err(|e| anyhow!("invalid selector {selector:?}: {e:?}"))?;
        let snapshot = self.snapshot.borrow();
        let root = snapshot.as_ref().ok_or_else(|| anyhow!("no snapshot taken"))?;
        let scope = find(root, scope).ok_or_else(|| anyhow!("no node {scope} in the last snapshot"))?;

        let mut markup = String::new();
        render_children(scope, &mut markup);
        let fragment = Html::parse_fragment(&markup);
        Ok(fragment
            .select(&parsed)
            .filter_map(|el| el.value().attr(NODE_ID_ATTR)?.parse().ok())
            .collect())
    }

    fn apply(&self, node: NodeId, action: &ControlAction) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.applied.push((node, action.clone()));
        (self.on_apply.borrow())(&mut *state, node, action);
        Ok(())
    }

    fn tap_requests(&self) -> Result<RequestTap> {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.state.borrow_mut();
            state.tap = Some(tx);
            state.taps_opened += 1;
        }
        let state = Rc::clone(&self.state);
        Ok(Tap::new(rx, move || {
            let mut state = state.borrow_mut();
            state.tap = None;
            state.taps_detached += 1;
        }))
    }

    fn response_body(&self, request_id: &str) -> Result<String> {
        self.state
            .borrow()
            .bodies
            .get(request_id)
            .cloned()
            .ok_or_else(|| anyhow!("No resource with given identifier found: {request_id}"))
    }

    fn allow_downloads(&self, dir: &Path) -> Result<DownloadTap> {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.state.borrow_mut();
            if state.refuse_downloads {
                bail!("Browser.setDownloadBehavior is not supported");
            }
            state.download_dir = Some(dir.to_path_buf());
            state.downloads = Some(tx);
        }
        let state = Rc::clone(&self.state);
        Ok(Tap::new(rx, move || {
            state.borrow_mut().downloads = None;
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_stay_inside_their_scope() {
        let page = FakePage::new();
        page.set_dom(|| {
            DomNode::fragment(1).with_child(
                DomNode::element(2, "div")
                    .with_attr("class", "toolbar")
                    .with_child(DomNode::element(3, "select").with_attr("disabled", ""))
                    .with_child(DomNode::element(4, "select"))
                    .with_child(
                        DomNode::element(5, "meter-picker").with_shadow_root(DomNode::fragment(6).with_child(DomNode::element(7, "select"))),
                    ),
            )
        });
        page.dom_snapshot().unwrap();
        assert_eq!(page.query_selector_all(1, "select").unwrap(), vec![3, 4]);
        assert_eq!(page.query_selector_all(1, "div.toolbar > select:not([disabled])").unwrap(), vec![4]);
        assert_eq!(page.query_selector_all(6, "select").unwrap(), vec![7]);
        assert!(page.query_selector_all(1, "select[").is_err());
    }
}
