//! Finds controls that live inside (possibly nested) shadow roots of the
//! portal's web components and sets or clicks them.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::browser::{ControlAction, PortalPage};
use crate::dom::{DomNode, NodeId};
use crate::error::ScrapeError;
use crate::wait::{poll_until, Backoff};

/// Bounds on a single traversal of the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SearchLimits {
    /// How many shadow boundaries may be crossed.
    pub max_depth: usize,
    pub max_nodes: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            max_depth: 16,
            max_nodes: 50_000,
        }
    }
}

/// How an `<option>` is picked out of a `<select>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionMatch {
    /// Value equal to the label, or trimmed text equal to it.
    Exact(String),
    /// Value equal to the label, or text containing it.
    Containing(String),
}

impl OptionMatch {
    fn label(&self) -> &str {
        match self {
            OptionMatch::Exact(label) | OptionMatch::Containing(label) => label,
        }
    }

    fn accepts(&self, value: &str, text: &str) -> bool {
        match self {
            OptionMatch::Exact(label) => value == label || text.trim() == label,
            OptionMatch::Containing(label) => value == label || text.contains(label.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControlTarget {
    /// Any CSS selector the browser understands, evaluated per scope.
    pub selector: String,
    /// When set, the control must contain a matching `<option>`.
    pub option: Option<OptionMatch>,
}

/// A control found in one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub node: NodeId,
    pub depth: usize,
    pub option_value: Option<String>,
}

#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub found: Option<Located>,
    pub scanned: usize,
}

impl ControlTarget {
    pub fn new(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            option: None,
        }
    }

    pub fn with_option(mut self, option: OptionMatch) -> Self {
        self.option = Some(option);
        self
    }

    /// `Some(option value)` when `node` qualifies; `Some(None)` when no option is required.
    fn accept(&self, node: Option<&DomNode>) -> Option<Option<String>> {
        let Some(option) = &self.option else {
            return Some(None);
        };
        node?
            .descendants()
            .filter(|n| n.tag == "option")
            .find_map(|opt| {
                let text = opt.text_content();
                let value = opt.attr("value").map(str::to_string).unwrap_or_else(|| text.trim().to_string());
                option.accepts(&value, &text).then_some(value)
            })
            .map(Some)
    }

    fn describe(&self) -> String {
        match &self.option {
            Some(option) => format!("{} with option {:?}", self.selector, option.label()),
            None => self.selector.clone(),
        }
    }
}

/// Depth-first search over scopes: the document first, then each shadow
/// root. The page evaluates the selector inside each scope; a match there
/// wins over anything in the shadow roots of that scope's elements.
pub fn search<P: PortalPage + ?Sized>(page: &P, root: &DomNode, target: &ControlTarget, limits: SearchLimits) -> SearchOutcome {
    let mut scopes: Vec<(&DomNode, usize)> = vec![(root, 0)];
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut scanned = 0;

    while let Some((scope, depth)) = scopes.pop() {
        if !visited.insert(scope.id) {
            continue;
        }
        let mut elements: HashMap<NodeId, &DomNode> = HashMap::new();
        let mut hosted: Vec<&DomNode> = Vec::new();
        let mut stack: Vec<&DomNode> = scope.children.iter().rev().collect();

        while let Some(node) = stack.pop() {
            if !visited.insert(node.id) {
                continue;
            }
            scanned += 1;
            if scanned > limits.max_nodes {
                warn!(scanned, "shadow search hit its node limit");
                return SearchOutcome { found: None, scanned };
            }
            elements.insert(node.id, node);
            if depth < limits.max_depth {
                hosted.extend(node.shadow_roots.iter());
            }
            stack.extend(node.children.iter().rev());
        }

        match page.query_selector_all(scope.id, &target.selector) {
            Ok(matches) => {
                let found = matches
                    .into_iter()
                    .find_map(|id| target.accept(elements.get(&id).copied()).map(|option_value| (id, option_value)));
                if let Some((node, option_value)) = found {
                    return SearchOutcome {
                        found: Some(Located { node, depth, option_value }),
                        scanned,
                    };
                }
            }
            Err(e) => debug!(scope = scope.id, "query {:?} failed: {e:#}", target.selector),
        }

        scopes.extend(hosted.into_iter().rev().map(|r| (r, depth + 1)));
    }

    SearchOutcome { found: None, scanned }
}

/// Re-snapshots the page until the target mounts or the timeout passes.
#[derive(Debug, Clone, Copy)]
pub struct Locator {
    pub timeout: Duration,
    pub backoff: Backoff,
    pub limits: SearchLimits,
}

impl Locator {
    pub fn new(timeout: Duration, backoff: Backoff) -> Self {
        Self {
            timeout,
            backoff,
            limits: SearchLimits::default(),
        }
    }

    pub fn locate<P: PortalPage + ?Sized>(&self, page: &P, target: &ControlTarget) -> Result<Located, ScrapeError> {
        let what = target.describe();
        let start = Instant::now();
        let mut last_scanned = 0;

        let found = poll_until(&what, self.timeout, self.backoff, || {
            let snapshot = match page.dom_snapshot() {
                Ok(s) => s,
                Err(e) => {
                    debug!("snapshot failed, retrying: {e:#}");
                    return None;
                }
            };
            let outcome = search(page, &snapshot, target, self.limits);
            last_scanned = outcome.scanned;
            outcome.found
        });

        match found {
            Ok(located) => {
                debug!(control = %what, depth = located.depth, elapsed_ms = start.elapsed().as_millis() as u64, "control located");
                Ok(located)
            }
            Err(elapsed) => Err(ScrapeError::ControlNotFound {
                selector: what,
                waited: elapsed.waited,
                scanned: last_scanned,
            }),
        }
    }

    fn act<P: PortalPage + ?Sized>(&self, page: &P, located: &Located, action: ControlAction) -> Result<(), ScrapeError> {
        page.apply(located.node, &action)
            .map_err(|e| ScrapeError::browser("control", e))
    }

    /// Sets a `<select>` (or input) to `value`.
    pub fn select_value<P: PortalPage + ?Sized>(&self, page: &P, selector: &str, value: &str) -> Result<Located, ScrapeError> {
        let located = self.locate(page, &ControlTarget::new(selector))?;
        self.act(page, &located, ControlAction::SetValue(value.to_string()))?;
        info!("set {selector} to {value}");
        Ok(located)
    }

    /// Picks the matching option in the first `<select>` that has one.
    pub fn select_option<P: PortalPage + ?Sized>(&self, page: &P, selector: &str, option: &OptionMatch) -> Result<Located, ScrapeError> {
        let located = self.locate(page, &ControlTarget::new(selector).with_option(option.clone()))?;
        let label = option.label();
        let value = located.option_value.clone().unwrap_or_else(|| label.to_string());
        self.act(page, &located, ControlAction::SetValue(value.clone()))?;
        info!("selected {label:?} (value {value:?}) in {selector}");
        Ok(located)
    }

    pub fn click<P: PortalPage + ?Sized>(&self, page: &P, selector: &str) -> Result<Located, ScrapeError> {
        let located = self.locate(page, &ControlTarget::new(selector))?;
        self.act(page, &located, ControlAction::Click)?;
        info!("clicked {selector}");
        Ok(located)
    }
}
