//! A pierced snapshot of the page DOM. Selector matching is left to the
//! browser; the snapshot supplies node ids, shadow roots and option text.

/// Protocol node id; only valid until the next snapshot is taken.
pub type NodeId = u32;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomNode {
    pub id: NodeId,
    /// Lower-case element name, empty for document, text and shadow-root nodes.
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<DomNode>,
    pub shadow_roots: Vec<DomNode>,
}

impl DomNode {
    pub fn element(id: NodeId, tag: &str) -> Self {
        Self {
            id,
            tag: tag.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    /// Document or shadow-root container.
    pub fn fragment(id: NodeId) -> Self {
        Self { id, ..Self::default() }
    }

    pub fn text_node(id: NodeId, text: &str) -> Self {
        Self {
            id,
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_child(mut self, child: DomNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_shadow_root(mut self, root: DomNode) -> Self {
        self.shadow_roots.push(root);
        self
    }

    pub fn is_element(&self) -> bool {
        !self.tag.is_empty()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Concatenated text of the light-DOM subtree.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let Some(t) = &node.text {
                out.push_str(t);
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Light-DOM descendants (shadow roots are not entered), in document order.
    pub fn descendants(&self) -> impl Iterator<Item = &DomNode> {
        let mut stack: Vec<&DomNode> = self.children.iter().rev().collect();
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }
}
