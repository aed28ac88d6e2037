/// Owned HTML tree used by the rewrite engine
///
/// Parsing goes through html5ever into an `RcDom`, which is immediately
/// copied into plain owned nodes so rules can replace or remove subtrees
/// without shared mutable references.
use html5ever::tendril::TendrilSink;
use html5ever::{parse_document, ParseOpts};
use markup5ever_rcdom::{Handle, NodeData, RcDom};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<Attribute>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push(Attribute::new(name, value));
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn attr_mut(&mut self, name: &str) -> Option<&mut String> {
        self.attrs
            .iter_mut()
            .find(|a| a.name == name)
            .map(|a| &mut a.value)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }

    pub fn first_class(&self) -> &str {
        self.classes().next().unwrap_or("")
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes().any(|c| c == class)
    }

    /// Depth-first search for a descendant element with the given tag and,
    /// if `class` is non-empty, carrying that class.
    pub fn find_descendant(&self, tag: &str, class: &str) -> Option<&Element> {
        for child in &self.children {
            if let Node::Element(el) = child {
                if el.name == tag && (class.is_empty() || el.has_class(class)) {
                    return Some(el);
                }
                if let Some(found) = el.find_descendant(tag, class) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Concatenated text of all descendant text nodes
    pub fn text(&self) -> String {
        let mut buf = String::new();
        collect_text(&self.children, &mut buf);
        buf
    }
}

fn collect_text(nodes: &[Node], buf: &mut String) {
    for node in nodes {
        match node {
            Node::Element(el) => collect_text(&el.children, buf),
            Node::Text(text) => buf.push_str(text),
            Node::Comment(_) => {}
        }
    }
}

/// Text content of a list of sibling nodes
pub fn text_of(nodes: &[Node]) -> String {
    let mut buf = String::new();
    collect_text(nodes, &mut buf);
    buf
}

/// Parse a message body and return the content of `<body>`.
pub fn parse_body(input: &str) -> Vec<Node> {
    let dom = parse_document(RcDom::default(), ParseOpts::default()).one(input);
    match find_body(&dom.document) {
        Some(body) => convert_children(&body),
        None => Vec::new(),
    }
}

fn find_body(handle: &Handle) -> Option<Handle> {
    for child in handle.children.borrow().iter() {
        if let NodeData::Element { name, .. } = &child.data {
            if &*name.local == "body" {
                return Some(child.clone());
            }
        }
        if let Some(found) = find_body(child) {
            return Some(found);
        }
    }
    None
}

fn convert_children(handle: &Handle) -> Vec<Node> {
    handle
        .children
        .borrow()
        .iter()
        .filter_map(convert_node)
        .collect()
}

fn convert_node(handle: &Handle) -> Option<Node> {
    match &handle.data {
        NodeData::Text { contents } => Some(Node::Text(contents.borrow().to_string())),
        NodeData::Comment { contents } => Some(Node::Comment(contents.to_string())),
        NodeData::Element { name, attrs, .. } => {
            let attrs = attrs
                .borrow()
                .iter()
                .map(|a| Attribute::new(&*a.name.local, a.value.to_string()))
                .collect();
            Some(Node::Element(Element {
                name: name.local.to_string(),
                attrs,
                children: convert_children(handle),
            }))
        }
        _ => None,
    }
}

/// Serialize nodes back to markup
pub fn render(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        render_node(node, &mut out, false);
    }
    out
}

fn render_node(node: &Node, out: &mut String, raw_text: bool) {
    match node {
        Node::Text(text) if raw_text => out.push_str(text),
        Node::Text(text) => escape_text(text, out),
        Node::Comment(text) => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        }
        Node::Element(el) => {
            out.push('<');
            out.push_str(&el.name);
            for attr in &el.attrs {
                out.push(' ');
                out.push_str(&attr.name);
                out.push_str("=\"");
                escape_attr(&attr.value, out);
                out.push('"');
            }
            if VOID_ELEMENTS.contains(&el.name.as_str()) {
                out.push_str("/>");
                return;
            }
            out.push('>');
            let raw = RAW_TEXT_ELEMENTS.contains(&el.name.as_str());
            for child in &el.children {
                render_node(child, out, raw);
            }
            out.push_str("</");
            out.push_str(&el.name);
            out.push('>');
        }
    }
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => out.push(c),
        }
    }
}
