//! A small labelled HTML tree.
//!
//! The documents handled here come from a report renderer with a fixed,
//! simple shape, so this module only needs what the editor uses: parse to an
//! arena of nodes, look elements up by `id`/class, move nodes around and
//! serialize back to text. It is tolerant of the usual renderer shortcuts
//! (void elements, omitted `</td>`/`</tr>`, raw `<script>` bodies) but does not
//! attempt full HTML5 tree construction.

use std::fmt;

use crate::error::{EditorError, Result};

pub type NodeId = usize;

const ROOT: NodeId = 0;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Element {
            name: name.to_ascii_lowercase(),
            attrs: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.attrs.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(k, _)| k != name);
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    pub fn add_class(&mut self, class: &str) {
        if self.has_class(class) {
            return;
        }
        let classes = match self.attr("class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {}", existing.trim(), class),
            _ => class.to_string(),
        };
        self.set_attr("class", &classes);
    }

    pub fn remove_class(&mut self, class: &str) {
        let Some(existing) = self.attr("class") else {
            return;
        };
        let remaining: Vec<&str> = existing.split_whitespace().filter(|c| *c != class).collect();
        if remaining.is_empty() {
            self.remove_attr("class");
        } else {
            let joined = remaining.join(" ");
            self.set_attr("class", &joined);
        }
    }

    fn is_void(&self) -> bool {
        VOID_ELEMENTS.contains(&self.name.as_str())
    }

    fn is_raw_text(&self) -> bool {
        RAW_TEXT_ELEMENTS.contains(&self.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Document,
    Doctype(String),
    Comment(String),
    Text(String),
    Element(Element),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed markup tree. Detached nodes stay in the arena but are never
/// reached by traversal or serialization.
#[derive(Debug, Clone)]
pub struct Markup {
    nodes: Vec<Node>,
}

impl Default for Markup {
    fn default() -> Self {
        Self::new()
    }
}

impl Markup {
    pub fn new() -> Self {
        Markup {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        Parser::new(input).run()
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    pub fn kind(&self, node: NodeId) -> &NodeKind {
        &self.nodes[node].kind
    }

    pub fn element(&self, node: NodeId) -> Option<&Element> {
        match &self.nodes[node].kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, node: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[node].kind {
            NodeKind::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn tag_name(&self, node: NodeId) -> Option<&str> {
        self.element(node).map(|el| el.name.as_str())
    }

    pub fn is_tag(&self, node: NodeId, name: &str) -> bool {
        self.tag_name(node) == Some(name)
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        self.element(node).and_then(|el| el.attr(name))
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.element(node).is_some_and(|el| el.has_class(class))
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].parent
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.nodes[node].children
    }

    /// Element children only, in document order.
    pub fn child_elements(&self, node: NodeId) -> Vec<NodeId> {
        self.children(node)
            .iter()
            .copied()
            .filter(|&c| self.element(c).is_some())
            .collect()
    }

    /// All descendants of `node` in pre-order, excluding `node` itself.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(node).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    pub fn find_element(&self, scope: NodeId, pred: impl Fn(&Element) -> bool) -> Option<NodeId> {
        self.descendants(scope)
            .into_iter()
            .find(|&n| self.element(n).is_some_and(&pred))
    }

    pub fn find_elements(&self, scope: NodeId, pred: impl Fn(&Element) -> bool) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|&n| self.element(n).is_some_and(&pred))
            .collect()
    }

    /// First element in the document whose `id` attribute equals `id`.
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.find_element(ROOT, |el| el.id() == Some(id))
    }

    /// Every element carrying `id` (renderers reuse issue ids on several markers).
    pub fn elements_by_id(&self, id: &str) -> Vec<NodeId> {
        self.find_elements(ROOT, |el| el.id() == Some(id))
    }

    /// Closest proper ancestor matching `pred`.
    pub fn ancestor(&self, node: NodeId, pred: impl Fn(&Element) -> bool) -> Option<NodeId> {
        let mut current = self.parent(node);
        while let Some(n) = current {
            if self.element(n).is_some_and(&pred) {
                return Some(n);
            }
            current = self.parent(n);
        }
        None
    }

    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        if let NodeKind::Text(t) = self.kind(node) {
            out.push_str(t);
        }
        for n in self.descendants(node) {
            if let NodeKind::Text(t) = self.kind(n) {
                out.push_str(t);
            }
        }
        out
    }

    /// Replace every child of `node` with a single text node.
    pub fn set_text(&mut self, node: NodeId, text: &str) {
        for child in self.children(node).to_vec() {
            self.detach(child);
        }
        let text_node = self.create_text(text);
        self.append_child(node, text_node);
    }

    pub fn create_element(&mut self, element: Element) -> NodeId {
        self.push_node(NodeKind::Element(element))
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push_node(NodeKind::Text(text.to_string()))
    }

    fn push_node(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.detach(child);
        let index = index.min(self.nodes[parent].children.len());
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.insert(index, child);
    }

    pub fn insert_after(&mut self, reference: NodeId, node: NodeId) {
        if let Some(parent) = self.parent(reference) {
            let index = self.index_in_parent(reference).map_or(0, |i| i + 1);
            self.insert_child(parent, index, node);
        }
    }

    pub fn insert_before(&mut self, reference: NodeId, node: NodeId) {
        if let Some(parent) = self.parent(reference) {
            let index = self.index_in_parent(reference).unwrap_or(0);
            self.insert_child(parent, index, node);
        }
    }

    pub fn index_in_parent(&self, node: NodeId) -> Option<usize> {
        let parent = self.parent(node)?;
        self.children(parent).iter().position(|&c| c == node)
    }

    /// Unlink `node` (and its subtree) from its parent.
    pub fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node].parent.take() {
            self.nodes[parent].children.retain(|&c| c != node);
        }
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.write_children(ROOT, &mut out);
        out
    }

    /// Serialize a single node and its subtree.
    pub fn outer_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.write_node(node, &mut out);
        out
    }

    fn write_children(&self, node: NodeId, out: &mut String) {
        for &child in self.children(node) {
            self.write_node(child, out);
        }
    }

    fn write_node(&self, node: NodeId, out: &mut String) {
        match self.kind(node) {
            NodeKind::Document => self.write_children(node, out),
            NodeKind::Doctype(body) => {
                out.push_str("<!");
                out.push_str(body);
                out.push('>');
            }
            NodeKind::Comment(body) => {
                out.push_str("<!--");
                out.push_str(body);
                out.push_str("-->");
            }
            NodeKind::Text(text) => {
                let raw = self
                    .parent(node)
                    .and_then(|p| self.element(p))
                    .is_some_and(Element::is_raw_text);
                if raw {
                    out.push_str(text);
                } else {
                    escape_text(text, out);
                }
            }
            NodeKind::Element(el) => {
                out.push('<');
                out.push_str(&el.name);
                for (name, value) in &el.attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    escape_attr(value, out);
                    out.push('"');
                }
                out.push('>');
                if el.is_void() {
                    return;
                }
                self.write_children(node, out);
                out.push_str("</");
                out.push_str(&el.name);
                out.push('>');
            }
        }
    }
}

impl fmt::Display for Markup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_html())
    }
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

/// Decode the character references a report renderer emits.
pub fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let decoded = rest
            .find(';')
            .filter(|&semi| semi <= 12)
            .and_then(|semi| decode_reference(&rest[1..semi]).map(|c| (c, semi)));
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_reference(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code);
    }
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => None,
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    markup: Markup,
    open: Vec<NodeId>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser {
            src,
            pos: 0,
            markup: Markup::new(),
            open: vec![ROOT],
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn current(&self) -> NodeId {
        self.open.last().copied().unwrap_or(ROOT)
    }

    fn run(mut self) -> Result<Markup> {
        while self.pos < self.src.len() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                let body_end = rest[4..].find("-->").map(|i| i + 4);
                let (body, consumed) = match body_end {
                    Some(end) => (&rest[4..end], end + 3),
                    None => (&rest[4..], rest.len()),
                };
                self.append(NodeKind::Comment(body.to_string()));
                self.pos += consumed;
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                let end = rest
                    .find('>')
                    .ok_or_else(|| EditorError::parse("unterminated declaration"))?;
                self.append(NodeKind::Doctype(rest[2..end].to_string()));
                self.pos += end + 1;
            } else if rest.starts_with("</") {
                let end = rest
                    .find('>')
                    .ok_or_else(|| EditorError::parse("unterminated end tag"))?;
                let name = rest[2..end].trim().to_ascii_lowercase();
                self.close(&name);
                self.pos += end + 1;
            } else if rest.starts_with('<')
                && rest[1..].chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            {
                self.start_tag()?;
            } else {
                let skip = usize::from(rest.starts_with('<'));
                let end = rest[skip..].find('<').map_or(rest.len(), |i| i + skip);
                let text = decode_entities(&rest[..end]);
                self.append(NodeKind::Text(text));
                self.pos += end;
            }
        }
        Ok(self.markup)
    }

    fn append(&mut self, kind: NodeKind) -> NodeId {
        let node = self.markup.push_node(kind);
        let parent = self.current();
        self.markup.append_child(parent, node);
        node
    }

    fn close(&mut self, name: &str) {
        if let Some(i) = self
            .open
            .iter()
            .rposition(|&n| self.markup.is_tag(n, name))
        {
            self.open.truncate(i.max(1));
        }
    }

    /// Close elements the renderer may have left open, without crossing `boundaries`.
    fn close_implied(&mut self, targets: &[&str], boundaries: &[&str]) {
        let mut outermost = None;
        for i in (1..self.open.len()).rev() {
            let Some(tag) = self.markup.tag_name(self.open[i]) else {
                continue;
            };
            if boundaries.contains(&tag) {
                break;
            }
            if targets.contains(&tag) {
                outermost = Some(i);
            }
        }
        if let Some(i) = outermost {
            self.open.truncate(i);
        }
    }

    fn start_tag(&mut self) -> Result<()> {
        let src = self.src;
        let bytes = src.as_bytes();
        let mut i = self.pos + 1;
        let name_start = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-' || bytes[i] == b':') {
            i += 1;
        }
        let mut element = Element::new(&src[name_start..i]);
        let mut self_closing = false;

        loop {
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(EditorError::parse(format!("unterminated <{}> tag", element.name)));
            }
            match bytes[i] {
                b'>' => {
                    i += 1;
                    break;
                }
                b'/' => {
                    i += 1;
                    if bytes.get(i) == Some(&b'>') {
                        self_closing = true;
                        i += 1;
                        break;
                    }
                    continue;
                }
                _ => {}
            }

            let attr_start = i;
            while i < bytes.len()
                && !bytes[i].is_ascii_whitespace()
                && !matches!(bytes[i], b'=' | b'>' | b'/')
            {
                i += 1;
            }
            let attr_name = src[attr_start..i].to_ascii_lowercase();
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            let mut value = String::new();
            if bytes.get(i) == Some(&b'=') {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                match bytes.get(i) {
                    Some(&quote) if quote == b'"' || quote == b'\'' => {
                        let close = src[i + 1..]
                            .find(quote as char)
                            .ok_or_else(|| EditorError::parse("unterminated attribute value"))?;
                        value = decode_entities(&src[i + 1..i + 1 + close]);
                        i += close + 2;
                    }
                    _ => {
                        let value_start = i;
                        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                            i += 1;
                        }
                        value = decode_entities(&src[value_start..i]);
                    }
                }
            }
            if !attr_name.is_empty() && element.attr(&attr_name).is_none() {
                element.attrs.push((attr_name, value));
            }
        }
        self.pos = i;

        match element.name.as_str() {
            "td" | "th" => self.close_implied(&["td", "th"], &["tr", "table"]),
            "tr" => self.close_implied(&["tr", "td", "th"], &["thead", "tbody", "tfoot", "table"]),
            "thead" | "tbody" | "tfoot" => {
                self.close_implied(&["thead", "tbody", "tfoot"], &["table"])
            }
            "li" => self.close_implied(&["li"], &["ul", "ol"]),
            "p" => self.close_implied(&["p"], &["div", "td", "th", "body"]),
            _ => {}
        }

        let is_void = element.is_void();
        let is_raw = element.is_raw_text();
        let name = element.name.clone();
        let node = self.append(NodeKind::Element(element));

        if is_void || self_closing {
            return Ok(());
        }
        if is_raw {
            let rest = self.rest();
            let close = format!("</{name}");
            let end = rest.to_ascii_lowercase().find(&close).unwrap_or(rest.len());
            if end > 0 {
                let text = self.markup.create_text(&rest[..end]);
                self.markup.append_child(node, text);
            }
            self.pos += end;
            if let Some(gt) = self.rest().find('>') {
                self.pos += gt + 1;
            }
            return Ok(());
        }
        self.open.push(node);
        Ok(())
    }
}
