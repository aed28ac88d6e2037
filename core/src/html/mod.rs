/// Rendered-HTML conversion engine
///
/// Walks the body of a Zulip message depth-first and applies at most one
/// rule per element (see [`rules`]). Rules can decline, replace the node, or
/// detach it into the attachment list.
pub mod dom;
pub mod emoji;
pub mod rules;

use crate::bridge::{HostIdentity, IdentityResolver};
use crate::error::Result;
use dom::{Element, Node};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

/// Media pulled out of the message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub kind: MediaKind,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mentions {
    pub users: Vec<HostIdentity>,
    pub room: bool,
}

impl Mentions {
    pub fn add(&mut self, identity: HostIdentity) {
        if !self.users.iter().any(|u| u.id == identity.id) {
            self.users.push(identity);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && !self.room
    }
}

/// Output of one conversion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBody {
    pub html: String,
    pub plain_text: String,
    pub attachments: Vec<Attachment>,
    pub mentions: Mentions,
}

impl ParsedBody {
    pub fn has_text(&self) -> bool {
        !self.html.trim().is_empty()
    }
}

/// What a rule decided to do with a node
#[derive(Debug)]
pub enum Rewrite {
    /// Not handled, fall through to generic handling
    Decline,
    /// Swap the node for new content
    Replace(Node),
    /// Drop the node and keep the attachment instead
    Detach(Attachment),
}

enum Outcome {
    Keep,
    Remove,
}

/// Per-message conversion state
pub struct Converter<'a> {
    base_url: &'a str,
    resolver: &'a dyn IdentityResolver,
    attachments: Vec<Attachment>,
    mentions: Mentions,
}

impl<'a> Converter<'a> {
    pub fn new(base_url: &'a str, resolver: &'a dyn IdentityResolver) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/'),
            resolver,
            attachments: Vec::new(),
            mentions: Mentions::default(),
        }
    }

    pub fn resolver(&self) -> &dyn IdentityResolver {
        self.resolver
    }

    pub fn mentions_mut(&mut self) -> &mut Mentions {
        &mut self.mentions
    }

    /// Server-relative paths get the server URL prepended; everything else,
    /// including protocol-relative `//host/...`, is left alone.
    pub fn make_absolute_url(&self, href: &str) -> String {
        if href.starts_with('/') && !href.starts_with("//") {
            format!("{}{}", self.base_url, href)
        } else {
            href.to_string()
        }
    }

    pub fn convert(mut self, input: &str) -> Result<ParsedBody> {
        let mut roots = unwrap_single_paragraph(dom::parse_body(input));
        self.process_children(&mut roots)?;
        Ok(ParsedBody {
            html: dom::render(&roots),
            plain_text: dom::text_of(&roots),
            attachments: self.attachments,
            mentions: self.mentions,
        })
    }

    fn process_children(&mut self, children: &mut Vec<Node>) -> Result<()> {
        let mut i = 0;
        while i < children.len() {
            match self.process_node(&mut children[i])? {
                Outcome::Keep => i += 1,
                Outcome::Remove => {
                    children.remove(i);
                }
            }
        }
        Ok(())
    }

    fn process_node(&mut self, node: &mut Node) -> Result<Outcome> {
        let Node::Element(el) = node else {
            return Ok(Outcome::Keep);
        };
        if let Some(rule) = rules::lookup(&el.name, el.first_class()) {
            match rule(self, el)? {
                Rewrite::Decline => {}
                Rewrite::Replace(new_node) => {
                    *node = new_node;
                    if let Node::Element(el) = node {
                        self.process_children(&mut el.children)?;
                    }
                    return Ok(Outcome::Keep);
                }
                Rewrite::Detach(attachment) => {
                    self.attachments.push(attachment);
                    return Ok(Outcome::Remove);
                }
            }
        }
        if el.name == "a" {
            self.absolutize_href(el);
        }
        self.process_children(&mut el.children)?;
        Ok(Outcome::Keep)
    }

    fn absolutize_href(&self, el: &mut Element) {
        if let Some(href) = el.attr_mut("href") {
            *href = self.make_absolute_url(href);
        }
    }
}

/// A body that is exactly one paragraph is unwrapped to its contents.
fn unwrap_single_paragraph(mut roots: Vec<Node>) -> Vec<Node> {
    if roots.len() == 1 {
        if let Some(Node::Element(el)) = roots.first() {
            if el.name == "p" {
                if let Some(Node::Element(p)) = roots.pop() {
                    return p.children;
                }
            }
        }
    }
    roots
}

/// Convert one rendered message body.
pub fn convert(input: &str, base_url: &str, resolver: &dyn IdentityResolver) -> Result<ParsedBody> {
    Converter::new(base_url, resolver).convert(input)
}
