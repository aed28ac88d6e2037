/// Rewrite rules keyed by (tag name, first CSS class)
use super::dom::{Element, Node};
use super::emoji::unified_to_unicode;
use super::{Attachment, Converter, MediaKind, Rewrite};
use crate::error::Result;
use crate::ids::{LoginId, UserId};

pub type RuleFn = fn(&mut Converter<'_>, &Element) -> Result<Rewrite>;

static RULES: &[(&str, &str, RuleFn)] = &[
    // Channel, topic and message links pass through as plain links for now
    ("a", "stream", decline),
    ("a", "stream-topic", decline),
    ("a", "message-link", decline),
    ("div", "codehilite", code_block),
    ("div", "message_inline_image", inline_media),
    ("div", "spoiler-block", spoiler_block),
    ("span", "emoji", unicode_emoji),
    ("span", "katex-display", math_block),
    ("span", "user-mention", user_mention),
    ("span", "topic-mention", decline),
    // Custom realm emoji are images; not converted yet
    ("img", "emoji", decline),
    ("audio", "", inline_audio),
];

pub fn lookup(tag: &str, first_class: &str) -> Option<RuleFn> {
    RULES
        .iter()
        .find(|(t, c, _)| *t == tag && *c == first_class)
        .map(|(_, _, rule)| *rule)
}

fn decline(_: &mut Converter<'_>, _: &Element) -> Result<Rewrite> {
    Ok(Rewrite::Decline)
}

fn code_block(_: &mut Converter<'_>, el: &Element) -> Result<Rewrite> {
    let mut code = Element::new("code");
    if let Some(lang) = el.attr("data-code-language").filter(|l| !l.is_empty()) {
        code = code.with_attr("class", format!("language-{}", lang.to_lowercase()));
    }
    let code = code.with_child(Node::Text(el.text()));
    Ok(Rewrite::Replace(Node::Element(
        Element::new("pre").with_child(Node::Element(code)),
    )))
}

fn inline_media(conv: &mut Converter<'_>, el: &Element) -> Result<Rewrite> {
    let Some(link) = el.find_descendant("a", "") else {
        return Ok(Rewrite::Decline);
    };
    let Some(href) = link.attr("href") else {
        return Ok(Rewrite::Decline);
    };
    let kind = if link.find_descendant("video", "").is_some() {
        MediaKind::Video
    } else {
        MediaKind::Image
    };
    let file_name = match link.attr("title").filter(|t| !t.is_empty()) {
        Some(title) => title.to_string(),
        None => file_name_from_url(href),
    };
    Ok(Rewrite::Detach(Attachment {
        url: conv.make_absolute_url(href),
        kind,
        file_name,
    }))
}

fn inline_audio(conv: &mut Converter<'_>, el: &Element) -> Result<Rewrite> {
    let Some(src) = el.attr("src") else {
        return Ok(Rewrite::Decline);
    };
    Ok(Rewrite::Detach(Attachment {
        url: conv.make_absolute_url(src),
        kind: MediaKind::Audio,
        file_name: el.attr("title").unwrap_or_default().to_string(),
    }))
}

/// Last path segment with any query string stripped
fn file_name_from_url(href: &str) -> String {
    let path = href.split('?').next().unwrap_or(href);
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit('/').next() {
        Some(last) if !last.is_empty() => last.to_string(),
        _ if path.starts_with('/') => "/".to_string(),
        _ => ".".to_string(),
    }
}

fn spoiler_block(_: &mut Converter<'_>, el: &Element) -> Result<Rewrite> {
    let (Some(header), Some(content)) = (
        el.find_descendant("div", "spoiler-header"),
        el.find_descendant("div", "spoiler-content"),
    ) else {
        return Ok(Rewrite::Decline);
    };
    let span = Element::new("span")
        .with_attr("data-mx-spoiler", header.text())
        .with_children(content.children.clone());
    Ok(Rewrite::Replace(Node::Element(span)))
}

fn unicode_emoji(_: &mut Converter<'_>, el: &Element) -> Result<Rewrite> {
    match el.classes().find(|c| c.starts_with("emoji-")) {
        Some(class) => Ok(Rewrite::Replace(Node::Text(unified_to_unicode(class)))),
        None => Ok(Rewrite::Decline),
    }
}

fn math_block(_: &mut Converter<'_>, el: &Element) -> Result<Rewrite> {
    let Some(annotation) = el.find_descendant("annotation", "") else {
        return Ok(Rewrite::Decline);
    };
    let source = annotation.text();
    let div = Element::new("div")
        .with_attr("data-mx-maths", source.clone())
        .with_child(Node::Text(source));
    Ok(Rewrite::Replace(Node::Element(div)))
}

fn user_mention(conv: &mut Converter<'_>, el: &Element) -> Result<Rewrite> {
    let Some(raw_id) = el.attr("data-user-id") else {
        return Ok(Rewrite::Decline);
    };
    if raw_id == "*" {
        conv.mentions_mut().room = true;
        return Ok(Rewrite::Replace(Node::Text("@room".to_string())));
    }
    let Ok(user_id) = raw_id.parse::<u64>() else {
        return Ok(Rewrite::Decline);
    };
    let ghost = conv.resolver().ghost(UserId(user_id))?;
    let identity = conv.resolver().login(LoginId(user_id))?.unwrap_or(ghost);
    let link = Element::new("a")
        .with_attr("href", identity.uri.clone())
        .with_children(el.children.clone());
    if !el.has_class("silent") {
        conv.mentions_mut().add(identity);
    }
    Ok(Rewrite::Replace(Node::Element(link)))
}
