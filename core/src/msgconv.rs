/// Message assembly: engine output to an ordered list of parts
use crate::bridge::IdentityResolver;
use crate::error::Result;
use crate::html::{self, Attachment, Mentions, ParsedBody};
use crate::ids::MessageId;
use crate::zulip::MessageData;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConvertedMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_root: Option<MessageId>,
    pub parts: Vec<ConvertedPart>,
}

impl ConvertedMessage {
    /// Single notice, used for synthetic events
    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            thread_root: None,
            parts: vec![ConvertedPart::Notice { body: text.into() }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvertedPart {
    Text(TextPart),
    Media(MediaPart),
    Notice { body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub html: String,
    pub body: String,
    pub mentions: Mentions,
}

impl From<ParsedBody> for TextPart {
    fn from(parsed: ParsedBody) -> Self {
        Self {
            html: parsed.html,
            body: parsed.plain_text,
            mentions: parsed.mentions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaPart {
    pub attachment: Attachment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<TextPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<MediaPayload>,
}

/// Downloaded attachment bytes; only the metadata is serialized
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaPayload {
    pub mime_type: String,
    pub size: usize,
    #[serde(skip)]
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMedia {
    pub mime_type: String,
    pub data: Bytes,
}

/// Downloads attachment bytes on behalf of one login
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia>;
}

/// Convert one message. Attachments are only downloaded when a fetcher is
/// given; otherwise media parts carry the URL alone.
pub async fn convert_message(
    data: &MessageData,
    base_url: &str,
    resolver: &dyn IdentityResolver,
    fetcher: Option<&dyn MediaFetcher>,
) -> Result<ConvertedMessage> {
    let thread_root = (!data.subject.is_empty()).then(|| MessageId::topic(&data.subject));
    let parsed = html::convert(&data.content, base_url, resolver)?;
    let has_text = parsed.has_text();
    let attachments = parsed.attachments.clone();
    let text = TextPart::from(parsed);

    let mut parts = Vec::with_capacity(attachments.len() + 1);
    match attachments.as_slice() {
        [] => parts.push(ConvertedPart::Text(text)),
        [single] if has_text => {
            parts.extend(media_parts(single.clone(), Some(text), fetcher).await);
        }
        many => {
            if has_text {
                parts.push(ConvertedPart::Text(text));
            }
            for attachment in many {
                parts.extend(media_parts(attachment.clone(), None, fetcher).await);
            }
        }
    }
    Ok(ConvertedMessage { thread_root, parts })
}

/// One media part, or the caption followed by a failure notice
async fn media_parts(
    attachment: Attachment,
    caption: Option<TextPart>,
    fetcher: Option<&dyn MediaFetcher>,
) -> Vec<ConvertedPart> {
    let Some(fetcher) = fetcher else {
        return vec![ConvertedPart::Media(MediaPart {
            attachment,
            caption,
            payload: None,
        })];
    };
    match fetcher.fetch(&attachment.url).await {
        Ok(media) => vec![ConvertedPart::Media(MediaPart {
            attachment,
            caption,
            payload: Some(MediaPayload {
                mime_type: media.mime_type,
                size: media.data.len(),
                data: media.data,
            }),
        })],
        Err(e) => {
            warn!("Failed to fetch attachment {}: {}", attachment.url, e);
            let mut parts: Vec<ConvertedPart> =
                caption.into_iter().map(ConvertedPart::Text).collect();
            parts.push(ConvertedPart::Notice {
                body: format!("Failed to fetch attachment: {}", e),
            });
            parts
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HostIdentity;
    use crate::error::BridgeError;
    use crate::html::MediaKind;
    use crate::ids::{LoginId, UserId};
    use crate::zulip::events::DisplayRecipient;

    const BASE: &str = "https://zulip.example";

    struct Ghosts;

    impl IdentityResolver for Ghosts {
        fn ghost(&self, user: UserId) -> Result<HostIdentity> {
            Ok(HostIdentity::new(
                format!("@zulip_{}:example.org", user),
                format!("https://matrix.to/#/@zulip_{}:example.org", user),
            ))
        }

        fn login(&self, _: LoginId) -> Result<Option<HostIdentity>> {
            Ok(None)
        }
    }

    struct Fetcher;

    #[async_trait]
    impl MediaFetcher for Fetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedMedia> {
            if url.contains("missing") {
                return Err(BridgeError::Transport("unexpected status code 404".into()));
            }
            Ok(FetchedMedia {
                mime_type: "image/png".into(),
                data: Bytes::from_static(b"\x89PNG"),
            })
        }
    }

    fn message(subject: &str, content: &str) -> MessageData {
        MessageData {
            id: 100,
            stream_id: if subject.is_empty() { 0 } else { 5 },
            subject: subject.into(),
            sender_id: 12,
            sender_full_name: "Bob".into(),
            sender_email: "bob@zulip.example".into(),
            recipient_id: 0,
            display_recipient: DisplayRecipient::default(),
            timestamp: 1_700_000_000,
            content: content.into(),
        }
    }

    fn image(name: &str) -> String {
        format!(
            r#"<div class="message_inline_image"><a href="/user_uploads/{0}"><img src="/t/{0}"></a></div>"#,
            name
        )
    }

    #[tokio::test]
    async fn test_text_only() {
        let msg = message("general", "<p>hello</p>");
        let converted = convert_message(&msg, BASE, &Ghosts, None).await.unwrap();
        assert_eq!(converted.thread_root, Some(MessageId::topic("general")));
        assert_eq!(converted.parts.len(), 1);
        assert!(matches!(&converted.parts[0], ConvertedPart::Text(t) if t.body == "hello"));
    }

    #[tokio::test]
    async fn test_single_attachment_with_text_is_captioned() {
        let msg = message("", &format!("<p>look</p>{}", image("cat.png")));
        let converted = convert_message(&msg, BASE, &Ghosts, Some(&Fetcher)).await.unwrap();
        assert_eq!(converted.thread_root, None);
        assert_eq!(converted.parts.len(), 1);
        let ConvertedPart::Media(media) = &converted.parts[0] else {
            panic!("expected media part");
        };
        assert_eq!(media.attachment.kind, MediaKind::Image);
        assert_eq!(media.attachment.url, "https://zulip.example/user_uploads/cat.png");
        assert_eq!(media.caption.as_ref().unwrap().html, "<p>look</p>");
        assert_eq!(media.payload.as_ref().unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_single_attachment_without_text() {
        let msg = message("", &image("cat.png"));
        let converted = convert_message(&msg, BASE, &Ghosts, None).await.unwrap();
        assert_eq!(converted.parts.len(), 1);
        assert!(matches!(
            &converted.parts[0],
            ConvertedPart::Media(MediaPart { caption: None, payload: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_many_attachments_keep_order_after_text() {
        let msg = message(
            "",
            &format!("<p>two cats</p>{}{}", image("a.png"), image("b.png")),
        );
        let converted = convert_message(&msg, BASE, &Ghosts, None).await.unwrap();
        assert_eq!(converted.parts.len(), 3);
        assert!(matches!(&converted.parts[0], ConvertedPart::Text(_)));
        let names: Vec<_> = converted.parts[1..]
            .iter()
            .map(|p| match p {
                ConvertedPart::Media(m) => m.attachment.file_name.clone(),
                other => panic!("unexpected part {:?}", other),
            })
            .collect();
        assert_eq!(names, ["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn test_failed_fetch_becomes_notice() {
        let msg = message("", &format!("<p>look</p>{}", image("missing.png")));
        let converted = convert_message(&msg, BASE, &Ghosts, Some(&Fetcher)).await.unwrap();
        assert_eq!(converted.parts.len(), 2);
        assert!(matches!(&converted.parts[0], ConvertedPart::Text(t) if t.body == "look"));
        assert_eq!(
            converted.parts[1],
            ConvertedPart::Notice {
                body: "Failed to fetch attachment: Transport error: unexpected status code 404"
                    .into()
            }
        );
    }
}
